//! Connection pool, embedded migrations and the blocking-pool bridge.

use actix_web::web;
use anyhow::{anyhow, Context};
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, PooledConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use uuid::Uuid;

use crate::config::Settings;
use crate::crypto::{self, CryptoError, EncryptionService};
use crate::error::{ApiError, Result};
use crate::models::{EncryptionKey, NewEncryptionKey};
use crate::schema::encryption_keys;

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn create_pool(settings: &Settings) -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&settings.database_url);
    r2d2::Pool::builder()
        .max_size(settings.database_pool_size)
        .build(manager)
        .context("failed to create database pool")
}

/// A pool that opens connections on first use. Lets the HTTP surface be
/// exercised without a reachable database.
pub fn lazy_pool(database_url: &str, max_size: u32) -> DbPool {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(std::time::Duration::from_secs(2))
        .build_unchecked(manager)
}

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = pool.get().context("failed to get connection for migrations")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!("failed to run migrations: {e}"))?;
    for version in &applied {
        tracing::info!(%version, "Applied migration");
    }
    Ok(())
}

/// Runs diesel work on actix's blocking thread pool.
pub async fn run<F, T>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    web::block(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

pub async fn health_check(pool: &DbPool) -> bool {
    let result = run(pool, |conn| {
        diesel::sql_query("SELECT 1").execute(conn)?;
        Ok(())
    })
    .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            false
        }
    }
}

/// Records the master key fingerprint and returns its key id.
///
/// A fingerprint seen for the first time becomes the only active key; any
/// previously active key is retired. Starting with a key that has already
/// been retired is refused.
pub fn register_master_key(conn: &mut PgConnection, crypto: &EncryptionService) -> Result<Uuid> {
    let fingerprint = crypto.fingerprint();
    let iterations = i32::try_from(crypto.iterations())
        .map_err(|_| ApiError::Internal("KDF iteration count out of range".into()))?;

    conn.transaction(|conn| {
        let existing = encryption_keys::table
            .filter(encryption_keys::fingerprint.eq(&fingerprint))
            .select(EncryptionKey::as_select())
            .first(conn)
            .optional()?;

        if let Some(key) = existing {
            if !key.active {
                return Err(ApiError::Crypto(CryptoError::RetiredKey));
            }
            return Ok(key.id);
        }

        let retired = diesel::update(encryption_keys::table.filter(encryption_keys::active.eq(true)))
            .set((
                encryption_keys::active.eq(false),
                encryption_keys::retired_at.eq(Some(Utc::now())),
            ))
            .execute(conn)?;
        if retired > 0 {
            tracing::warn!(retired, "Retired previous master key");
        }

        let id = Uuid::new_v4();
        diesel::insert_into(encryption_keys::table)
            .values(&NewEncryptionKey {
                id,
                fingerprint: &fingerprint,
                algorithm: crypto::ALGORITHM,
                kdf: crypto::KDF,
                kdf_iterations: iterations,
                active: true,
            })
            .execute(conn)?;
        tracing::info!(key_id = %id, "Registered master key");
        Ok(id)
    })
}

/// Refuses rows sealed under a key that is no longer active.
pub fn ensure_key_active(conn: &mut PgConnection, key_id: Option<Uuid>) -> Result<()> {
    let Some(key_id) = key_id else {
        return Ok(());
    };

    let active = encryption_keys::table
        .find(key_id)
        .select(encryption_keys::active)
        .first::<bool>(conn)
        .optional()?;

    match active {
        Some(true) => Ok(()),
        _ => {
            tracing::warn!(key_id = %key_id, "Refusing to decrypt row under retired key");
            Err(ApiError::Crypto(CryptoError::RetiredKey))
        }
    }
}
