use std::time::Duration;

use actix_cors::Cors;
use actix_web::{http::header, rt, web, HttpServer};
use anyhow::Context;

use medivault::config::Settings;
use medivault::logging::init_logging;
use medivault::middleware::RateLimiter;
use medivault::security::SessionService;
use medivault::{build_app, db, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_logging(&settings)?;

    let pool = db::create_pool(&settings)?;
    db::run_migrations(&pool)?;

    let state = AppState::build(settings, pool.clone())?;
    let crypto = state.crypto.clone();
    let key_id = db::run(&pool, move |conn| db::register_master_key(conn, &crypto))
        .await
        .context("failed to register master key")?;
    let state = state.with_active_key(key_id);
    let settings = state.settings.clone();

    let limiter = web::Data::new(RateLimiter::from_settings(&settings));
    spawn_housekeeping(
        pool.clone(),
        state.sessions.clone(),
        limiter.clone(),
        Duration::from_secs(settings.session_cleanup_interval_seconds),
    );

    let bind = (settings.host.clone(), settings.port);
    tracing::info!(host = %bind.0, port = bind.1, "Starting MediVault API");

    let cors_origins = settings.cors_origins.clone();
    HttpServer::new(move || {
        let cors = cors_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
            .supports_credentials()
            .max_age(3600);
        build_app(state.clone(), limiter.clone()).wrap(cors)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}

/// Periodically drops expired sessions and idle rate-limit buckets.
fn spawn_housekeeping(
    pool: db::DbPool,
    sessions: SessionService,
    limiter: web::Data<RateLimiter>,
    every: Duration,
) {
    rt::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let sessions = sessions.clone();
            match db::run(&pool, move |conn| sessions.cleanup_expired_sessions(conn)).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Expired sessions removed");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "Session cleanup failed"),
            }
            let purged = limiter.purge_idle();
            if purged > 0 {
                tracing::debug!(purged, "Idle rate-limit buckets dropped");
            }
        }
    });
}
