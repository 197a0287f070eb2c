//! Bearer sessions and login bookkeeping.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::audit::{AuditEntry, AuditService, ClientInfo};
use super::password::PasswordService;
use crate::config::Settings;
use crate::crypto;
use crate::error::{ApiError, Result};
use crate::models::{AuditAction, NewUserSession, User, UserSession};
use crate::schema::{user_sessions, users};

const TOKEN_BYTES: usize = 32;
pub const INVALID_CREDENTIALS: &str = "Invalid email or password";

#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub session_id: Uuid,
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct SessionService {
    timeout: Duration,
    max_failed_logins: i32,
    passwords: PasswordService,
    audit: AuditService,
}

pub fn generate_token() -> String {
    URL_SAFE_NO_PAD.encode(crypto::random_bytes(TOKEN_BYTES))
}

pub fn hash_token(token: &str) -> String {
    crypto::sha256_hex(token.as_bytes())
}

fn invalid_credentials() -> ApiError {
    ApiError::Unauthorized(INVALID_CREDENTIALS.to_string())
}

impl SessionService {
    pub fn new(settings: &Settings, passwords: PasswordService, audit: AuditService) -> Self {
        SessionService {
            timeout: Duration::minutes(settings.session_timeout_minutes),
            max_failed_logins: settings.max_failed_logins,
            passwords,
            audit,
        }
    }

    /// Password login. Unknown email, locked account and wrong password all
    /// produce the same 401.
    pub fn create_session(
        &self,
        conn: &mut PgConnection,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<IssuedSession> {
        let email = email.trim().to_lowercase();

        let Some(user) = users::table
            .filter(users::email.eq(&email))
            .filter(users::deleted_at.is_null())
            .select(User::as_select())
            .first(conn)
            .optional()?
        else {
            tracing::warn!("Login attempt for unknown account");
            return Err(invalid_credentials());
        };

        if user.account_locked {
            tracing::warn!(user_id = %user.id, "Login attempt for locked account");
            self.audit.log_action(
                conn,
                AuditEntry::new(AuditAction::DenyAccess, "Session", "LOGIN")
                    .user(user.id)
                    .client(client)
                    .failed("Account locked"),
            );
            return Err(invalid_credentials());
        }

        if !self.passwords.verify_password(password, &user.password_hash) {
            self.record_failed_login(conn, &user, client)?;
            return Err(invalid_credentials());
        }

        if self.passwords.needs_rehash(&user.password_hash) {
            let new_hash = self
                .passwords
                .hash_password(password)
                .map_err(|e| ApiError::Internal(format!("password rehash failed: {e}")))?;
            diesel::update(users::table.find(user.id))
                .set(users::password_hash.eq(new_hash))
                .execute(conn)?;
            tracing::info!(user_id = %user.id, "Password hash upgraded");
        }

        let issued = self.open_session(conn, &user, client)?;

        let now = Utc::now();
        diesel::update(users::table.find(user.id))
            .set((
                users::last_login.eq(Some(now)),
                users::failed_login_count.eq(0),
                users::updated_at.eq(now),
            ))
            .execute(conn)?;

        self.audit.log_action(
            conn,
            AuditEntry::new(AuditAction::Login, "Session", issued.session_id.to_string())
                .user(user.id)
                .client(client),
        );

        Ok(issued)
    }

    fn record_failed_login(
        &self,
        conn: &mut PgConnection,
        user: &User,
        client: &ClientInfo,
    ) -> Result<()> {
        // Incremented in SQL so concurrent attempts each count.
        let failures: i32 = diesel::update(users::table.find(user.id))
            .set(users::failed_login_count.eq(users::failed_login_count + 1))
            .returning(users::failed_login_count)
            .get_result(conn)?;

        if failures >= self.max_failed_logins {
            let now = Utc::now();
            let locked = diesel::update(
                users::table
                    .find(user.id)
                    .filter(users::account_locked.eq(false)),
            )
            .set((
                users::account_locked.eq(true),
                users::account_locked_at.eq(Some(now)),
                users::updated_at.eq(now),
            ))
            .execute(conn)?;
            if locked > 0 {
                tracing::warn!(user_id = %user.id, failures, "Account locked after failed logins");
            }
        }

        self.audit.log_action(
            conn,
            AuditEntry::new(AuditAction::Login, "Session", "LOGIN")
                .user(user.id)
                .client(client)
                .failed("Invalid password"),
        );
        Ok(())
    }

    /// Issues a session for a user whose identity is already established.
    pub fn open_session(
        &self,
        conn: &mut PgConnection,
        user: &User,
        client: &ClientInfo,
    ) -> Result<IssuedSession> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let session_id = Uuid::new_v4();
        let expires_at = Utc::now() + self.timeout;

        diesel::insert_into(user_sessions::table)
            .values(&NewUserSession {
                id: session_id,
                user_id: user.id,
                session_token: &token_hash,
                ip_address: &client.ip_address,
                user_agent: client.user_agent.as_deref().unwrap_or("unknown"),
                expires_at,
            })
            .execute(conn)?;

        Ok(IssuedSession {
            token,
            session_id,
            expires_at,
            user: user.clone(),
        })
    }

    /// Resolves a bearer token to a live, unlocked user.
    pub fn validate_session(
        &self,
        conn: &mut PgConnection,
        token: &str,
        ip_address: Option<&str>,
    ) -> Result<Option<ValidatedSession>> {
        let token_hash = hash_token(token);
        let now = Utc::now();

        let found = user_sessions::table
            .inner_join(users::table)
            .filter(user_sessions::session_token.eq(&token_hash))
            .filter(user_sessions::expires_at.gt(now))
            .filter(users::deleted_at.is_null())
            .filter(users::account_locked.eq(false))
            .select((UserSession::as_select(), User::as_select()))
            .first::<(UserSession, User)>(conn)
            .optional()?;

        let Some((session, user)) = found else {
            return Ok(None);
        };

        if let Some(ip) = ip_address {
            if session.ip_address != ip {
                tracing::warn!(
                    session_id = %session.id,
                    expected = %session.ip_address,
                    actual = %ip,
                    "Session IP mismatch"
                );
            }
        }

        diesel::update(user_sessions::table.find(session.id))
            .set(user_sessions::last_activity.eq(now))
            .execute(conn)?;

        Ok(Some(ValidatedSession {
            session_id: session.id,
            user,
        }))
    }

    pub fn logout(
        &self,
        conn: &mut PgConnection,
        token: &str,
        user_id: Uuid,
        client: &ClientInfo,
    ) -> Result<bool> {
        let token_hash = hash_token(token);
        let deleted = diesel::delete(
            user_sessions::table.filter(user_sessions::session_token.eq(&token_hash)),
        )
        .execute(conn)?;

        self.audit.log_action(
            conn,
            AuditEntry::new(AuditAction::Logout, "Session", "LOGOUT")
                .user(user_id)
                .client(client),
        );
        Ok(deleted > 0)
    }

    pub fn cleanup_expired_sessions(&self, conn: &mut PgConnection) -> Result<usize> {
        let removed = diesel::delete(
            user_sessions::table.filter(user_sessions::expires_at.lt(Utc::now())),
        )
        .execute(conn)?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired sessions");
        }
        Ok(removed)
    }

    pub fn invalidate_all_user_sessions(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        reason: &str,
    ) -> Result<usize> {
        let removed = diesel::delete(user_sessions::table.filter(user_sessions::user_id.eq(user_id)))
            .execute(conn)?;

        if removed > 0 {
            tracing::info!(%user_id, removed, reason, "Invalidated user sessions");
            self.audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Logout, "Session", "ALL_SESSIONS")
                    .user(user_id)
                    .note(format!("All sessions invalidated: {reason}")),
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 bytes, unpadded
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn stored_hash_is_sha256_hex() {
        let token = generate_token();
        let hash = hash_token(&token);
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, token);
        assert_eq!(hash, hash_token(&token));
    }
}
