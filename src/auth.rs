//! Request extractors for the caller's identity and client context.

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use futures::future::{ready, LocalBoxFuture, Ready};
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, Result};
use crate::middleware::client_ip;
use crate::models::{User, UserRole};
use crate::security::ClientInfo;
use crate::AppState;

pub fn client_info(req: &HttpRequest) -> ClientInfo {
    ClientInfo {
        ip_address: client_ip(req),
        user_agent: Some(
            req.headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string(),
        ),
        method: Some(req.method().to_string()),
        path: Some(req.path().to_string()),
    }
}

impl FromRequest for ClientInfo {
    type Error = actix_web::Error;
    type Future = Ready<std::result::Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(client_info(req)))
    }
}

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// A caller holding a valid, unexpired session.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub session_id: Uuid,
    pub token: String,
    pub client: ClientInfo,
}

impl AuthenticatedUser {
    pub fn id(&self) -> Uuid {
        self.user.id
    }

    pub fn require_role(&self, role: UserRole) -> Result<()> {
        if self.user.role() == role {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user.id, required = %role, "Role check failed");
            Err(ApiError::Forbidden(format!("{role} role required")))
        }
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let token = bearer_token(req);
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let client = client_info(req);

        Box::pin(async move {
            let token = token.ok_or_else(|| {
                ApiError::Unauthorized("Missing or invalid authorization header".to_string())
            })?;
            let state = state
                .ok_or_else(|| ApiError::Internal("application state is not configured".to_string()))?;

            let sessions = state.sessions.clone();
            let audit = state.audit.clone();
            let (lookup_token, lookup_client) = (token.clone(), client.clone());
            let session = db::run(&state.pool, move |conn| {
                let Some(session) =
                    sessions.validate_session(conn, &lookup_token, Some(&lookup_client.ip_address))?
                else {
                    return Ok(None);
                };
                if audit.check_suspicious_activity(conn, session.user.id, &lookup_client)? {
                    return Err(ApiError::RateLimited);
                }
                Ok(Some(session))
            })
            .await?;

            let session = session
                .ok_or_else(|| ApiError::Unauthorized("Invalid or expired session".to_string()))?;

            Ok(AuthenticatedUser {
                user: session.user,
                session_id: session.session_id,
                token,
                client,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn bearer_token_parsing() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc.def"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "bearer   xyz "))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("xyz"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic dXNlcjpwYXNz"))
            .to_http_request();
        assert!(bearer_token(&req).is_none());

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer "))
            .to_http_request();
        assert!(bearer_token(&req).is_none());

        assert!(bearer_token(&TestRequest::default().to_http_request()).is_none());
    }

    #[test]
    fn client_info_uses_peer_address() {
        let req = TestRequest::post()
            .uri("/records/1")
            .peer_addr("192.0.2.10:4000".parse().unwrap())
            .insert_header((header::USER_AGENT, "medivault-tests"))
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_http_request();
        let info = client_info(&req);
        assert_eq!(info.ip_address, "192.0.2.10");
        assert_eq!(info.user_agent.as_deref(), Some("medivault-tests"));
        assert_eq!(info.method.as_deref(), Some("POST"));
        assert_eq!(info.path.as_deref(), Some("/records/1"));
    }
}
