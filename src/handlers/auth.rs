use actix_web::{web, HttpResponse};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use super::MessageResponse;
use crate::auth::AuthenticatedUser;
use crate::crypto::{EncryptionService, KeyPurpose};
use crate::db;
use crate::error::{ApiError, Result};
use crate::models::{AuditAction, AuditLog, NewUser, NewUserProfile, User, UserProfile, UserRole};
use crate::schema::{user_profiles, users};
use crate::security::session::IssuedSession;
use crate::security::{validate_password_strength, AuditEntry, ClientInfo};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    pub password: String,
    #[validate(length(min = 1, max = 100, message = "must be 1 to 100 characters"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100, message = "must be 1 to 100 characters"))]
    pub last_name: String,
    pub date_of_birth: String,
    #[validate(length(max = 32, message = "must be at most 32 characters"))]
    pub phone: Option<String>,
    pub accept_terms: bool,
    pub accept_privacy: bool,
}

impl RegisterRequest {
    /// Checks the derive cannot express.
    fn check(&self) -> Result<()> {
        self.validate()?;

        if !self.accept_terms {
            return Err(ApiError::Validation("acceptTerms: terms of service must be accepted".into()));
        }
        if !self.accept_privacy {
            return Err(ApiError::Validation("acceptPrivacy: privacy policy must be accepted".into()));
        }
        if NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d").is_err() {
            return Err(ApiError::Validation("dateOfBirth: expected YYYY-MM-DD".into()));
        }

        let strength = validate_password_strength(&self.password);
        if !strength.valid {
            return Err(ApiError::Validation(strength.errors.join("; ")));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditTrailQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    pub user: UserView,
    pub expires_at: DateTime<Utc>,
}

impl SessionResponse {
    fn new(issued: IssuedSession, user: UserView) -> Self {
        SessionResponse {
            token: issued.token,
            user,
            expires_at: issued.expires_at,
        }
    }
}

/// The user with names decrypted from the profile. Names that fail to
/// decrypt are left out.
fn user_view(conn: &mut PgConnection, crypto: &EncryptionService, user: &User) -> Result<UserView> {
    let profile = user_profiles::table
        .filter(user_profiles::user_id.eq(user.id))
        .select(UserProfile::as_select())
        .first(conn)
        .optional()?;

    let decrypt = |field: Option<&String>| {
        field.and_then(|envelope| match crypto.decrypt_field(envelope, KeyPurpose::UserProfile) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "Failed to decrypt profile field");
                None
            }
        })
    };

    let (first_name, last_name) = match &profile {
        Some(p) => (decrypt(p.first_name.as_ref()), decrypt(p.last_name.as_ref())),
        None => (None, None),
    };

    Ok(UserView {
        id: user.id,
        email: user.email.clone(),
        role: user.role(),
        first_name,
        last_name,
    })
}

pub async fn register(
    state: web::Data<AppState>,
    client: ClientInfo,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();

    match create_account(&state, &client, request).await {
        Ok(response) => Ok(HttpResponse::Created().json(response)),
        Err(err) => {
            let audit = state.audit.clone();
            let message = err.to_string();
            let audited = db::run(&state.pool, move |conn| {
                audit.log_action(
                    conn,
                    AuditEntry::new(AuditAction::Create, "User", "registration_attempt")
                        .client(&client)
                        .failed(message),
                );
                Ok(())
            })
            .await;
            if let Err(audit_err) = audited {
                tracing::error!(error = %audit_err, "Could not audit failed registration");
            }
            Err(err)
        }
    }
}

async fn create_account(
    state: &AppState,
    client: &ClientInfo,
    request: RegisterRequest,
) -> Result<SessionResponse> {
    request.check()?;

    let crypto = state.crypto.clone();
    let passwords = state.passwords.clone();
    let sessions = state.sessions.clone();
    let audit = state.audit.clone();
    let client = client.clone();

    db::run(&state.pool, move |conn| {
        let email = request.email.trim().to_lowercase();
        let password_hash = passwords
            .hash_password(&request.password)
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))?;

        let seal = |value: &str| crypto.encrypt_field(value.trim(), KeyPurpose::UserProfile);
        let profile_fields = (
            seal(&request.first_name)?,
            seal(&request.last_name)?,
            seal(&request.date_of_birth)?,
            request
                .phone
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(seal)
                .transpose()?,
        );

        let (issued, user) = conn.transaction(|conn| {
            let taken: i64 = users::table
                .filter(users::email.eq(&email))
                .count()
                .get_result(conn)?;
            if taken > 0 {
                return Err(ApiError::Conflict("Email already registered".into()));
            }

            let now = Utc::now();
            let user_id = Uuid::new_v4();
            let user: User = diesel::insert_into(users::table)
                .values(&NewUser {
                    id: user_id,
                    email: &email,
                    password_hash: &password_hash,
                    role: UserRole::Patient.as_str(),
                    terms_accepted_at: Some(now),
                    privacy_accepted_at: Some(now),
                })
                .returning(User::as_returning())
                .get_result(conn)?;

            let (first_name, last_name, date_of_birth, phone) = profile_fields;
            diesel::insert_into(user_profiles::table)
                .values(&NewUserProfile {
                    id: Uuid::new_v4(),
                    user_id,
                    first_name: Some(first_name),
                    last_name: Some(last_name),
                    date_of_birth: Some(date_of_birth),
                    phone,
                })
                .execute(conn)?;

            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Create, "User", user_id.to_string())
                    .user(user_id)
                    .client(&client),
            );

            let issued = sessions.open_session(conn, &user, &client)?;
            Ok::<_, ApiError>((issued, user))
        })?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(SessionResponse::new(
            issued,
            UserView {
                id: user.id,
                email: user.email.clone(),
                role: user.role(),
                first_name: Some(request.first_name.trim().to_string()),
                last_name: Some(request.last_name.trim().to_string()),
            },
        ))
    })
    .await
}

pub async fn login(
    state: web::Data<AppState>,
    client: ClientInfo,
    body: web::Json<LoginRequest>,
) -> Result<web::Json<SessionResponse>> {
    let request = body.into_inner();
    request.validate()?;

    let sessions = state.sessions.clone();
    let crypto = state.crypto.clone();
    let response = db::run(&state.pool, move |conn| {
        let issued = sessions.create_session(conn, &request.email, &request.password, &client)?;
        let view = user_view(conn, &crypto, &issued.user)?;
        Ok(SessionResponse::new(issued, view))
    })
    .await?;

    Ok(web::Json(response))
}

pub async fn logout(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
) -> Result<web::Json<MessageResponse>> {
    let sessions = state.sessions.clone();
    let removed = db::run(&state.pool, move |conn| {
        sessions.logout(conn, &caller.token, caller.user.id, &caller.client)
    })
    .await?;

    if !removed {
        return Err(ApiError::Validation("Logout failed".into()));
    }
    Ok(web::Json(MessageResponse::new("Logged out successfully")))
}

pub async fn validate_session(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
) -> Result<HttpResponse> {
    let crypto = state.crypto.clone();
    let view = db::run(&state.pool, move |conn| user_view(conn, &crypto, &caller.user)).await?;
    Ok(HttpResponse::Ok().json(json!({ "valid": true, "user": view })))
}

pub async fn change_password(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    body: web::Json<ChangePasswordRequest>,
) -> Result<web::Json<MessageResponse>> {
    let request = body.into_inner();
    let passwords = state.passwords.clone();
    let sessions = state.sessions.clone();
    let audit = state.audit.clone();

    db::run(&state.pool, move |conn| {
        let user = &caller.user;

        if !passwords.verify_password(&request.old_password, &user.password_hash) {
            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Update, "User", user.id.to_string())
                    .user(user.id)
                    .client(&caller.client)
                    .failed("Invalid old password"),
            );
            return Err(ApiError::Unauthorized("Invalid old password".into()));
        }

        let strength = validate_password_strength(&request.new_password);
        if !strength.valid {
            return Err(ApiError::Validation(strength.errors.join("; ")));
        }

        let new_hash = passwords
            .hash_password(&request.new_password)
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))?;

        conn.transaction(|conn| {
            diesel::update(users::table.find(user.id))
                .set((users::password_hash.eq(&new_hash), users::updated_at.eq(Utc::now())))
                .execute(conn)?;

            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Update, "User", user.id.to_string())
                    .user(user.id)
                    .client(&caller.client)
                    .new_values(json!({ "field": "password" })),
            );

            sessions.invalidate_all_user_sessions(conn, user.id, "Password changed")?;
            Ok::<_, ApiError>(())
        })
    })
    .await?;

    Ok(web::Json(MessageResponse::new(
        "Password changed successfully. Please login again.",
    )))
}

pub async fn audit_trail(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    query: web::Query<AuditTrailQuery>,
) -> Result<web::Json<Vec<AuditLog>>> {
    let query = query.into_inner();
    let audit = state.audit.clone();
    let user_id = caller.id();

    let entries = db::run(&state.pool, move |conn| {
        Ok(audit.user_audit_trail(conn, user_id, query.start, query.end, query.limit.unwrap_or(100))?)
    })
    .await?;

    Ok(web::Json(entries))
}
