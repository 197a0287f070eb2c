//! Diesel row types and the closed vocabularies stored as text columns.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::crypto::{self, EncryptedPayload};
use crate::schema::{
    access_logs, audit_logs, documents, encryption_keys, fhir_resources, health_records,
    summaries, user_profiles, user_sessions, users,
};

/// Text-backed enum: `as_str`, `Display`, `FromStr` and SCREAMING_SNAKE_CASE serde.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

text_enum!(UserRole {
    Patient => "PATIENT",
    Provider => "PROVIDER",
    Admin => "ADMIN",
});

text_enum!(
    /// Types of health records
    RecordType {
        LabResult => "LAB_RESULT",
        ClinicalNote => "CLINICAL_NOTE",
        Radiology => "RADIOLOGY",
        Prescription => "PRESCRIPTION",
        DischargeSummary => "DISCHARGE_SUMMARY",
        Pathology => "PATHOLOGY",
        Cardiology => "CARDIOLOGY",
        Other => "OTHER",
    }
);

impl Default for RecordType {
    fn default() -> Self {
        RecordType::Other
    }
}

text_enum!(
    /// Processing status for uploaded records
    ProcessingStatus {
        Pending => "PENDING",
        Processing => "PROCESSING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

text_enum!(AuditAction {
    Create => "CREATE",
    Read => "READ",
    Update => "UPDATE",
    Delete => "DELETE",
    Login => "LOGIN",
    Logout => "LOGOUT",
    Export => "EXPORT",
    Print => "PRINT",
    Share => "SHARE",
    DenyAccess => "DENY_ACCESS",
});

text_enum!(AccessType {
    View => "VIEW",
    Download => "DOWNLOAD",
    Print => "PRINT",
    Share => "SHARE",
    ApiAccess => "API_ACCESS",
});

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub failed_login_count: i32,
    pub account_locked: bool,
    pub account_locked_at: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub terms_accepted_at: Option<DateTime<Utc>>,
    pub privacy_accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn role(&self) -> UserRole {
        self.role.parse().unwrap_or(UserRole::Patient)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: Uuid,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role: &'a str,
    pub terms_accepted_at: Option<DateTime<Utc>>,
    pub privacy_accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(User))]
#[diesel(table_name = user_profiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_profiles)]
pub struct NewUserProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(User))]
#[diesel(table_name = user_sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_token: String,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_sessions)]
pub struct NewUserSession<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_token: &'a str,
    pub ip_address: &'a str,
    pub user_agent: &'a str,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(User))]
#[diesel(table_name = health_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HealthRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub record_type: String,
    pub description: Option<String>,
    pub status: String,
    pub content_ciphertext: Option<Vec<u8>>,
    pub content_iv: Option<String>,
    pub content_salt: Option<String>,
    pub encryption_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// The sealed content, if the record carries any text.
    pub fn encrypted_content(&self) -> crypto::Result<Option<EncryptedPayload>> {
        match (&self.content_ciphertext, &self.content_iv, &self.content_salt) {
            (Some(ciphertext), Some(iv), Some(salt)) => {
                EncryptedPayload::from_parts(ciphertext.clone(), iv, salt).map(Some)
            }
            (None, None, None) => Ok(None),
            _ => Err(crypto::CryptoError::MalformedEnvelope),
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = health_records)]
pub struct NewHealthRecord<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: &'a str,
    pub record_type: &'a str,
    pub description: Option<&'a str>,
    pub status: &'a str,
    pub content_ciphertext: Option<Vec<u8>>,
    pub content_iv: Option<String>,
    pub content_salt: Option<String>,
    pub encryption_key_id: Option<Uuid>,
}

impl<'a> NewHealthRecord<'a> {
    pub fn with_content(mut self, payload: Option<EncryptedPayload>) -> Self {
        if let Some(payload) = payload {
            self.content_iv = Some(payload.iv_b64());
            self.content_salt = Some(payload.salt_b64());
            self.content_ciphertext = Some(payload.ciphertext);
        }
        self
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(HealthRecord))]
#[diesel(table_name = documents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Document {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub storage_ref: String,
    pub encryption_iv: String,
    pub encryption_salt: String,
    pub encryption_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument<'a> {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub user_id: Uuid,
    pub filename: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub sha256: &'a str,
    pub storage_ref: &'a str,
    pub encryption_iv: String,
    pub encryption_salt: String,
    pub encryption_key_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(HealthRecord))]
#[diesel(table_name = fhir_resources)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FhirResource {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub user_id: Uuid,
    pub resource_type: String,
    pub fhir_id: Option<String>,
    pub format: String,
    pub resource_ciphertext: Vec<u8>,
    pub resource_iv: String,
    pub resource_salt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = fhir_resources)]
pub struct NewFhirResource {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub user_id: Uuid,
    pub resource_type: String,
    pub fhir_id: Option<String>,
    pub format: &'static str,
    pub resource_ciphertext: Vec<u8>,
    pub resource_iv: String,
    pub resource_salt: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(HealthRecord))]
#[diesel(table_name = summaries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Summary {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub llm_provider: String,
    pub llm_model: String,
    pub summary_ciphertext: Vec<u8>,
    pub summary_iv: String,
    pub summary_salt: String,
    pub encryption_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn encrypted_text(&self) -> crypto::Result<EncryptedPayload> {
        EncryptedPayload::from_parts(
            self.summary_ciphertext.clone(),
            &self.summary_iv,
            &self.summary_salt,
        )
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = summaries)]
pub struct NewSummary<'a> {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub llm_provider: &'a str,
    pub llm_model: &'a str,
    pub summary_ciphertext: Vec<u8>,
    pub summary_iv: String,
    pub summary_salt: String,
    pub encryption_key_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = audit_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub success: bool,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = access_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct AccessLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub health_record_id: Uuid,
    pub access_type: String,
    pub purpose: String,
    pub ip_address: String,
    pub session_id: Option<Uuid>,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = access_logs)]
pub struct NewAccessLog<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub health_record_id: Uuid,
    pub access_type: &'a str,
    pub purpose: &'a str,
    pub ip_address: &'a str,
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = encryption_keys)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EncryptionKey {
    pub id: Uuid,
    pub fingerprint: String,
    pub algorithm: String,
    pub kdf: String,
    pub kdf_iterations: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = encryption_keys)]
pub struct NewEncryptionKey<'a> {
    pub id: Uuid,
    pub fingerprint: &'a str,
    pub algorithm: &'a str,
    pub kdf: &'a str,
    pub kdf_iterations: i32,
    pub active: bool,
}
