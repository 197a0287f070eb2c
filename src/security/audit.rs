//! HIPAA audit trail.
//!
//! Two append-only tables are written here:
//! - `audit_logs`: every security-relevant action (logins, CRUD on PHI,
//!   denials), successful or not.
//! - `access_logs`: each time a health record is viewed, downloaded or
//!   sent to an outside service.
//!
//! Writes are best-effort. They run inside a savepoint so a failed insert
//! neither aborts the caller's transaction nor fails the request; the
//! failure is logged instead.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{AccessLog, AccessType, AuditAction, AuditLog, NewAccessLog, NewAuditLog};
use crate::schema::{access_logs, audit_logs};

pub const MAX_TRAIL_LIMIT: i64 = 500;

/// Who is calling and from where, captured once per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
}

impl ClientInfo {
    pub fn system() -> Self {
        ClientInfo {
            ip_address: "system".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub client: ClientInfo,
    pub old_values: Option<JsonValue>,
    pub new_values: Option<JsonValue>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        AuditEntry {
            user_id: None,
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            client: ClientInfo::system(),
            old_values: None,
            new_values: None,
            success: true,
            error_message: None,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn client(mut self, client: &ClientInfo) -> Self {
        self.client = client.clone();
        self
    }

    pub fn old_values(mut self, values: JsonValue) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn new_values(mut self, values: JsonValue) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// A successful action that still carries a note, e.g. a bulk logout reason.
    pub fn note(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    fn into_row(self) -> NewAuditLog {
        NewAuditLog {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            action: self.action.to_string(),
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            ip_address: self.client.ip_address,
            user_agent: self.client.user_agent,
            request_method: self.client.method,
            request_path: self.client.path,
            old_values: self.old_values,
            new_values: self.new_values,
            success: self.success,
            error_message: self.error_message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditService {
    enabled: bool,
    suspicious_window: Duration,
    suspicious_max_actions: i64,
}

impl AuditService {
    pub fn new(settings: &Settings) -> Self {
        if !settings.audit_enabled {
            tracing::warn!("Audit logging is disabled");
        }
        AuditService {
            enabled: settings.audit_enabled,
            suspicious_window: Duration::minutes(settings.suspicious_window_minutes),
            suspicious_max_actions: settings.suspicious_max_actions,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_action(&self, conn: &mut PgConnection, entry: AuditEntry) {
        if !self.enabled {
            return;
        }

        let action = entry.action;
        let success = entry.success;
        let user_id = entry.user_id;
        let resource = format!("{}/{}", entry.resource_type, entry.resource_id);
        let row = entry.into_row();

        let inserted = conn.transaction::<_, DieselError, _>(|conn| {
            diesel::insert_into(audit_logs::table)
                .values(&row)
                .execute(conn)
        });

        match inserted {
            Ok(_) if success => {
                tracing::info!(action = %action, %resource, user_id = ?user_id, "Audit");
            }
            Ok(_) => {
                tracing::warn!(
                    action = %action,
                    %resource,
                    user_id = ?user_id,
                    error = row.error_message.as_deref().unwrap_or(""),
                    "Audit (failed action)"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, action = %action, %resource, "Failed to write audit log");
            }
        }
    }

    pub fn log_access(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        health_record_id: Uuid,
        access_type: AccessType,
        purpose: &str,
        ip_address: &str,
        session_id: Option<Uuid>,
    ) {
        if !self.enabled {
            return;
        }

        let row = NewAccessLog {
            id: Uuid::new_v4(),
            user_id,
            health_record_id,
            access_type: access_type.as_str(),
            purpose,
            ip_address,
            session_id,
        };

        let inserted = conn.transaction::<_, DieselError, _>(|conn| {
            diesel::insert_into(access_logs::table)
                .values(&row)
                .execute(conn)
        });

        match inserted {
            Ok(_) => tracing::info!(
                %user_id,
                record_id = %health_record_id,
                access_type = %access_type,
                purpose,
                "Record access"
            ),
            Err(e) => tracing::error!(error = %e, record_id = %health_record_id, "Failed to write access log"),
        }
    }

    /// Newest first. `limit` is clamped to 1..=500.
    pub fn user_audit_trail(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> QueryResult<Vec<AuditLog>> {
        let mut query = audit_logs::table
            .filter(audit_logs::user_id.eq(Some(user_id)))
            .select(AuditLog::as_select())
            .into_boxed();

        if let Some(start) = start {
            query = query.filter(audit_logs::occurred_at.ge(start));
        }
        if let Some(end) = end {
            query = query.filter(audit_logs::occurred_at.le(end));
        }

        query
            .order(audit_logs::occurred_at.desc())
            .limit(limit.clamp(1, MAX_TRAIL_LIMIT))
            .load(conn)
    }

    pub fn resource_access_history(
        &self,
        conn: &mut PgConnection,
        resource_type: &str,
        resource_id: &str,
        limit: i64,
    ) -> QueryResult<Vec<AuditLog>> {
        audit_logs::table
            .filter(audit_logs::resource_type.eq(resource_type))
            .filter(audit_logs::resource_id.eq(resource_id))
            .order(audit_logs::occurred_at.desc())
            .limit(limit.clamp(1, MAX_TRAIL_LIMIT))
            .select(AuditLog::as_select())
            .load(conn)
    }

    pub fn record_access_logs(
        &self,
        conn: &mut PgConnection,
        health_record_id: Uuid,
        limit: i64,
    ) -> QueryResult<Vec<AccessLog>> {
        access_logs::table
            .filter(access_logs::health_record_id.eq(health_record_id))
            .order(access_logs::accessed_at.desc())
            .limit(limit.clamp(1, MAX_TRAIL_LIMIT))
            .select(AccessLog::as_select())
            .load(conn)
    }

    /// True when the user has produced more audit rows in the window than
    /// allowed. The denial itself is audited.
    pub fn check_suspicious_activity(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        client: &ClientInfo,
    ) -> QueryResult<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let since = Utc::now() - self.suspicious_window;
        let recent: i64 = audit_logs::table
            .filter(audit_logs::user_id.eq(Some(user_id)))
            .filter(audit_logs::occurred_at.ge(since))
            .count()
            .get_result(conn)?;

        if recent <= self.suspicious_max_actions {
            return Ok(false);
        }

        tracing::warn!(%user_id, recent, "Suspicious activity detected");
        self.log_action(
            conn,
            AuditEntry::new(AuditAction::DenyAccess, "SECURITY", "RATE_LIMIT")
                .user(user_id)
                .client(client)
                .failed(format!("Excessive activity: {recent} actions")),
        );
        Ok(true)
    }
}
