use std::collections::{HashMap, HashSet};

use actix_web::web;
use chrono::{DateTime, Duration, Utc};
use diesel::dsl::count;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::crypto::{EncryptionService, KeyPurpose};
use crate::db;
use crate::error::{ApiError, Result};
use crate::models::{AccessType, AuditAction, Document, HealthRecord, Summary};
use crate::schema::{audit_logs, documents, health_records, summaries};
use crate::AppState;

const DEFAULT_RECENT_UPLOADS: i64 = 5;
const DEFAULT_RECORD_LIST: i64 = 100;
const MAX_LIST_LIMIT: i64 = 500;
const UNDECRYPTABLE_SUMMARY: &str = "Summary content could not be decrypted";

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_records: i64,
    pub evidence_searches: i64,
    pub summaries_generated: i64,
    pub recent_records_change: i64,
    pub recent_evidence_change: i64,
    pub recent_summaries_change: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentUpload {
    pub id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: String,
    pub record_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummaryData {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub records_analyzed: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalRecord {
    pub id: Uuid,
    pub title: String,
    pub record_type: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub file_count: i64,
    pub summary_available: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    fn limit_or(&self, default: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Record, evidence-search and summary counts since `since`.
fn activity_since(
    conn: &mut PgConnection,
    user_id: Uuid,
    since: DateTime<Utc>,
) -> QueryResult<(i64, i64, i64)> {
    let records = health_records::table
        .filter(health_records::user_id.eq(user_id))
        .filter(health_records::deleted_at.is_null())
        .filter(health_records::created_at.ge(since))
        .count()
        .get_result(conn)?;

    let searches = audit_logs::table
        .filter(audit_logs::user_id.eq(user_id))
        .filter(audit_logs::resource_type.eq(super::evidence::EVIDENCE_RESOURCE))
        .filter(audit_logs::action.eq(AuditAction::Read.as_str()))
        .filter(audit_logs::occurred_at.ge(since))
        .count()
        .get_result(conn)?;

    let summaries = summaries::table
        .inner_join(health_records::table)
        .filter(health_records::user_id.eq(user_id))
        .filter(health_records::deleted_at.is_null())
        .filter(summaries::created_at.ge(since))
        .count()
        .get_result(conn)?;

    Ok((records, searches, summaries))
}

pub async fn stats(state: web::Data<AppState>, caller: AuthenticatedUser) -> Result<web::Json<DashboardStats>> {
    let user_id = caller.id();
    let stats = db::run(&state.pool, move |conn| {
        let (total_records, evidence_searches, summaries_generated) =
            activity_since(conn, user_id, DateTime::<Utc>::UNIX_EPOCH)?;
        let (recent_records_change, recent_evidence_change, recent_summaries_change) =
            activity_since(conn, user_id, Utc::now() - Duration::days(7))?;

        Ok(DashboardStats {
            total_records,
            evidence_searches,
            summaries_generated,
            recent_records_change,
            recent_evidence_change,
            recent_summaries_change,
        })
    })
    .await?;

    Ok(web::Json(stats))
}

fn live_records(conn: &mut PgConnection, user_id: Uuid, limit: i64) -> QueryResult<Vec<HealthRecord>> {
    health_records::table
        .filter(health_records::user_id.eq(user_id))
        .filter(health_records::deleted_at.is_null())
        .order(health_records::created_at.desc())
        .limit(limit)
        .select(HealthRecord::as_select())
        .load(conn)
}

pub async fn recent_uploads(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    query: web::Query<ListQuery>,
) -> Result<web::Json<Vec<RecentUpload>>> {
    let user_id = caller.id();
    let limit = query.limit_or(DEFAULT_RECENT_UPLOADS);

    let uploads = db::run(&state.pool, move |conn| {
        let records = live_records(conn, user_id, limit)?;
        let documents = Document::belonging_to(&records)
            .filter(documents::deleted_at.is_null())
            .order(documents::created_at.asc())
            .select(Document::as_select())
            .load(conn)?
            .grouped_by(&records);

        Ok(records
            .into_iter()
            .zip(documents)
            .map(|(record, docs)| {
                let first = docs.into_iter().next();
                RecentUpload {
                    id: record.id,
                    filename: first
                        .as_ref()
                        .map_or_else(|| record.title.clone(), |d| d.filename.clone()),
                    file_type: first.map_or_else(|| "unknown".to_string(), |d| d.mime_type),
                    uploaded_at: record.created_at,
                    status: record.status,
                    record_type: record.record_type,
                }
            })
            .collect::<Vec<_>>())
    })
    .await?;

    Ok(web::Json(uploads))
}

fn summary_title(created_at: DateTime<Utc>) -> String {
    format!("Health Summary - {}", created_at.format("%B %d, %Y"))
}

fn summary_text(conn: &mut PgConnection, crypto: &EncryptionService, summary: &Summary) -> String {
    let decrypted = summary.encrypted_text().map_err(ApiError::from).and_then(|payload| {
        db::ensure_key_active(conn, summary.encryption_key_id)?;
        Ok(crypto.decrypt(&payload, KeyPurpose::HealthSummary)?)
    });
    decrypted.unwrap_or_else(|err| {
        tracing::warn!(summary_id = %summary.id, error = %err, "Summary could not be decrypted");
        UNDECRYPTABLE_SUMMARY.to_string()
    })
}

pub async fn health_summary(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
) -> Result<web::Json<Option<HealthSummaryData>>> {
    let crypto = state.crypto.clone();
    let audit = state.audit.clone();

    let data = db::run(&state.pool, move |conn| {
        let user_id = caller.id();
        let latest = summaries::table
            .inner_join(health_records::table)
            .filter(health_records::user_id.eq(user_id))
            .filter(health_records::deleted_at.is_null())
            .order(summaries::created_at.desc())
            .select(Summary::as_select())
            .first(conn)
            .optional()?;
        let Some(summary) = latest else {
            return Ok(None);
        };

        let records_analyzed: i64 = health_records::table
            .filter(health_records::user_id.eq(user_id))
            .filter(health_records::deleted_at.is_null())
            .filter(health_records::created_at.le(summary.created_at))
            .count()
            .get_result(conn)?;

        let content = summary_text(conn, &crypto, &summary);
        audit.log_access(
            conn,
            user_id,
            summary.health_record_id,
            AccessType::View,
            "Dashboard health summary view",
            &caller.client.ip_address,
            Some(caller.session_id),
        );

        Ok(Some(HealthSummaryData {
            id: summary.id,
            title: summary_title(summary.created_at),
            content,
            created_at: summary.created_at,
            provider: summary.llm_provider,
            model: summary.llm_model,
            records_analyzed,
        }))
    })
    .await?;

    Ok(web::Json(data))
}

pub async fn medical_records(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    query: web::Query<ListQuery>,
) -> Result<web::Json<Vec<MedicalRecord>>> {
    let limit = query.limit_or(DEFAULT_RECORD_LIST);
    let audit = state.audit.clone();

    let listing = db::run(&state.pool, move |conn| {
        let user_id = caller.id();
        let records = live_records(conn, user_id, limit)?;
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

        let file_counts: HashMap<Uuid, i64> = documents::table
            .filter(documents::health_record_id.eq_any(ids.clone()))
            .filter(documents::deleted_at.is_null())
            .group_by(documents::health_record_id)
            .select((documents::health_record_id, count(documents::id)))
            .load::<(Uuid, i64)>(conn)?
            .into_iter()
            .collect();
        let summarized: HashSet<Uuid> = summaries::table
            .filter(summaries::health_record_id.eq_any(ids))
            .select(summaries::health_record_id)
            .distinct()
            .load::<Uuid>(conn)?
            .into_iter()
            .collect();

        for record in &records {
            audit.log_access(
                conn,
                user_id,
                record.id,
                AccessType::View,
                "Dashboard medical records list view",
                &caller.client.ip_address,
                Some(caller.session_id),
            );
        }

        Ok(records
            .into_iter()
            .map(|record| MedicalRecord {
                file_count: file_counts.get(&record.id).copied().unwrap_or(0),
                summary_available: summarized.contains(&record.id),
                id: record.id,
                title: record.title,
                record_type: record.record_type,
                created_at: record.created_at,
                status: record.status,
            })
            .collect::<Vec<_>>())
    })
    .await?;

    Ok(web::Json(listing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn summary_title_uses_long_month() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(summary_title(at), "Health Summary - March 07, 2024");
    }

    #[test]
    fn list_limit_is_clamped() {
        assert_eq!(ListQuery { limit: None }.limit_or(5), 5);
        assert_eq!(ListQuery { limit: Some(0) }.limit_or(5), 1);
        assert_eq!(ListQuery { limit: Some(10_000) }.limit_or(5), MAX_LIST_LIMIT);
    }

    #[test]
    fn stats_serialize_in_camel_case() {
        let json = serde_json::to_value(DashboardStats {
            total_records: 3,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["totalRecords"], 3);
        assert_eq!(json["recentSummariesChange"], 0);
    }
}
