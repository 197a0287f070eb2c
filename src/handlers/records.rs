//! Single-record operations. Only the owner can see a record; anyone else
//! gets the same 404 as for a missing one.

use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::MessageResponse;
use crate::auth::AuthenticatedUser;
use crate::crypto::{EncryptedPayload, EncryptionService, KeyPurpose};
use crate::db;
use crate::error::{ApiError, Result};
use crate::llm::{Provider, SummaryInput};
use crate::models::{
    AccessLog, AccessType, AuditAction, AuditLog, Document, FhirResource, HealthRecord,
    NewSummary,
};
use crate::schema::{documents, fhir_resources, health_records, summaries};
use crate::security::AuditEntry;
use crate::AppState;

pub(crate) const RECORD_RESOURCE: &str = "HealthRecord";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

impl From<Document> for DocumentView {
    fn from(doc: Document) -> Self {
        DocumentView {
            id: doc.id,
            filename: doc.filename,
            mime_type: doc.mime_type,
            size_bytes: doc.size_bytes,
            created_at: doc.created_at,
        }
    }
}

/// A FHIR resource parsed from one of the record's uploads. The resource
/// body stays encrypted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirResourceView {
    pub id: Uuid,
    pub resource_type: String,
    pub fhir_id: Option<String>,
    pub format: String,
}

impl From<FhirResource> for FhirResourceView {
    fn from(resource: FhirResource) -> Self {
        FhirResourceView {
            id: resource.id,
            resource_type: resource.resource_type,
            fhir_id: resource.fhir_id,
            format: resource.format,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: Uuid,
    pub title: String,
    pub record_type: String,
    pub description: Option<String>,
    pub status: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub documents: Vec<DocumentView>,
    pub fhir_resources: Vec<FhirResourceView>,
    pub summary_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub id: Uuid,
    pub health_record_id: Uuid,
    pub provider: String,
    pub model: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessHistory {
    pub record_id: Uuid,
    pub audit_events: Vec<AuditLog>,
    pub access_events: Vec<AccessLog>,
}

/// A live record owned by `user_id`.
pub fn load_owned_record(conn: &mut PgConnection, user_id: Uuid, record_id: Uuid) -> Result<HealthRecord> {
    health_records::table
        .filter(health_records::id.eq(record_id))
        .filter(health_records::user_id.eq(user_id))
        .filter(health_records::deleted_at.is_null())
        .select(HealthRecord::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Health record".into()))
}

/// Decrypted text content, refusing rows sealed under a retired key.
pub fn record_content(
    conn: &mut PgConnection,
    crypto: &EncryptionService,
    record: &HealthRecord,
) -> Result<Option<String>> {
    let Some(payload) = record.encrypted_content()? else {
        return Ok(None);
    };
    db::ensure_key_active(conn, record.encryption_key_id)?;
    Ok(Some(crypto.decrypt(&payload, KeyPurpose::HealthRecord)?))
}

pub async fn get_record(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> Result<web::Json<RecordView>> {
    let record_id = path.into_inner();
    let crypto = state.crypto.clone();
    let audit = state.audit.clone();

    let view = db::run(&state.pool, move |conn| {
        let record = load_owned_record(conn, caller.id(), record_id)?;
        let content = record_content(conn, &crypto, &record)?;

        let docs = documents::table
            .filter(documents::health_record_id.eq(record.id))
            .filter(documents::deleted_at.is_null())
            .order(documents::created_at.asc())
            .select(Document::as_select())
            .load(conn)?;
        let resources = FhirResource::belonging_to(&record)
            .order(fhir_resources::created_at.asc())
            .select(FhirResource::as_select())
            .load(conn)?;
        let summary_count: i64 = summaries::table
            .filter(summaries::health_record_id.eq(record.id))
            .count()
            .get_result(conn)?;

        audit.log_access(
            conn,
            caller.id(),
            record.id,
            AccessType::View,
            "Health record detail view",
            &caller.client.ip_address,
            Some(caller.session_id),
        );

        Ok(RecordView {
            id: record.id,
            title: record.title,
            record_type: record.record_type,
            description: record.description,
            status: record.status,
            content,
            created_at: record.created_at,
            updated_at: record.updated_at,
            documents: docs.into_iter().map(DocumentView::from).collect(),
            fhir_resources: resources.into_iter().map(FhirResourceView::from).collect(),
            summary_count,
        })
    })
    .await?;

    Ok(web::Json(view))
}

pub async fn download_document(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse> {
    let (record_id, document_id) = path.into_inner();
    let user_id = caller.id();

    let document = db::run(&state.pool, move |conn| {
        load_owned_record(conn, user_id, record_id)?;
        let document = documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::health_record_id.eq(record_id))
            .filter(documents::deleted_at.is_null())
            .select(Document::as_select())
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Document".into()))?;
        db::ensure_key_active(conn, document.encryption_key_id)?;
        Ok(document)
    })
    .await?;

    let ciphertext = state.blobs.get(&document.storage_ref).await?;
    let payload = EncryptedPayload::from_parts(ciphertext, &document.encryption_iv, &document.encryption_salt)?;
    let crypto = state.crypto.clone();
    let plaintext = web::block(move || crypto.decrypt_bytes(&payload, KeyPurpose::Document)).await??;

    let audit = state.audit.clone();
    let client_ip = caller.client.ip_address.clone();
    let session_id = caller.session_id;
    db::run(&state.pool, move |conn| {
        audit.log_access(
            conn,
            user_id,
            record_id,
            AccessType::Download,
            "Document download",
            &client_ip,
            Some(session_id),
        );
        Ok(())
    })
    .await?;

    Ok(HttpResponse::Ok()
        .content_type(document.mime_type.as_str())
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(document.filename.clone())],
        })
        .body(plaintext))
}

pub async fn delete_record(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> Result<web::Json<MessageResponse>> {
    let record_id = path.into_inner();
    let audit = state.audit.clone();

    db::run(&state.pool, move |conn| {
        conn.transaction(|conn| {
            let record = load_owned_record(conn, caller.id(), record_id)?;
            let now = Utc::now();

            diesel::update(health_records::table.find(record.id))
                .set((
                    health_records::deleted_at.eq(Some(now)),
                    health_records::updated_at.eq(now),
                ))
                .execute(conn)?;
            diesel::update(
                documents::table
                    .filter(documents::health_record_id.eq(record.id))
                    .filter(documents::deleted_at.is_null()),
            )
            .set(documents::deleted_at.eq(Some(now)))
            .execute(conn)?;

            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Delete, RECORD_RESOURCE, record.id.to_string())
                    .user(caller.id())
                    .client(&caller.client)
                    .old_values(json!({ "title": record.title })),
            );
            Ok::<_, ApiError>(())
        })
    })
    .await?;

    tracing::info!(record_id = %record_id, "Health record deleted");
    Ok(web::Json(MessageResponse::new("Health record deleted")))
}

pub async fn create_summary(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: web::Json<SummaryRequest>,
) -> Result<HttpResponse> {
    let record_id = path.into_inner();
    let request = body.into_inner();
    let provider: Provider = request.provider.parse()?;
    let user_id = caller.id();

    let crypto = state.crypto.clone();
    let content = db::run(&state.pool, move |conn| {
        let record = load_owned_record(conn, user_id, record_id)?;
        record_content(conn, &crypto, &record)
    })
    .await?
    .filter(|text| !text.trim().is_empty())
    .ok_or_else(|| {
        ApiError::Unprocessable("Health record has no text content to summarize".into())
    })?;

    let (provider, model, summary) = state
        .llm
        .summarize(provider.as_str(), request.model_id.as_deref(), SummaryInput::Text(&content))
        .await?;

    let crypto = state.crypto.clone();
    let audit = state.audit.clone();
    let key_id = state.active_key_id;
    let view = db::run(&state.pool, move |conn| {
        let sealed = crypto.encrypt(&summary, KeyPurpose::HealthSummary)?;
        let summary_id = Uuid::new_v4();
        let provider_name = provider.as_str();

        conn.transaction(|conn| {
            diesel::insert_into(summaries::table)
                .values(&NewSummary {
                    id: summary_id,
                    health_record_id: record_id,
                    llm_provider: provider_name,
                    llm_model: &model,
                    summary_iv: sealed.iv_b64(),
                    summary_salt: sealed.salt_b64(),
                    summary_ciphertext: sealed.ciphertext,
                    encryption_key_id: key_id,
                })
                .execute(conn)?;

            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Create, "Summary", summary_id.to_string())
                    .user(user_id)
                    .client(&caller.client)
                    .new_values(json!({
                        "healthRecordId": record_id,
                        "provider": provider_name,
                        "model": model,
                    })),
            );
            Ok::<_, ApiError>(())
        })?;

        audit.log_access(
            conn,
            user_id,
            record_id,
            AccessType::ApiAccess,
            &format!("LLM summary generation ({provider_name})"),
            &caller.client.ip_address,
            Some(caller.session_id),
        );

        Ok(SummaryView {
            id: summary_id,
            health_record_id: record_id,
            provider: provider_name.to_string(),
            model,
            summary,
            created_at: Utc::now(),
        })
    })
    .await?;

    Ok(HttpResponse::Created().json(view))
}

pub async fn access_history(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    path: web::Path<Uuid>,
    query: web::Query<HistoryQuery>,
) -> Result<web::Json<AccessHistory>> {
    let record_id = path.into_inner();
    let limit = query.limit.unwrap_or(100);
    let audit = state.audit.clone();

    let history = db::run(&state.pool, move |conn| {
        load_owned_record(conn, caller.id(), record_id)?;
        let audit_events =
            audit.resource_access_history(conn, RECORD_RESOURCE, &record_id.to_string(), limit)?;
        let access_events = audit.record_access_logs(conn, record_id, limit)?;
        Ok(AccessHistory {
            record_id,
            audit_events,
            access_events,
        })
    })
    .await?;

    Ok(web::Json(history))
}
