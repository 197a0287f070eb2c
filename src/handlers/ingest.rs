use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use super::records::RECORD_RESOURCE;
use super::upload::{self, UploadLimits, UploadedFile};
use crate::auth::AuthenticatedUser;
use crate::crypto::{self, EncryptedPayload, EncryptionService, KeyPurpose};
use crate::db;
use crate::error::{ApiError, Result};
use crate::ingest::fhir::{self, ParsedResource};
use crate::ingest::{self as ingestion, ehr, FileKind};
use crate::models::{
    AuditAction, NewDocument, NewFhirResource, NewHealthRecord, ProcessingStatus, RecordType,
    UserRole,
};
use crate::schema::{documents, fhir_resources, health_records};
use crate::security::AuditEntry;
use crate::storage::BlobStore;
use crate::AppState;

const EHR_IMPORT_RESOURCE: &str = "EhrImport";
const MAX_TITLE_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;

#[derive(Debug, Deserialize, Validate)]
pub struct TextIngestRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub title: String,
    #[serde(default)]
    pub record_type: RecordType,
    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub description: Option<String>,
    pub content: String,
}

impl TextIngestRequest {
    fn check(&self) -> Result<()> {
        self.validate()?;
        if self.title.trim().is_empty() {
            return Err(ApiError::Validation("title: must not be blank".into()));
        }
        if self.content.trim().is_empty() {
            return Err(ApiError::Validation("content: must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TextIngestResponse {
    pub health_record_id: Uuid,
    pub message: String,
    pub content_length: usize,
}

#[derive(Debug, Serialize)]
pub struct FileIngestResponse {
    pub batch_id: Uuid,
    pub message: String,
    pub files_processed: usize,
    pub health_record_ids: Vec<Uuid>,
    pub document_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct EhrIngestRequest {
    pub input_dir: String,
    pub output_dir: Option<String>,
    pub schema_json: Option<String>,
}

fn new_record<'a>(
    id: Uuid,
    user_id: Uuid,
    title: &'a str,
    record_type: RecordType,
    description: Option<&'a str>,
    encryption_key_id: Option<Uuid>,
) -> NewHealthRecord<'a> {
    NewHealthRecord {
        id,
        user_id,
        title,
        record_type: record_type.as_str(),
        description,
        status: ProcessingStatus::Completed.as_str(),
        content_ciphertext: None,
        content_iv: None,
        content_salt: None,
        encryption_key_id,
    }
}

pub async fn ingest_text(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    body: web::Json<TextIngestRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    request.check()?;

    let crypto = state.crypto.clone();
    let audit = state.audit.clone();
    let key_id = state.active_key_id;

    let (record_id, content_length) = db::run(&state.pool, move |conn| {
        let sealed = crypto.encrypt(&request.content, KeyPurpose::HealthRecord)?;
        let record_id = Uuid::new_v4();
        let title = request.title.trim();

        conn.transaction(|conn| {
            diesel::insert_into(health_records::table)
                .values(
                    &new_record(
                        record_id,
                        caller.id(),
                        title,
                        request.record_type,
                        request.description.as_deref(),
                        key_id,
                    )
                    .with_content(Some(sealed)),
                )
                .execute(conn)?;

            audit.log_action(
                conn,
                AuditEntry::new(AuditAction::Create, RECORD_RESOURCE, record_id.to_string())
                    .user(caller.id())
                    .client(&caller.client)
                    .new_values(json!({
                        "title": title,
                        "recordType": request.record_type,
                        "source": "text",
                    })),
            );
            Ok::<_, ApiError>(())
        })?;

        Ok((record_id, request.content.chars().count()))
    })
    .await?;

    tracing::info!(record_id = %record_id, content_length, "Text record ingested");
    Ok(HttpResponse::Created().json(TextIngestResponse {
        health_record_id: record_id,
        message: "Text content ingested successfully".into(),
        content_length,
    }))
}

/// A validated upload with everything derived from its plaintext.
struct PreparedFile {
    file: UploadedFile,
    kind: FileKind,
    content: Option<String>,
    resources: Vec<ParsedResource>,
}

/// Ciphertexts for one upload, produced on the blocking pool.
#[derive(Debug)]
struct SealedFile {
    filename: String,
    kind: FileKind,
    size_bytes: i64,
    sha256: String,
    document: EncryptedPayload,
    content: Option<EncryptedPayload>,
    resources: Vec<(ParsedResource, EncryptedPayload)>,
}

fn prepare(file: UploadedFile, max_bytes: usize) -> Result<PreparedFile> {
    let kind = ingestion::validate_upload(&file.filename, &file.bytes, max_bytes)?;
    let content = ingestion::extract_text(kind, &file.filename, &file.bytes);
    let resources = match kind.fhir_format() {
        Some(format) => fhir::parse(&file.bytes, format)?,
        None => Vec::new(),
    };
    Ok(PreparedFile {
        file,
        kind,
        content,
        resources,
    })
}

fn parse_record_type(raw: Option<&str>) -> Result<RecordType> {
    match raw {
        None => Ok(RecordType::default()),
        Some(value) => value
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| ApiError::Validation(format!("record_type: unknown record type '{value}'"))),
    }
}

fn seal(encryption: &EncryptionService, prepared: PreparedFile) -> crypto::Result<SealedFile> {
    let PreparedFile {
        file,
        kind,
        content,
        resources,
    } = prepared;
    let resources = resources
        .into_iter()
        .map(|r| {
            let payload = encryption.encrypt(&r.raw, KeyPurpose::FhirResource)?;
            Ok((r, payload))
        })
        .collect::<crypto::Result<Vec<_>>>()?;
    Ok(SealedFile {
        sha256: crypto::sha256_hex(&file.bytes),
        size_bytes: file.bytes.len() as i64,
        document: encryption.encrypt_bytes(&file.bytes, KeyPurpose::Document)?,
        content: content
            .map(|text| encryption.encrypt(&text, KeyPurpose::HealthRecord))
            .transpose()?,
        resources,
        filename: file.filename,
        kind,
    })
}

fn record_title(title: Option<&str>, filename: &str, several: bool) -> String {
    match title {
        Some(t) if several => format!("{t} - {filename}"),
        Some(t) => t.to_string(),
        None => filename.to_string(),
    }
}

async fn remove_blobs(blobs: &dyn BlobStore, refs: &[String]) {
    for storage_ref in refs {
        if let Err(e) = blobs.delete(storage_ref).await {
            tracing::error!(error = %e, storage_ref = %storage_ref, "Failed to remove orphaned blob");
        }
    }
}

/// Writes every document ciphertext to the blob store. If one write fails
/// the blobs already written are removed.
async fn put_blobs(
    blobs: &dyn BlobStore,
    files: Vec<SealedFile>,
) -> Result<Vec<(SealedFile, String)>> {
    let mut stored: Vec<(SealedFile, String)> = Vec::with_capacity(files.len());
    for mut file in files {
        let ciphertext = std::mem::take(&mut file.document.ciphertext);
        match blobs.put(ciphertext).await {
            Ok(storage_ref) => stored.push((file, storage_ref)),
            Err(e) => {
                let written: Vec<String> = stored.into_iter().map(|(_, r)| r).collect();
                remove_blobs(blobs, &written).await;
                return Err(e.into());
            }
        }
    }
    Ok(stored)
}

/// Stores a multipart batch. Every file is validated before anything is
/// written, and the records are inserted in one transaction: either the
/// whole batch is stored or none of it is.
pub async fn ingest_files(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    payload: Multipart,
) -> Result<HttpResponse> {
    let limits = UploadLimits::from_settings(&state.settings);
    let mut form = upload::read_form(payload, limits).await?;

    let record_type = parse_record_type(form.text("record_type"))?;
    let title = form.text("title").map(str::to_string);
    let description = form.text("description").map(str::to_string);
    if title.as_ref().is_some_and(|t| t.chars().count() > MAX_TITLE_LEN) {
        return Err(ApiError::Validation("title: must be at most 255 characters".into()));
    }
    if description.as_ref().is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN) {
        return Err(ApiError::Validation("description: must be at most 1000 characters".into()));
    }

    let files = form.take_files("files");
    if files.is_empty() {
        return Err(ApiError::Validation("At least one file is required in the 'files' field".into()));
    }

    let prepared = files
        .into_iter()
        .map(|file| prepare(file, limits.max_file_bytes))
        .collect::<Result<Vec<_>>>()?;

    let encryption = state.crypto.clone();
    let sealed = web::block(move || {
        prepared
            .into_iter()
            .map(|file| seal(&encryption, file))
            .collect::<crypto::Result<Vec<_>>>()
    })
    .await??;

    let stored = put_blobs(state.blobs.as_ref(), sealed).await?;
    let storage_refs: Vec<String> = stored.iter().map(|(_, r)| r.clone()).collect();

    let batch_id = Uuid::new_v4();
    let several = stored.len() > 1;
    let audit = state.audit.clone();
    let key_id = state.active_key_id;
    let user_id = caller.id();
    let client = caller.client.clone();

    let inserted = db::run(&state.pool, move |conn| {
        conn.transaction(|conn| {
            let mut health_record_ids = Vec::with_capacity(stored.len());
            let mut document_ids = Vec::with_capacity(stored.len());

            for (file, storage_ref) in stored {
                let record_id = Uuid::new_v4();
                let document_id = Uuid::new_v4();
                let record_name = record_title(title.as_deref(), &file.filename, several);

                diesel::insert_into(health_records::table)
                    .values(
                        &new_record(
                            record_id,
                            user_id,
                            &record_name,
                            record_type,
                            description.as_deref(),
                            key_id,
                        )
                        .with_content(file.content),
                    )
                    .execute(conn)?;

                diesel::insert_into(documents::table)
                    .values(&NewDocument {
                        id: document_id,
                        health_record_id: record_id,
                        user_id,
                        filename: &file.filename,
                        mime_type: file.kind.mime_type(),
                        size_bytes: file.size_bytes,
                        sha256: &file.sha256,
                        storage_ref: &storage_ref,
                        encryption_iv: file.document.iv_b64(),
                        encryption_salt: file.document.salt_b64(),
                        encryption_key_id: key_id,
                    })
                    .execute(conn)?;

                let fhir_rows: Vec<NewFhirResource> = file
                    .resources
                    .iter()
                    .map(|(resource, payload)| NewFhirResource {
                        id: Uuid::new_v4(),
                        health_record_id: record_id,
                        user_id,
                        resource_type: resource.resource_type.clone(),
                        fhir_id: resource.fhir_id.clone(),
                        format: resource.format.as_str(),
                        resource_ciphertext: payload.ciphertext.clone(),
                        resource_iv: payload.iv_b64(),
                        resource_salt: payload.salt_b64(),
                    })
                    .collect();
                if !fhir_rows.is_empty() {
                    diesel::insert_into(fhir_resources::table)
                        .values(&fhir_rows)
                        .execute(conn)?;
                }

                audit.log_action(
                    conn,
                    AuditEntry::new(AuditAction::Create, RECORD_RESOURCE, record_id.to_string())
                        .user(user_id)
                        .client(&client)
                        .new_values(json!({
                            "title": record_name,
                            "recordType": record_type,
                            "filename": file.filename,
                            "mimeType": file.kind.mime_type(),
                            "sizeBytes": file.size_bytes,
                            "fhirResources": fhir_rows.len(),
                            "batchId": batch_id,
                        })),
                );
                health_record_ids.push(record_id);
                document_ids.push(document_id);
            }
            Ok::<_, ApiError>((health_record_ids, document_ids))
        })
    })
    .await;

    let (health_record_ids, document_ids) = match inserted {
        Ok(ids) => ids,
        Err(e) => {
            remove_blobs(state.blobs.as_ref(), &storage_refs).await;
            return Err(e);
        }
    };

    let files_processed = document_ids.len();
    tracing::info!(batch_id = %batch_id, files_processed, "File batch ingested");
    Ok(HttpResponse::Created().json(FileIngestResponse {
        batch_id,
        message: format!("Successfully processed {files_processed} file(s)"),
        files_processed,
        health_record_ids,
        document_ids,
    }))
}

pub async fn ingest_ehr(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    body: web::Json<EhrIngestRequest>,
) -> Result<HttpResponse> {
    caller.require_role(UserRole::Admin)?;
    let root = state
        .settings
        .ehr_import_root
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("EHR directory import is not configured".into()))?;
    let request = body.into_inner();

    let boundary = ingestion::import_boundary(&root)?;
    let input_dir = ingestion::confine(&boundary, &request.input_dir)?;
    if !input_dir.is_dir() {
        return Err(ApiError::Validation("input_dir: must be an existing directory".into()));
    }
    let output_dir = match request.output_dir.as_deref() {
        Some(dir) => ingestion::confine(&boundary, dir)?,
        None => ehr::default_output_dir(&boundary, &input_dir)?,
    };
    if output_dir == input_dir {
        return Err(ApiError::Validation("output_dir: must differ from input_dir".into()));
    }
    let schema_path = request
        .schema_json
        .as_deref()
        .map(|p| ingestion::confine(&boundary, p))
        .transpose()?;
    if schema_path.as_ref().is_some_and(|p| !p.is_file()) {
        return Err(ApiError::Validation("schema_json: must be an existing file".into()));
    }
    let layout = ehr::detect_layout(&input_dir);

    let audit = state.audit.clone();
    let details = json!({
        "inputDir": input_dir.strictpath_display().to_string(),
        "outputDir": output_dir.strictpath_display().to_string(),
        "schema": schema_path.as_ref().map(|p| p.strictpath_display().to_string()),
        "layout": layout,
    });
    let resource_id = input_dir.strictpath_display().to_string();
    db::run(&state.pool, move |conn| {
        audit.log_action(
            conn,
            AuditEntry::new(AuditAction::Create, EHR_IMPORT_RESOURCE, resource_id)
                .user(caller.id())
                .client(&caller.client)
                .new_values(details),
        );
        Ok(())
    })
    .await?;

    let response = json!({
        "message": "EHR ingestion process started in the background.",
        "input_dir": input_dir.strictpath_display().to_string(),
        "output_dir": output_dir.strictpath_display().to_string(),
        "layout": layout,
    });

    actix_web::rt::spawn(async move {
        let converted = web::block(move || {
            let schema = schema_path.and_then(|path| match ehr::load_schema(&path) {
                Ok(schema) => Some(schema),
                Err(e) => {
                    tracing::error!(error = %e, "Ignoring unreadable EHR schema file");
                    None
                }
            });
            ehr::convert_export(&input_dir, &output_dir, schema.as_ref())
        })
        .await;

        match converted {
            Ok(Ok(_report)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "EHR conversion failed"),
            Err(e) => tracing::error!(error = %e, "EHR conversion task did not complete"),
        }
    });

    Ok(HttpResponse::Accepted().json(response))
}
