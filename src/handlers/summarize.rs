//! Model registry and one-shot PDF summarisation. Uploaded PDFs are sent to
//! the provider and never stored.

use std::collections::BTreeMap;

use actix_multipart::Multipart;
use actix_web::web;
use serde::Serialize;
use serde_json::json;

use super::upload::{self, UploadLimits, UploadedFile};
use crate::auth::AuthenticatedUser;
use crate::crypto::sha256_hex;
use crate::db;
use crate::error::{ApiError, Result};
use crate::ingest::{self, FileKind};
use crate::llm::{ModelInfo, SummaryInput};
use crate::models::AuditAction;
use crate::security::AuditEntry;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PdfSummary {
    pub summary: String,
}

fn configured_models(state: &AppState) -> Result<BTreeMap<&'static str, Vec<ModelInfo>>> {
    let models = state.llm.available_models();
    if models.values().all(Vec::is_empty) {
        return Err(ApiError::ServiceUnavailable(
            "No LLM providers are configured".into(),
        ));
    }
    Ok(models)
}

pub async fn models(state: web::Data<AppState>) -> Result<web::Json<BTreeMap<&'static str, Vec<ModelInfo>>>> {
    configured_models(&state).map(web::Json)
}

pub async fn available_models(
    state: web::Data<AppState>,
) -> Result<web::Json<BTreeMap<&'static str, Vec<ModelInfo>>>> {
    tracing::info!("Available models requested");
    configured_models(&state).map(web::Json)
}

/// Only `.pdf` uploads are accepted here; the shared upload checks cover
/// emptiness, size and the `%PDF-` header.
fn check_pdf(file: &UploadedFile, max_bytes: usize) -> Result<()> {
    if FileKind::from_filename(&file.filename) != Some(FileKind::Pdf) {
        return Err(ApiError::Validation(
            "Invalid file type. Only PDF files are accepted.".into(),
        ));
    }
    ingest::validate_upload(&file.filename, &file.bytes, max_bytes)?;
    Ok(())
}

pub async fn summarize_pdf(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    payload: Multipart,
) -> Result<web::Json<PdfSummary>> {
    let limits = UploadLimits::from_settings(&state.settings).single_file();
    let mut form = upload::read_form(payload, limits).await?;
    let provider = form
        .text("provider")
        .ok_or_else(|| ApiError::Validation("provider: is required".into()))?
        .to_string();
    let model_id = form.text("model_id").map(str::to_string);
    let file = form
        .take_files("file")
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Validation("file: a PDF upload is required".into()))?;
    check_pdf(&file, limits.max_file_bytes)?;

    tracing::info!(
        filename = %file.filename,
        provider = %provider,
        size_bytes = file.bytes.len(),
        "PDF summarization requested"
    );

    let outcome = state
        .llm
        .summarize(
            &provider,
            model_id.as_deref(),
            SummaryInput::Pdf {
                filename: &file.filename,
                bytes: &file.bytes,
            },
        )
        .await;

    let mut entry = AuditEntry::new(AuditAction::Share, "Document", sha256_hex(&file.bytes))
        .user(caller.id())
        .client(&caller.client);
    entry = match &outcome {
        Ok((provider, model, _)) => entry.new_values(json!({
            "filename": file.filename,
            "provider": provider.as_str(),
            "model": model,
        })),
        Err(err) => entry.failed(err.to_string()),
    };
    let audit = state.audit.clone();
    db::run(&state.pool, move |conn| {
        audit.log_action(conn, entry);
        Ok(())
    })
    .await?;

    let (_, _, summary) = outcome?;
    Ok(web::Json(PdfSummary { summary }))
}
