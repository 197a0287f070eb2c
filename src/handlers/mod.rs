//! HTTP handlers and the route table.

pub mod auth;
pub mod dashboard;
pub mod evidence;
pub mod ingest;
pub mod records;
pub mod summarize;
pub mod system;
mod upload;

use actix_web::web;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        MessageResponse {
            message: message.into(),
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(system::root))
        .route("/health", web::get().to(system::health))
        .service(
            web::scope("/auth")
                .route("/register", web::post().to(auth::register))
                .route("/login", web::post().to(auth::login))
                .route("/logout", web::post().to(auth::logout))
                .route("/session/validate", web::get().to(auth::validate_session))
                .route("/password/change", web::post().to(auth::change_password))
                .route("/audit-trail", web::get().to(auth::audit_trail)),
        )
        .service(
            web::scope("/ingest")
                .route("/text", web::post().to(ingest::ingest_text))
                .route("/files", web::post().to(ingest::ingest_files))
                .route("/ehr", web::post().to(ingest::ingest_ehr)),
        )
        .service(
            web::scope("/records")
                .route("/{record_id}", web::get().to(records::get_record))
                .route("/{record_id}", web::delete().to(records::delete_record))
                .route(
                    "/{record_id}/documents/{document_id}",
                    web::get().to(records::download_document),
                )
                .route("/{record_id}/summaries", web::post().to(records::create_summary))
                .route("/{record_id}/access-history", web::get().to(records::access_history)),
        )
        .service(
            web::scope("/dashboard")
                .route("/stats", web::get().to(dashboard::stats))
                .route("/recent-uploads", web::get().to(dashboard::recent_uploads))
                .route("/health-summary", web::get().to(dashboard::health_summary))
                .route("/medical-records", web::get().to(dashboard::medical_records)),
        )
        .route("/models/", web::get().to(summarize::models))
        .route("/available-models/", web::get().to(summarize::available_models))
        .route("/summarize-pdf/", web::post().to(summarize::summarize_pdf))
        .route("/retrieve-evidence/pubmed", web::post().to(evidence::pubmed));
}
