//! MediVault: encrypted health-records API.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod evidence;
pub mod handlers;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod schema;
pub mod security;
pub mod storage;

use std::sync::Arc;

use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    middleware::from_fn,
    web, App,
};
use anyhow::Context;
use uuid::Uuid;

use crate::config::Settings;
use crate::crypto::EncryptionService;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::evidence::PubMedClient;
use crate::llm::LlmRouter;
use crate::middleware::RateLimiter;
use crate::security::{AuditService, PasswordService, SessionService};
use crate::storage::BlobStore;

/// Shared services handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: DbPool,
    pub crypto: Arc<EncryptionService>,
    pub passwords: PasswordService,
    pub audit: AuditService,
    pub sessions: SessionService,
    pub blobs: Arc<dyn BlobStore>,
    pub llm: LlmRouter,
    pub pubmed: PubMedClient,
    /// Id of the registered master key; new encrypted rows reference it.
    pub active_key_id: Option<Uuid>,
}

impl AppState {
    pub fn build(settings: Settings, pool: DbPool) -> anyhow::Result<Self> {
        let crypto = EncryptionService::load_or_create(&settings.master_key_file, settings.kdf_iterations)
            .context("failed to load master key")?;
        let passwords = PasswordService::new(settings.bcrypt_rounds);
        let audit = AuditService::new(&settings);
        let sessions = SessionService::new(&settings, passwords.clone(), audit.clone());
        let blobs: Arc<dyn BlobStore> = Arc::from(storage::from_settings(&settings)?);
        let llm = LlmRouter::from_settings(&settings)?;
        let pubmed = PubMedClient::from_settings(&settings)?;

        tracing::info!(storage = blobs.backend(), "Services initialised");
        Ok(AppState {
            settings: Arc::new(settings),
            pool,
            crypto: Arc::new(crypto),
            passwords,
            audit,
            sessions,
            blobs,
            llm,
            pubmed,
            active_key_id: None,
        })
    }

    pub fn with_active_key(mut self, key_id: Uuid) -> Self {
        self.active_key_id = Some(key_id);
        self
    }

    pub fn with_llm(mut self, llm: LlmRouter) -> Self {
        self.llm = llm;
        self
    }
}

/// Route table and middleware stack, shared by the server and the API tests.
pub fn build_app(
    state: AppState,
    limiter: web::Data<RateLimiter>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let json_config = web::JsonConfig::default()
        .limit(1024 * 1024)
        .error_handler(|err, _req| ApiError::Validation(format!("Invalid JSON body: {err}")).into());
    let query_config = web::QueryConfig::default()
        .error_handler(|err, _req| ApiError::Validation(format!("Invalid query string: {err}")).into());
    let path_config = web::PathConfig::default()
        .error_handler(|err, _req| ApiError::Validation(format!("Invalid path parameter: {err}")).into());

    App::new()
        .app_data(web::Data::new(state))
        .app_data(limiter)
        .app_data(json_config)
        .app_data(query_config)
        .app_data(path_config)
        .wrap(from_fn(middleware::rate_limit))
        .wrap(from_fn(middleware::security_headers))
        .wrap(from_fn(middleware::request_log))
        .configure(handlers::configure)
}
