//! Error types for the MediVault API

use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::json;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::evidence::EvidenceError;
use crate::ingest::IngestError;
use crate::llm::LlmError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(DieselError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            ApiError::Unprocessable(_) => "UNPROCESSABLE_ENTITY",
            ApiError::RateLimited => "RATE_LIMIT_EXCEEDED",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Database(_)
            | ApiError::Pool(_)
            | ApiError::Crypto(_)
            | ApiError::Internal(_)
            | ApiError::Other(_) => "INTERNAL_ERROR",
        }
    }

    fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl From<DieselError> for ApiError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => ApiError::NotFound("Resource".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                ApiError::Conflict("Resource already exists".to_string())
            }
            other => ApiError::Database(other),
        }
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Internal(format!("blocking task failed: {err}"))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let detail = errs
                    .iter()
                    .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                    .next()
                    .unwrap_or_else(|| "is invalid".to_string());
                format!("{field}: {detail}")
            })
            .collect();
        messages.sort();
        ApiError::Validation(messages.join("; "))
    }
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        ApiError::Validation(format!("Invalid multipart payload: {err}"))
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ApiError::NotFound("Document".to_string()),
            StorageError::Ipfs(msg) => {
                tracing::error!(error = %msg, "IPFS request failed");
                ApiError::ServiceUnavailable("Document storage is unavailable".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedType(_) => ApiError::UnsupportedMediaType(err.to_string()),
            IngestError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            IngestError::Io(e) => ApiError::Internal(e.to_string()),
            IngestError::ImportRoot(_) => ApiError::ServiceUnavailable(err.to_string()),
            IngestError::Validation(_)
            | IngestError::Empty(_)
            | IngestError::InvalidFhir(_)
            | IngestError::OutsideRoot(_) => ApiError::Validation(err.to_string()),
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::UnknownProvider(_) | LlmError::InvalidModel(_) => {
                ApiError::Validation(err.to_string())
            }
            LlmError::NotConfigured(_) => ApiError::ServiceUnavailable(err.to_string()),
            LlmError::Http(_) | LlmError::Api { .. } | LlmError::EmptyResponse(_) => {
                tracing::error!(error = %err, "LLM provider call failed");
                ApiError::Upstream(err.to_string())
            }
        }
    }
}

impl From<EvidenceError> for ApiError {
    fn from(err: EvidenceError) -> Self {
        tracing::error!(error = %err, "PubMed request failed");
        ApiError::Upstream("Evidence service is unavailable".to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_)
            | ApiError::Pool(_)
            | ApiError::Crypto(_)
            | ApiError::Internal(_)
            | ApiError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Internal details stay in the logs.
        let message = if self.is_internal() {
            tracing::error!(error = %self, "Internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut builder = HttpResponse::build(self.status_code());
        if matches!(self, ApiError::RateLimited) {
            builder.insert_header((header::RETRY_AFTER, "60"));
        }
        builder.json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotFound("Record".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ApiError::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::Crypto(CryptoError::Decrypt).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn diesel_errors_are_classified() {
        assert!(matches!(ApiError::from(DieselError::NotFound), ApiError::NotFound(_)));
        assert!(matches!(
            ApiError::from(DieselError::RollbackTransaction),
            ApiError::Database(_)
        ));
    }

    #[actix_web::test]
    async fn internal_errors_hide_details() {
        let response = ApiError::Internal("master key path leaked".into()).error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(value["error"]["message"], "Internal server error");
    }

    #[actix_web::test]
    async fn rate_limited_carries_retry_after() {
        let response = ApiError::RateLimited.error_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn module_errors_map_to_statuses() {
        let too_large = ApiError::from(IngestError::TooLarge {
            filename: "scan.pdf".into(),
            limit: 10,
        });
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ApiError::from(IngestError::UnsupportedType("a.exe".into())).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiError::from(LlmError::UnknownProvider("mistral".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(LlmError::NotConfigured(crate::llm::Provider::Google)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(EvidenceError::Status(500)).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(StorageError::NotFound("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn not_found_message_names_resource() {
        assert_eq!(ApiError::NotFound("Health record".into()).to_string(), "Health record not found");
    }
}
