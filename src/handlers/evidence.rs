use actix_web::web;
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::db;
use crate::error::{ApiError, Result};
use crate::evidence::{Article, DEFAULT_MAX_RESULTS};
use crate::models::AuditAction;
use crate::security::AuditEntry;
use crate::AppState;

/// Audit resource type for literature searches; the dashboard counts these.
pub const EVIDENCE_RESOURCE: &str = "Evidence";

fn default_max_results() -> u32 {
    DEFAULT_MAX_RESULTS
}

#[derive(Debug, Deserialize, Validate)]
pub struct EvidenceRequest {
    #[validate(length(min = 1, max = 500, message = "must be 1 to 500 characters"))]
    pub query: String,
    #[serde(default = "default_max_results")]
    #[validate(range(min = 1, max = 100, message = "must be between 1 and 100"))]
    pub max_results: u32,
}

impl EvidenceRequest {
    fn check(&self) -> Result<()> {
        self.validate()?;
        if self.query.trim().is_empty() {
            return Err(ApiError::Validation("query: must not be blank".into()));
        }
        Ok(())
    }
}

pub async fn pubmed(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    body: web::Json<EvidenceRequest>,
) -> Result<web::Json<Vec<Article>>> {
    let request = body.into_inner();
    request.check()?;
    let query = request.query.trim().to_string();

    let outcome = state.pubmed.search(&query, request.max_results).await;

    let mut entry = AuditEntry::new(AuditAction::Read, EVIDENCE_RESOURCE, "pubmed")
        .user(caller.id())
        .client(&caller.client);
    entry = match &outcome {
        Ok(articles) => entry.new_values(json!({
            "query": query,
            "maxResults": request.max_results,
            "resultCount": articles.len(),
        })),
        Err(err) => entry.failed(err.to_string()),
    };
    let audit = state.audit.clone();
    db::run(&state.pool, move |conn| {
        audit.log_action(conn, entry);
        Ok(())
    })
    .await?;

    let articles = outcome?;
    if articles.is_empty() {
        return Err(ApiError::NotFound("PubMed articles for this query".into()));
    }
    Ok(web::Json(articles))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> EvidenceRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn max_results_defaults_to_ten() {
        let req = request(r#"{"query":"metformin"}"#);
        assert_eq!(req.max_results, 10);
        assert!(req.check().is_ok());
    }

    #[test]
    fn max_results_outside_range_is_rejected() {
        assert!(request(r#"{"query":"metformin","max_results":0}"#).check().is_err());
        assert!(request(r#"{"query":"metformin","max_results":101}"#).check().is_err());
        assert!(request(r#"{"query":"metformin","max_results":100}"#).check().is_ok());
    }

    #[test]
    fn blank_query_is_rejected() {
        assert!(matches!(
            request(r#"{"query":"   "}"#).check(),
            Err(ApiError::Validation(_))
        ));
    }
}
