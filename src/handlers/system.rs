use actix_web::{web, HttpResponse};
use serde::Serialize;

use super::MessageResponse;
use crate::db;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub database: &'static str,
}

pub async fn root() -> web::Json<MessageResponse> {
    web::Json(MessageResponse::new("MediVault API is running!"))
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    if db::health_check(&state.pool).await {
        HttpResponse::Ok().json(HealthStatus {
            status: "healthy",
            database: "connected",
        })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthStatus {
            status: "unhealthy",
            database: "disconnected",
        })
    }
}
