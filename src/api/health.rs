use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::payments::PaymentMethod;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub payment_methods: Vec<PaymentMethod>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let payment_methods = state.orchestrator.available_methods();

    Json(HealthResponse {
        status: if payment_methods.is_empty() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.environment.clone(),
        payment_methods,
    })
}
