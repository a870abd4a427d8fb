use axum::Json;
use axum::extract::State;
use qwenproxy_core::AppState;
use qwenproxy_protocol::models::{ListModelsResponse, ModelEntry, ModelListObjectType, ModelObjectType};

const CATALOG_CREATED: i64 = 1_700_000_000;

/// Static, operator-configured catalog: a single entry for the one model
/// this proxy forwards to upstream.
pub async fn list_models(State(_state): State<AppState>) -> Json<ListModelsResponse> {
    Json(ListModelsResponse {
        object: ModelListObjectType::List,
        data: vec![ModelEntry {
            id: "qwen3-coder-plus".to_string(),
            object: ModelObjectType::Model,
            created: CATALOG_CREATED,
            owned_by: "qwenproxy".to_string(),
        }],
    })
}
