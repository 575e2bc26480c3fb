// crates/server/src/routes/search.rs
//! Full-text search over the catalog's message projection.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/search", get(search))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchHitResponse {
    session_id: String,
    message_id: i64,
    snippet: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    hits: Vec<SearchHitResponse>,
}

/// GET /api/search?q=...&limit=N -- stems-first FTS with trigram fallback.
async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<SearchResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(500);
    let hits = angel_db::search::search_messages(&state.store.catalog(), &query.q, limit)?;
    Ok(Json(SearchResponse {
        hits: hits
            .into_iter()
            .map(|h| SearchHitResponse {
                session_id: h.session_id,
                message_id: h.message_id,
                snippet: h.snippet,
            })
            .collect(),
    }))
}
