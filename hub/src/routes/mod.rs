pub mod replay;
pub mod system;
pub mod write;

use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

/// Assemble the API router.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(replay::routes())
        .merge(write::routes())
        .merge(system::routes())
}
