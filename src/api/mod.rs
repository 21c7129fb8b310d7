pub mod http;
pub mod middleware;
mod routes;
pub mod ws_broker;
pub mod ws_terminal;

use std::sync::Arc;

use axum::Router;

use crate::auth::SessionToken;
use crate::broker::Registry;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub token: SessionToken,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
