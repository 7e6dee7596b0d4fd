//! Shared application state handed to every handler and background task.

use std::sync::Arc;

use crate::config::Config;
use crate::registry::ServerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub http: reqwest::Client,
    pub config: Config,
}
