use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    /// Shared client for provider calls and notification delivery; carries
    /// the bounded provider timeout so no external call blocks indefinitely.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(pool: PgPool, settings: Settings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.provider_timeout_secs))
            .build()?;
        Ok(Self {
            pool,
            settings: Arc::new(settings),
            http,
        })
    }
}
