use crate::config::AppConfig;
use crate::jobs::registry::JobRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub registry: JobRegistry,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.download_idle_timeout_seconds))
                .build()
                .expect("failed to build http client"),
            config,
            registry: JobRegistry::new(),
        }
    }
}
