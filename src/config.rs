use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_root: PathBuf,
    pub transfer_jwt_secret: Option<String>,
    pub callback_ttl_seconds: i64,
    pub max_bytes_default: u64,
    pub manager_callback_url: Option<String>,
    pub archiver_bin: String,
    pub allowed_types: Vec<String>,
    pub download_idle_timeout_seconds: u64,
    pub static_tokens: HashMap<String, String>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let storage_root = std::env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data"));

        let allowed_types = std::env::var("STORAGE_ALLOWED_TYPES")
            .unwrap_or_else(|_| "archive,img".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut static_tokens = HashMap::new();
        if let Ok(hash) = std::env::var("STORAGE_MANAGE_TOKEN_HASH") {
            static_tokens.insert("storage_manage_token".to_string(), hash);
        }

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            storage_root,
            transfer_jwt_secret: std::env::var("TRANSFER_JWT_SECRET").ok(),
            callback_ttl_seconds: std::env::var("TRANSFER_CALLBACK_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            max_bytes_default: std::env::var("TRANSFER_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            manager_callback_url: std::env::var("MANAGER_CALLBACK_URL").ok(),
            archiver_bin: std::env::var("STORAGE_ARCHIVER_BIN").unwrap_or_else(|_| "7z".into()),
            allowed_types,
            download_idle_timeout_seconds: std::env::var("STORAGE_DOWNLOAD_IDLE_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            static_tokens,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage_root.join("temp")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.temp_dir().join(job_id)
    }

    pub fn type_root(&self, type_name: &str) -> PathBuf {
        self.storage_root.join(type_name)
    }
}
