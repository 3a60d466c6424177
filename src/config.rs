use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub verification_timeout_seconds: u64,
    pub transfer_idle_timeout_seconds: u64,
    pub download_dir: PathBuf,
    pub service_name: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("DRIFTWOOD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            verification_timeout_seconds: env::var("DRIFTWOOD_VERIFY_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
            transfer_idle_timeout_seconds: env::var("DRIFTWOOD_TRANSFER_IDLE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            download_dir: env::var("DRIFTWOOD_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("downloads")),
            service_name: env::var("DRIFTWOOD_SERVICE_NAME")
                .unwrap_or_else(|_| "Driftwood".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            verification_timeout_seconds: 60,
            transfer_idle_timeout_seconds: 300,
            download_dir: PathBuf::from("downloads"),
            service_name: "Driftwood".to_string(),
        }
    }
}
