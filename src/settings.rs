use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "http://localhost:8080";
const DEFAULT_REVEAL_INTERVAL_MS: u64 = 20;
const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub api_base: Option<String>,
    pub realtime_url: Option<String>,
    pub reveal_interval_ms: Option<u64>,
    pub upload_chunk_bytes: Option<usize>,
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("parse settings.json failed")?;
    Ok(v)
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(data_dir).ok();
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).context("write settings.json failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub realtime_url: Option<String>,
    pub reveal_interval: Duration,
    pub upload_chunk_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            realtime_url: None,
            reveal_interval: Duration::from_millis(DEFAULT_REVEAL_INTERVAL_MS),
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
        }
    }
}

fn normalize_api_base(s: &str) -> String {
    let mut t = s.trim().trim_end_matches('/').to_string();
    if t.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }

    // Allow users to paste a full endpoint and still work.
    for suffix in ["/tuning-chat", "/get_presigned_url"] {
        if let Some(stripped) = t.strip_suffix(suffix) {
            t = stripped.to_string();
        }
    }
    t.trim_end_matches('/').to_string()
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn load_config(data_dir: &Path) -> ClientConfig {
    let s = load_settings(data_dir).unwrap_or_default();

    let api_base = s
        .api_base
        .or_else(|| std::env::var("TUNEDCHAT_API_BASE").ok())
        .unwrap_or_default();

    let realtime_url = s
        .realtime_url
        .or_else(|| std::env::var("TUNEDCHAT_REALTIME_URL").ok())
        .and_then(non_empty);

    ClientConfig {
        api_base: normalize_api_base(&api_base),
        realtime_url,
        reveal_interval: Duration::from_millis(
            s.reveal_interval_ms.unwrap_or(DEFAULT_REVEAL_INTERVAL_MS),
        ),
        upload_chunk_bytes: s
            .upload_chunk_bytes
            .unwrap_or(DEFAULT_UPLOAD_CHUNK_BYTES)
            .max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_api_base_handles_empty_and_endpoint_suffix() {
        assert_eq!(normalize_api_base(""), DEFAULT_API_BASE);
        assert_eq!(
            normalize_api_base(" http://localhost:8080/ "),
            "http://localhost:8080"
        );
        assert_eq!(
            normalize_api_base("http://api.server/tuning-chat"),
            "http://api.server"
        );
        assert_eq!(
            normalize_api_base("http://api.server/get_presigned_url/"),
            "http://api.server"
        );
    }

    #[test]
    fn load_config_falls_back_to_defaults() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(td.path());
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert!(cfg.realtime_url.is_none());
        assert_eq!(cfg.reveal_interval, Duration::from_millis(20));
        assert!(cfg.upload_chunk_bytes > 0);
    }

    #[test]
    fn settings_roundtrip() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = Settings {
            api_base: Some("http://chat.example/tuning-chat".to_string()),
            realtime_url: Some("wss://chat.example/socket".to_string()),
            reveal_interval_ms: Some(5),
            upload_chunk_bytes: Some(1024),
        };
        save_settings(td.path(), &s).expect("save");
        let cfg = load_config(td.path());
        assert_eq!(cfg.api_base, "http://chat.example");
        assert_eq!(cfg.realtime_url.as_deref(), Some("wss://chat.example/socket"));
        assert_eq!(cfg.reveal_interval, Duration::from_millis(5));
        assert_eq!(cfg.upload_chunk_bytes, 1024);
    }
}
