use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub push_url: String,
    pub refresh_path: String,
    pub connect_timeout: Duration,
    pub refresh_wait_timeout: Duration,
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_auth_failures: u32,
    pub expiry_skew: Duration,
    pub data_dir: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api".into(),
            push_url: "ws://127.0.0.1:8080/ws".into(),
            refresh_path: "/auth/refresh".into(),
            connect_timeout: Duration::from_secs(10),
            refresh_wait_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(1),
            max_auth_failures: 5,
            expiry_skew: Duration::from_secs(30),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl ClientSettings {
    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = api_base_url.into();
        if let Some(push_url) = push_url_from_api_base(&self.api_base_url) {
            self.push_url = push_url;
        }
        self
    }

    pub fn credential_file(&self) -> PathBuf {
        self.data_dir.join("credential.json")
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_overrides(&mut settings, |key| {
                file_cfg.get(key).map(|value| match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            });
        }
    }

    apply_overrides(&mut settings, |key| {
        let key = key.to_ascii_uppercase();
        std::env::var(format!("APP__{key}"))
            .ok()
            .or_else(|| std::env::var(format!("NOTIFY_{key}")).ok())
    });

    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_url") {
        *settings = settings.clone().with_api_base_url(v);
    }
    if let Some(v) = lookup("push_url") {
        settings.push_url = v;
    }
    if let Some(v) = lookup("refresh_path") {
        settings.refresh_path = v;
    }
    if let Some(v) = lookup("data_dir") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = parse_secs(lookup("connect_timeout_secs")) {
        settings.connect_timeout = v;
    }
    if let Some(v) = parse_secs(lookup("refresh_wait_timeout_secs")) {
        settings.refresh_wait_timeout = v;
    }
    if let Some(v) = parse_secs(lookup("health_check_interval_secs")) {
        settings.health_check_interval = v;
    }
    if let Some(v) = parse_secs(lookup("reconnect_delay_secs")) {
        settings.reconnect_delay = v;
    }
    if let Some(v) = parse_secs(lookup("expiry_skew_secs")) {
        settings.expiry_skew = v;
    }
    if let Some(v) = lookup("max_auth_failures").and_then(|v| v.trim().parse::<u32>().ok()) {
        settings.max_auth_failures = v;
    }
}

fn parse_secs(raw: Option<String>) -> Option<Duration> {
    raw?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub fn push_url_from_api_base(api_base_url: &str) -> Option<String> {
    let mut url = url::Url::parse(api_base_url.trim()).ok()?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/ws");
    url.set_query(None);
    Some(url.to_string())
}

pub fn prepare_data_dir(settings: &ClientSettings) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "failed to create data directory '{}'",
            settings.data_dir.display()
        )
    })?;
    Ok(settings.data_dir.clone())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
