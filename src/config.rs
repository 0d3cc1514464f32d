use std::{
    env,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

/// Top-level settings for the relay service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "RelaySettings::default_listen_host")]
    pub listen_host: String,
    #[serde(default = "RelaySettings::default_port")]
    pub port: u16,
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl RelaySettings {
    fn default_listen_host() -> String {
        "0.0.0.0".into()
    }

    const fn default_port() -> u16 {
        3000
    }

    /// Load settings from disk, writing defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Apply `PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_port_var(env::var("PORT").ok().as_deref())
    }

    fn apply_port_var(&mut self, value: Option<&str>) -> Result<()> {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(());
        };
        self.port = raw
            .parse()
            .with_context(|| format!("PORT must be a TCP port number, got '{raw}'"))?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = self.listen_host.trim().trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("invalid listen host: {}", self.listen_host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Set host and port from an `ADDR:PORT` string.
    pub fn set_listen_addr(&mut self, raw: &str) -> Result<()> {
        let addr: SocketAddr = raw
            .parse()
            .with_context(|| format!("invalid listen address: {raw}"))?;
        self.listen_host = addr.ip().to_string();
        self.port = addr.port();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.upload.validate()?;
        self.model.validate()?;
        Ok(())
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_host: Self::default_listen_host(),
            port: Self::default_port(),
            static_dir: None,
            upload: UploadSettings::default(),
            model: ModelSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

/// Limits and storage location for `POST /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default = "UploadSettings::default_dir")]
    pub dir: PathBuf,
    #[serde(default = "UploadSettings::default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "UploadSettings::default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "UploadSettings::default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl UploadSettings {
    fn default_dir() -> PathBuf {
        PathBuf::from("uploads")
    }

    const fn default_max_bytes() -> usize {
        10 * 1024 * 1024
    }

    const fn default_max_dimension() -> u32 {
        2048
    }

    fn default_allowed_extensions() -> Vec<String> {
        vec!["jpg".into(), "jpeg".into(), "png".into()]
    }

    /// Case-insensitive extension check; accepts the extension with or without a leading dot.
    pub fn allows_extension(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    fn validate(&self) -> Result<()> {
        if self.allowed_extensions.is_empty() {
            bail!("upload.allowed_extensions must list at least one extension");
        }
        if self.max_bytes == 0 {
            bail!("upload.max_bytes must be greater than zero");
        }
        if self.max_dimension == 0 {
            bail!("upload.max_dimension must be greater than zero");
        }
        Ok(())
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            max_bytes: Self::default_max_bytes(),
            max_dimension: Self::default_max_dimension(),
            allowed_extensions: Self::default_allowed_extensions(),
        }
    }
}

/// Remote generative model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "ModelSettings::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "ModelSettings::default_model")]
    pub model: String,
    #[serde(default = "ModelSettings::default_chat_path")]
    pub chat_path: String,
    #[serde(default = "ModelSettings::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ModelSettings {
    fn default_endpoint() -> String {
        "https://generativelanguage.googleapis.com".into()
    }

    fn default_model() -> String {
        "gemini-1.5-pro-latest".into()
    }

    fn default_chat_path() -> String {
        "v1beta/models/{model}:generateContent".into()
    }

    fn default_api_key_env() -> String {
        "API_KEY".into()
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.endpoint)
            .with_context(|| format!("invalid model endpoint URL: {}", self.endpoint))?;
        if self.model.trim().is_empty() {
            bail!("model.model must not be empty");
        }
        if self.api_key_env.trim().is_empty() {
            bail!("model.api_key_env must name an environment variable");
        }
        Ok(())
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            model: Self::default_model(),
            chat_path: Self::default_chat_path(),
            api_key_env: Self::default_api_key_env(),
            temperature: None,
            max_output_tokens: None,
            request_timeout_secs: None,
        }
    }
}

/// Opt-in service telemetry and trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub buffer_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_buffer_bytes: Option<u64>,
    #[serde(default)]
    pub traces: TraceSettings,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_dir: None,
            max_buffer_bytes: Some(512 * 1024),
            traces: TraceSettings::default(),
        }
    }
}

/// Controls structured JSON trace files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "imagechat", "imagechat")
        .context("Unable to resolve platform config directory")
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_service_contract() {
        let settings = RelaySettings::default();
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.upload.max_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.upload.max_dimension, 2048);
        assert_eq!(settings.model.api_key_env, "API_KEY");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_or_default_writes_missing_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.json");
        let settings = RelaySettings::load_or_default(&path).expect("load");
        assert!(path.exists());
        assert_eq!(settings.port, 3000);

        let reloaded = RelaySettings::load_or_default(&path).expect("reload");
        assert_eq!(reloaded.model.model, settings.model.model);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"port": 8080, "upload": {"dir": "/srv/uploads"}}"#).expect("write");

        let settings = RelaySettings::load_or_default(&path).expect("load");
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.upload.dir, PathBuf::from("/srv/uploads"));
        assert_eq!(settings.upload.max_dimension, 2048);
        assert_eq!(settings.listen_host, "0.0.0.0");
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        let err = RelaySettings::load_or_default(&path).expect_err("malformed");
        assert!(err.to_string().contains("Malformed config"));
    }

    #[test]
    fn port_variable_overrides_config() {
        let mut settings = RelaySettings::default();
        settings.apply_port_var(Some("4100")).expect("port");
        assert_eq!(settings.port, 4100);

        settings.apply_port_var(Some("  ")).expect("blank is ignored");
        assert_eq!(settings.port, 4100);

        assert!(settings.apply_port_var(Some("not-a-port")).is_err());
    }

    #[test]
    fn listen_addr_round_trips_through_setter() {
        let mut settings = RelaySettings::default();
        settings.set_listen_addr("127.0.0.1:9000").expect("addr");
        assert_eq!(settings.listen_addr().expect("addr").to_string(), "127.0.0.1:9000");
        assert!(settings.set_listen_addr("nowhere").is_err());
    }

    #[test]
    fn ipv6_listen_addr_round_trips_through_setter() {
        let mut settings = RelaySettings::default();
        settings.set_listen_addr("[::1]:9000").expect("addr");
        assert_eq!(settings.listen_host, "::1");
        assert_eq!(settings.listen_addr().expect("addr").to_string(), "[::1]:9000");
        settings.validate().expect("ipv6 listen address is valid");

        settings.listen_host = "[::]".into();
        settings.port = 3000;
        assert_eq!(settings.listen_addr().expect("addr").to_string(), "[::]:3000");
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let upload = UploadSettings::default();
        assert!(upload.allows_extension("JPG"));
        assert!(upload.allows_extension(".png"));
        assert!(!upload.allows_extension("gif"));
        assert!(!upload.allows_extension(""));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = RelaySettings::default();
        settings.model.endpoint = "not a url".into();
        assert!(settings.validate().is_err());

        let mut settings = RelaySettings::default();
        settings.upload.allowed_extensions.clear();
        assert!(settings.validate().is_err());
    }
}
