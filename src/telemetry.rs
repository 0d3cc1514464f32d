use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::subscriber;
use tracing::{Subscriber, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings, project_dirs};

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

const TRACE_SUFFIX: &str = "trace.jsonl";

/// Install the tracing subscriber, with an optional daily-rolling JSON trace file.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    let default_level = if verbose {
        "imagechat=debug,tower_http=debug"
    } else {
        "imagechat=info"
    };
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match build_trace_writer(service, &telemetry.traces)? {
        Some((writer, guard, directory)) => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::TRACE),
                );
            let _ = TRACE_GUARD.set(guard);
            install_subscriber(subscriber)?;
            info!(directory = %directory.display(), "Writing JSON traces");
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

/// Daily `<service>.<date>.trace.jsonl` files; the appender drops the oldest
/// once more than `max_files` exist.
fn build_trace_writer(
    service: &str,
    settings: &TraceSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = resolve_trace_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(sanitize_service(service.to_string()))
        .filename_suffix(TRACE_SUFFIX);
    if settings.max_files > 0 {
        builder = builder.max_log_files(settings.max_files);
    }
    let appender = builder
        .build(&directory)
        .with_context(|| format!("Failed to open trace files in {}", directory.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok(Some((writer, guard, directory)))
}

fn resolve_trace_directory(settings: &TraceSettings) -> Result<PathBuf> {
    match &settings.directory {
        Some(dir) => Ok(dir.clone()),
        None => Ok(project_dirs()?.cache_dir().join("traces")),
    }
}

/// Opt-in JSONL event log for the relay service.
#[derive(Debug, Clone)]
pub struct ServiceTelemetry {
    service: String,
    settings: TelemetrySettings,
}

impl ServiceTelemetry {
    pub fn new(service: impl Into<String>, settings: &TelemetrySettings) -> Self {
        Self {
            service: sanitize_service(service.into()),
            settings: settings.clone(),
        }
    }

    pub fn record_startup(&self) {
        self.record(
            ServiceEventKind::Startup,
            Some("service started".to_string()),
            None,
            None,
        );
    }

    pub fn record_shutdown(&self) {
        self.record(
            ServiceEventKind::Shutdown,
            Some("service stopped".to_string()),
            None,
            None,
        );
    }

    /// Record a structured metric or state change with additional JSON details.
    pub fn record_metric(&self, event: impl Into<String>, details: Value) {
        self.record(
            ServiceEventKind::Message,
            Some(event.into()),
            None,
            Some(details),
        );
    }

    /// Record a failure, capturing both user-facing and debug renderings.
    pub fn record_error<E>(&self, error: &E)
    where
        E: std::fmt::Display + std::fmt::Debug,
    {
        let display = error.to_string();
        let debug = format!("{error:?}");
        let details = Some(json!({ "debug": debug }));
        self.record(ServiceEventKind::Error, Some(display), Some(debug), details);
    }

    fn record(
        &self,
        kind: ServiceEventKind,
        message: Option<String>,
        error: Option<String>,
        details: Option<Value>,
    ) {
        if !self.settings.enabled {
            return;
        }

        if let Err(err) =
            write_service_event(&self.service, &self.settings, kind, message, error, details)
        {
            warn!(service = %self.service, warning = %err, "Failed to write telemetry event");
        }
    }
}

#[derive(Clone, Serialize)]
struct ServiceEvent {
    service: String,
    kind: ServiceEventKind,
    timestamp: DateTime<Utc>,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "snake_case")]
enum ServiceEventKind {
    Startup,
    Shutdown,
    Message,
    Error,
}

fn write_service_event(
    service: &str,
    settings: &TelemetrySettings,
    kind: ServiceEventKind,
    message: Option<String>,
    error: Option<String>,
    details: Option<Value>,
) -> Result<()> {
    let (path, limit) = resolve_buffer_path(service, settings)?;
    rotate_if_full(&path, limit)?;

    let event = ServiceEvent {
        service: service.to_string(),
        kind,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        message,
        error,
        details,
    };

    append_event(&path, &event)
}

fn resolve_buffer_path(
    service: &str,
    settings: &TelemetrySettings,
) -> Result<(PathBuf, Option<u64>)> {
    let base = match &settings.buffer_dir {
        Some(dir) => dir.clone(),
        None => project_dirs()?.data_dir().join("telemetry"),
    };

    fs::create_dir_all(&base)
        .with_context(|| format!("Failed to create telemetry directory {}", base.display()))?;

    Ok((base.join(format!("{service}.jsonl")), settings.max_buffer_bytes))
}

/// Move a full buffer aside as `<service>.<timestamp>.jsonl` so appends start fresh.
fn rotate_if_full(path: &Path, limit: Option<u64>) -> Result<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };
    if metadata.len() < limit {
        return Ok(());
    }

    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let rotated = path.with_extension(format!("{stamp}.jsonl"));
    fs::rename(path, &rotated).with_context(|| {
        format!(
            "Failed to rotate telemetry buffer {} to {}",
            path.display(),
            rotated.display()
        )
    })
}

fn append_event(path: &Path, event: &ServiceEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()))
        .with_context(|| format!("Failed to append telemetry event to {}", path.display()))
}

/// Lowercase the name and replace anything outside `[a-z0-9_-]` with `-`.
fn sanitize_service(service: String) -> String {
    service
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn enabled_settings(dir: &Path, max_buffer_bytes: Option<u64>) -> TelemetrySettings {
        TelemetrySettings {
            enabled: true,
            buffer_dir: Some(dir.to_path_buf()),
            max_buffer_bytes,
            traces: TraceSettings::default(),
        }
    }

    #[test]
    fn sanitize_service_normalises_name() {
        assert_eq!(sanitize_service("Image Chat@2024".to_string()), "image-chat-2024");
    }

    #[test]
    fn disabled_telemetry_writes_nothing() {
        let dir = tempdir().expect("temp directory");
        let mut settings = enabled_settings(dir.path(), None);
        settings.enabled = false;

        let telemetry = ServiceTelemetry::new("imagechat", &settings);
        telemetry.record_startup();
        assert!(!dir.path().join("imagechat.jsonl").exists());
    }

    #[test]
    fn record_startup_persists_event() {
        let dir = tempdir().expect("temp directory");
        let telemetry = ServiceTelemetry::new("imagechat", &enabled_settings(dir.path(), Some(4096)));
        telemetry.record_startup();
        telemetry.record_shutdown();

        let contents =
            fs::read_to_string(dir.path().join("imagechat.jsonl")).expect("telemetry file");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).expect("startup json");
        assert_eq!(first["service"], "imagechat");
        assert_eq!(first["kind"], "startup");
    }

    #[test]
    fn record_metric_writes_details() {
        let dir = tempdir().expect("temp directory");
        let telemetry = ServiceTelemetry::new("imagechat", &enabled_settings(dir.path(), Some(4096)));
        telemetry.record_metric(
            "model_success",
            json!({ "model": "gemini-1.5-pro-latest", "latency_ms": 1200 }),
        );

        let contents =
            fs::read_to_string(dir.path().join("imagechat.jsonl")).expect("telemetry file");
        let event: Value = serde_json::from_str(contents.trim()).expect("event json");
        assert_eq!(event["kind"], "message");
        assert_eq!(event["message"], "model_success");
        assert_eq!(event["details"]["latency_ms"], 1200);
    }

    #[test]
    fn buffer_rotates_when_limit_reached() {
        let dir = tempdir().expect("temp directory");
        let telemetry = ServiceTelemetry::new("imagechat", &enabled_settings(dir.path(), Some(1)));
        telemetry.record_startup();
        telemetry.record_shutdown();

        let files = fs::read_dir(dir.path()).expect("list").count();
        assert_eq!(files, 2);
        let contents =
            fs::read_to_string(dir.path().join("imagechat.jsonl")).expect("telemetry file");
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn rotated_buffer_keeps_json_extension() {
        let dir = tempdir().expect("temp directory");
        let telemetry = ServiceTelemetry::new("imagechat", &enabled_settings(dir.path(), Some(1)));
        telemetry.record_startup();
        telemetry.record_shutdown();

        let rotated: Vec<String> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "imagechat.jsonl")
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].starts_with("imagechat."));
        assert!(rotated[0].ends_with(".jsonl"));
    }

    #[test]
    fn disabled_traces_build_no_writer() {
        let settings = TraceSettings::default();
        assert!(!settings.enabled);
        assert!(build_trace_writer("imagechat", &settings).expect("build").is_none());
    }

    #[test]
    fn trace_writer_creates_rolling_file_in_directory() {
        let dir = tempdir().expect("temp directory");
        let settings = TraceSettings {
            enabled: true,
            directory: Some(dir.path().join("traces")),
            max_files: 3,
        };

        let (mut writer, guard, directory) = build_trace_writer("Image Chat", &settings)
            .expect("build")
            .expect("writer");
        writer.write_all(b"{\"message\":\"hello\"}\n").expect("write");
        drop(writer);
        drop(guard);

        assert_eq!(directory, dir.path().join("traces"));
        let names: Vec<String> = fs::read_dir(&directory)
            .expect("list")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("image-chat."));
        assert!(names[0].ends_with(TRACE_SUFFIX));
    }
}
