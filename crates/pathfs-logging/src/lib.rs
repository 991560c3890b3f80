// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized logging utilities for pathfs
//!
//! Hosts embedding `pathfs-core` call one of the `init*` functions once at
//! startup. The filter comes from `RUST_LOG` when set, otherwise from the
//! configured level applied both globally and to the component target.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Log verbosity as written in configuration files
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Logging section of a host configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    pub log_level: Option<LogLevel>,
    pub log_format: Option<LogFormat>,
    /// Log to this file instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Initialize logging for `component`.
    ///
    /// `debug` is the mount's protocol tracing toggle; it raises the default
    /// level to debug unless a level was configured explicitly.
    pub fn init(&self, component: &str, debug: bool) -> anyhow::Result<()> {
        let default_level = if debug { LogLevel::Debug } else { LogLevel::Info };
        let level = self.log_level.unwrap_or(default_level).into();
        let format = self.log_format.unwrap_or_default();
        match &self.log_file {
            Some(path) => init_to_file(component, level, format, path),
            None => init(component, level, format),
        }
    }
}

/// Platform log file location for `component`
///
/// - Linux: `~/.local/share/pathfs/<component>.log`
/// - macOS: `~/Library/Logs/pathfs/<component>.log`
/// - elsewhere: `~/pathfs/<component>.log`
pub fn standard_log_path(component: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    let mut path = {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("Library");
        path.push("Logs");
        path
    };

    #[cfg(target_os = "linux")]
    let mut path = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")));

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

    path.push("pathfs");
    path.push(format!("{}.log", component));
    path
}

/// Initialize logging to stdout.
///
/// # Example
/// ```rust,no_run
/// use pathfs_logging::{init, Level, LogFormat};
///
/// fn main() -> anyhow::Result<()> {
///     init("pathfs", Level::INFO, LogFormat::Plaintext)?;
///     tracing::info!("mount host started");
///     Ok(())
/// }
/// ```
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stdout)
}

/// Initialize logging to a file, creating parent directories as needed.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    init_with_writer(component, default_level, format, log_file)
}

fn env_filter(component: &str, default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},{}={}", default_level, component, default_level))
    })
}

/// Initialize logging with a custom writer
pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = env_filter(component, default_level);

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Per-test log files
///
/// Every test writes its full trace output to its own file under
/// `target/test-logs/<date>/`, so failures can be investigated without
/// flooding the test runner's output.
#[cfg(feature = "test-utils")]
pub mod test_utils {
    use std::env;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use chrono::Utc;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;
    use uuid::Uuid;

    /// Unique log file path for `test_name`.
    pub fn create_unique_test_log(test_name: &str) -> anyhow::Result<PathBuf> {
        let now = Utc::now();
        let log_dir = find_workspace_root()
            .join("target")
            .join("test-logs")
            .join(now.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&log_dir)?;

        let filename = format!(
            "{}-{}-{}.log",
            sanitize_filename(test_name),
            now.format("%H-%M-%S"),
            Uuid::new_v4()
        );
        Ok(log_dir.join(filename))
    }

    /// Trace-level log capture for one test.
    ///
    /// The subscriber is installed as the current thread's default while the
    /// value is alive; threads spawned by the code under test are not captured.
    pub struct TestLog {
        path: PathBuf,
        _guard: DefaultGuard,
    }

    impl TestLog {
        pub fn start(test_name: &str) -> anyhow::Result<Self> {
            let path = create_unique_test_log(test_name)?;
            let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let subscriber = tracing_subscriber::registry()
                .with(EnvFilter::new("pathfs=trace"))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                );
            let guard = tracing::subscriber::set_default(subscriber);
            tracing::info!(target: "pathfs::test", test = test_name, "test log started");
            Ok(Self {
                path,
                _guard: guard,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    fn find_workspace_root() -> PathBuf {
        let Ok(current_dir) = env::current_dir() else {
            return env::temp_dir();
        };

        let mut dir = current_dir.as_path();
        loop {
            let cargo_toml = dir.join("Cargo.toml");
            if let Ok(content) = fs::read_to_string(&cargo_toml) {
                if content.contains("[workspace]") {
                    return dir.to_path_buf();
                }
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return current_dir,
            }
        }
    }

    fn sanitize_filename(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
                _ => '_',
            })
            .collect()
    }

}
