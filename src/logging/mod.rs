//! Logging configuration for dpmux
//!
//! Provides multi-level logging with configurable themes and optional file output.
//! Every line is tagged with the process role so the logs of both halves of a
//! middlebox can be interleaved.

use crate::driver::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ANSI color codes for log levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTheme {
    /// Color for TRACE level logs
    pub trace: String,
    /// Color for DEBUG level logs
    pub debug: String,
    /// Color for INFO level logs
    pub info: String,
    /// Color for WARN level logs
    pub warn: String,
    /// Color for ERROR level logs
    pub error: String,
    /// Color for the role tag
    #[serde(default = "default_role_color")]
    pub role: String,
}

fn default_role_color() -> String {
    "\x1b[35m".to_string() // Magenta
}

/// Default ANSI color theme
impl Default for LogTheme {
    fn default() -> Self {
        Self {
            trace: "\x1b[37m".to_string(), // White
            debug: "\x1b[36m".to_string(), // Cyan
            info: "\x1b[32m".to_string(),  // Green
            warn: "\x1b[33m".to_string(),  // Yellow
            error: "\x1b[31m".to_string(), // Red
            role: default_role_color(),
        }
    }
}

/// Initialize logging for one middlebox process
pub async fn init_logging(
    role: Role,
    log_level: &str,
    theme_path: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let theme = load_theme(theme_path).await?;
    let level = parse_log_level(log_level)?;

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let console_layer = fmt::layer().with_writer(std::io::stdout).with_ansi(true).event_format(LogFormatter {
        theme: theme.clone(),
        role,
        ansi: true,
    });

    let file_layer = if log_to_file {
        let (dir, file_name) = split_log_path(log_file_path, role);
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
        Some(fmt::layer().with_writer(file_appender).with_ansi(false).event_format(LogFormatter {
            theme,
            role,
            ansi: false,
        }))
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).try_init()?;
    } else {
        registry.with(console_layer).try_init()?;
    }

    Ok(())
}

/// Directory and file prefix for the rolling appender
fn split_log_path(path: Option<&str>, role: Role) -> (String, String) {
    let default_name = format!("dpmux-{}.log", role);
    match path.map(Path::new) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".to_string());
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(default_name);
            (dir, name)
        }
        None => ("logs".to_string(), default_name),
    }
}

/// Custom log formatter with theme colors
struct LogFormatter {
    theme: LogTheme,
    role: Role,
    ansi: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let datetime: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        write!(writer, "[{}] ", datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC"))?;

        if self.ansi {
            let level_color = match *metadata.level() {
                Level::TRACE => &self.theme.trace,
                Level::DEBUG => &self.theme.debug,
                Level::INFO => &self.theme.info,
                Level::WARN => &self.theme.warn,
                Level::ERROR => &self.theme.error,
            };
            write!(writer, "{}{:<5}\x1b[0m ", level_color, metadata.level())?;
            write!(writer, "{}{:<8}\x1b[0m ", self.theme.role, self.role)?;
        } else {
            write!(writer, "{:<5} {:<8} ", metadata.level(), self.role)?;
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Load log theme from YAML file
async fn load_theme<P: AsRef<Path>>(path: P) -> anyhow::Result<LogTheme> {
    match fs::read_to_string(&path).await {
        Ok(contents) => {
            let theme: LogTheme = serde_yaml::from_str(&contents)?;
            Ok(theme)
        }
        Err(err) => {
            // Subscriber is not installed yet
            eprintln!("Failed to read log theme {}: {}, using default theme", path.as_ref().display(), err);
            Ok(LogTheme::default())
        }
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}
