use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Target used for per-request access events.
pub const ACCESS_LOG_TARGET: &str = "access_log";

/// Keeps the background log writers alive. Dropping it flushes pending lines.
#[derive(Debug)]
pub struct LogGuards {
    _system: Option<tracing_appender::non_blocking::WorkerGuard>,
    _access: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// One line per request: `remote "METHOD uri" status handler latency_ms=...`.
#[derive(Debug, Clone, Copy, Default)]
struct AccessLineFormat {
    timer: tracing_subscriber::fmt::time::SystemTime,
}

#[derive(Default)]
struct AccessLineFields {
    remote: Option<String>,
    method: Option<String>,
    uri: Option<String>,
    status: Option<u64>,
    handler: Option<String>,
    request_id: Option<String>,
    latency_ms: Option<f64>,
}

impl tracing::field::Visit for AccessLineFields {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if field.name() == "latency_ms" {
            self.latency_ms = Some(value);
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        if field.name() == "status" {
            self.status = Some(value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_value(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.record_value(field.name(), format!("{value:?}"));
    }
}

impl AccessLineFields {
    fn record_value(&mut self, name: &str, value: String) {
        match name {
            "remote" => self.remote = Some(value),
            "method" => self.method = Some(value),
            "uri" => self.uri = Some(value),
            "handler" => self.handler = Some(value),
            "request_id" => self.request_id = Some(value),
            _ => {}
        }
    }
}

impl<S, N> tracing_subscriber::fmt::format::FormatEvent<S, N> for AccessLineFormat
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> tracing_subscriber::fmt::format::FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = AccessLineFields::default();
        event.record(&mut fields);

        writer.write_str(fields.remote.as_deref().unwrap_or("-"))?;
        writer.write_str(" [")?;
        self.timer.format_time(&mut writer)?;
        write!(
            writer,
            "] \"{} {}\" {} {}",
            fields.method.as_deref().unwrap_or("-"),
            fields.uri.as_deref().unwrap_or("-"),
            fields.status.unwrap_or(0),
            fields.handler.as_deref().unwrap_or("-"),
        )?;
        if let Some(latency_ms) = fields.latency_ms {
            write!(writer, " latency_ms={latency_ms:.3}")?;
        }
        if let Some(request_id) = fields.request_id.as_deref() {
            write!(writer, " request_id={request_id}")?;
        }
        writer.write_char('\n')
    }
}

/// Install the global subscriber.
///
/// System events go to `logging.path` or stderr, filtered by `RUST_LOG` or
/// `logging.level`. Access events go to `logging.access_path` when set and
/// otherwise stay in the system log.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuards> {
    use tracing_subscriber::filter::Directive;
    use tracing_subscriber::filter::{LevelFilter, Targets};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let mut system_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    if config.access_path.is_some() {
        system_filter = system_filter.add_directive(
            format!("{ACCESS_LOG_TARGET}=off").parse::<Directive>()?,
        );
    }

    let (system_writer, system_guard) = match config.path.as_deref() {
        Some(path) => {
            let (writer, guard) = build_file_writer(path, "system log")?;
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
            None,
        ),
    };
    let ansi = config.path.is_none();
    let format = config.format.to_ascii_lowercase();
    let system_layer = match format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(system_writer)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(system_filter)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(system_writer)
            .pretty()
            .with_filter(system_filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(system_writer)
            .compact()
            .with_filter(system_filter)
            .boxed(),
    };

    let (access_layer, access_guard) = match config.access_path.as_deref() {
        Some(path) => {
            let (writer, guard) = build_file_writer(path, "access log")?;
            let filter = Targets::new().with_target(ACCESS_LOG_TARGET, LevelFilter::INFO);
            let layer = if format == "json" {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_filter(filter)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .event_format(AccessLineFormat::default())
                    .with_filter(filter)
                    .boxed()
            };
            (layer, Some(guard))
        }
        None => (tracing_subscriber::layer::Identity::new().boxed(), None),
    };

    tracing_subscriber::registry()
        .with(system_layer.and_then(access_layer).boxed())
        .try_init()?;

    Ok(LogGuards {
        _system: system_guard,
        _access: access_guard,
    })
}

fn build_file_writer(
    path: &Path,
    label: &'static str,
) -> Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    use tracing_appender::non_blocking::NonBlockingBuilder;
    use tracing_appender::rolling;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("{label}: failed to create log directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{label}: log path must include a valid file name"))?;

    let appender = rolling::never(&dir, file_name);
    Ok(NonBlockingBuilder::default().lossy(false).finish(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/logs/prism.log");
        let (_writer, guard) = build_file_writer(&path, "test").expect("writer");
        drop(guard);
        assert!(dir.path().join("nested/logs").is_dir());
    }

    #[test]
    fn file_writer_requires_file_name() {
        assert!(build_file_writer(Path::new("/"), "test").is_err());
    }
}
