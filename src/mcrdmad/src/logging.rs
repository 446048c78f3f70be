use std::fmt;
use std::path::Path;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use mcrdma::Config;

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (s, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(s))
        } else {
            f.pad(s)
        }
    }
}

/// `[time LEVEL file:line] span: fields`
struct McFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for McFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let level = FmtLevel {
            level: metadata.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };

        write!(
            writer,
            "[{} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Sets up the global subscriber. The level comes from the config unless `MCRDMA_LOG` is set.
/// With `log_file` set, events also go to that file through a background writer; the returned
/// guard flushes it on drop.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    const LOG_ENV: &str = "MCRDMA_LOG";

    let env_filter = || -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::builder()
            .with_default_directive(config.log_level.parse()?)
            .with_env_var(LOG_ENV)
            .from_env_lossy())
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(McFormatter { ansi })
        .with_filter(env_filter()?);
    let registry = tracing_subscriber::registry().with(stdout_layer);

    match &config.log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(McFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter()?);
            registry.with(file_layer).init();
            tracing::info!("logging to {}", path.display());
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}
