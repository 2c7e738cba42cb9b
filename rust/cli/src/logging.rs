use std::io::IsTerminal;

use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

use common::{
    clap::{self, ValueEnum},
    eyre::Result,
    strum::AsRefStr,
    tracing::{metadata::LevelFilter, Event, Level, Subscriber},
};

/// Setup logging
///
/// # Arguments
///
/// - `level`: The minimum log level for log entries emitted by Resonance
/// - `filter`: The filter to apply to log entries emitted by other crates
/// - `format`: The handler to output log entries with
/// - `source`: Include the source file and line of each entry
/// - `timestamp`: Include a timestamp on each entry
/// - `force_color`: Use ANSI color even when stderr is not a terminal
pub fn setup(
    level: LoggingLevel,
    filter: &str,
    format: LoggingFormat,
    source: bool,
    timestamp: bool,
    force_color: bool,
) -> Result<()> {
    use common::eyre::{bail, Context};
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{fmt, registry, EnvFilter};

    let is_term = std::io::stderr().is_terminal();
    let (format, ansi) = match format {
        LoggingFormat::Auto => {
            if is_term {
                (LoggingFormat::Simple, true)
            } else {
                (LoggingFormat::Json, false)
            }
        }
        _ => (format, is_term),
    };
    let ansi = ansi || force_color;

    let filter = format!(
        "{}{}{}",
        level.as_ref(),
        if filter.is_empty() { "" } else { "," },
        filter
    );
    let filter_layer = EnvFilter::builder()
        .parse(&filter)
        .wrap_err_with(|| format!("Unable to parse logging filter: {filter}"))?;

    let error_layer = ErrorLayer::default();

    let registry = registry().with(filter_layer).with(error_layer);

    let format_layer = fmt::layer()
        .with_ansi(ansi)
        .with_file(source)
        .with_line_number(source)
        .with_writer(std::io::stderr);
    match (format, timestamp) {
        (LoggingFormat::Simple, _) => registry
            .with(format_layer.event_format(SimpleFormatter))
            .init(),
        (LoggingFormat::Compact, true) => registry.with(format_layer.compact()).init(),
        (LoggingFormat::Compact, false) => {
            registry.with(format_layer.compact().without_time()).init()
        }
        (LoggingFormat::Pretty, true) => registry.with(format_layer.pretty()).init(),
        (LoggingFormat::Pretty, false) => {
            registry.with(format_layer.pretty().without_time()).init()
        }
        (LoggingFormat::Full, true) => registry.with(format_layer).init(),
        (LoggingFormat::Full, false) => registry.with(format_layer.without_time()).init(),
        (LoggingFormat::Json, _) => registry.with(format_layer.json()).init(),
        (LoggingFormat::Auto, _) => bail!("Unhandled log format `{}`", format.as_ref()),
    };

    common::tracing::trace!("Logging set up finished");

    Ok(())
}

/// A `tracing` log level
#[derive(Debug, Copy, Clone, ValueEnum, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum LoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        use LoggingLevel::*;
        match value {
            Trace => LevelFilter::TRACE,
            Debug => LevelFilter::DEBUG,
            Info => LevelFilter::INFO,
            Warn => LevelFilter::WARN,
            Error => LevelFilter::ERROR,
        }
    }
}

/// A `tracing-subscriber` format
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/index.html#formatters
#[derive(Debug, Copy, Clone, ValueEnum, AsRefStr)]
pub enum LoggingFormat {
    Auto,
    Simple,
    Compact,
    Pretty,
    Full,
    Json,
}

struct SimpleFormatter;

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let level = event.metadata().level();

        let prefix = if std::io::stderr().is_terminal() {
            match level {
                &Level::TRACE => "🔬",
                &Level::DEBUG => "🔧",
                &Level::INFO => "ℹ️ ",
                &Level::WARN => "⚠️ ",
                &Level::ERROR => "🚨",
            }
        } else {
            level.as_str()
        };

        write!(writer, "{} ", prefix)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
