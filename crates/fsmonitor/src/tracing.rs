use std::{io::IsTerminal, sync::Mutex};

use chrono::Local;
use owo_colors::OwoColorize;
use tracing::{metadata::LevelFilter, trace, Event, Level, Subscriber};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::RollingFileAppender,
};
use tracing_subscriber::{
    filter::Filtered,
    fmt::{
        self,
        format::{DefaultFields, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    prelude::*,
    registry::LookupSpan,
    reload::{self, Error, Handle},
    EnvFilter, Layer, Registry,
};

const VERBOSITY_ENV_VAR: &str = "FSMONITOR_LOG_VERBOSITY";

type StdErrLog = Filtered<
    tracing_subscriber::fmt::Layer<Registry, DefaultFields, FsmonitorFormatter, fn() -> std::io::Stderr>,
    EnvFilter,
    Registry,
>;

type DaemonLog = tracing_subscriber::fmt::Layer<
    Layered,
    DefaultFields,
    tracing_subscriber::fmt::format::Format,
    NonBlocking,
>;

type Layered = tracing_subscriber::layer::Layered<StdErrLog, Registry>;

pub struct FsmonitorSubscriber {
    update: Handle<Option<DaemonLog>, Layered>,

    /// The non-blocking file logger only writes while this guard is alive.
    guard: Mutex<Option<WorkerGuard>>,
}

impl FsmonitorSubscriber {
    /// Installs the global subscriber with a stderr layer.
    ///
    /// - `FSMONITOR_LOG_VERBOSITY` sets the filter, in `RUST_LOG` syntax.
    ///   The default is `WARN`.
    /// - A non-zero `verbosity` (from `-v` flags) overrides the global level
    ///   but keeps per-module directives from the environment.
    /// - Colors are used only when stderr is a terminal.
    ///
    /// The file layer starts out disabled; see [`Self::set_daemon_logger`].
    pub fn new_with_verbosity(verbosity: u8) -> Self {
        let level_override = match verbosity {
            0 => None,
            1 => Some(LevelFilter::INFO),
            2 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        };

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .with_env_var(VERBOSITY_ENV_VAR)
            .from_env_lossy();

        let filter = if let Some(max_level) = level_override {
            filter.add_directive(max_level.into())
        } else {
            filter
        };

        let is_ansi = std::io::stderr().is_terminal();
        let stderr = fmt::layer()
            .event_format(FsmonitorFormatter::new_with_ansi(is_ansi))
            .with_writer(std::io::stderr as fn() -> std::io::Stderr)
            .with_filter(filter);

        // disabled until the daemon asks for its log file
        let (logrotate, update) = reload::Layer::new(Option::<DaemonLog>::None);

        Registry::default().with(stderr).with(logrotate).init();

        Self {
            update,
            guard: Mutex::new(None),
        }
    }

    /// Starts mirroring all events into the daemon log file.
    #[tracing::instrument(skip(self, appender))]
    pub fn set_daemon_logger(&self, appender: RollingFileAppender) -> Result<(), Error> {
        let (file_writer, guard) = tracing_appender::non_blocking(appender);
        trace!("created non-blocking file writer");

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false);

        self.update.reload(Some(layer))?;
        self.guard.lock().expect("mutex poisoned").replace(guard);

        Ok(())
    }
}

/// Human-oriented stderr lines. Warnings and errors carry a colored
/// `warning:`/`error:` tag, info is printed bare, and debug and trace are
/// prefixed with a local timestamp and their target. Fields are rendered
/// by the layer's field formatter.
pub struct FsmonitorFormatter {
    is_ansi: bool,
}

impl FsmonitorFormatter {
    pub fn new_with_ansi(is_ansi: bool) -> Self {
        Self { is_ansi }
    }

    fn write_prefix(
        &self,
        writer: &mut Writer<'_>,
        level: Level,
        target: &str,
    ) -> std::fmt::Result {
        let tag = match level {
            Level::ERROR => "error:",
            Level::WARN => "warning:",
            Level::INFO => return Ok(()),
            _ => {
                let now = Local::now().format("%H:%M:%S%.3f");
                return write!(writer, "{now} {level:>5} {target}: ");
            }
        };
        match (self.is_ansi, level) {
            (true, Level::ERROR) => write!(writer, "{} ", tag.red().bold()),
            (true, _) => write!(writer, "{} ", tag.yellow().bold()),
            (false, _) => write!(writer, "{tag} "),
        }
    }
}

impl<S, N> FormatEvent<S, N> for FsmonitorFormatter
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
        let metadata = event.metadata();
        self.write_prefix(&mut writer, *metadata.level(), metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
