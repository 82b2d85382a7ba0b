//! Operator-facing logging.
//!
//! The console gets INFO and above as bare messages on stderr. The debug log file
//! gets everything the `PROVISIONER_LOG` filter lets through (DEBUG for this crate
//! by default), one `[timestamp][LEVEL] message` line per event.

use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::Context;
use chrono::Utc;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_FILTER_ENV: &str = "PROVISIONER_LOG";
const DEFAULT_FILE_FILTER: &str = "drive_audit_provisioner=debug";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the console and file layers. Later calls are no-ops.
pub fn init(log_file: &Path) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    if let Some(parent) = log_file.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("open log file {}", log_file.display()))?;

    let file_filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILE_FILTER));
    let console = console_layer::<Registry, _>(io::stderr);
    let debug_file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .event_format(FileLineFormat)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(console)
        .with(debug_file)
        .try_init()
        .context("install tracing subscriber")?;
    let _ = INSTALLED.set(());
    Ok(())
}

/// INFO and above, message and fields only. Command stderr is logged at DEBUG and
/// never reaches this layer.
pub fn console_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(make_writer)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_filter(LevelFilter::INFO)
}

/// `[2026-10-18T09:30:00Z][DEBUG] message key=value`
pub struct FileLineFormat;

impl<S, N> FormatEvent<S, N> for FileLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}][{}] ",
            Utc::now().format(TIMESTAMP_FORMAT),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
