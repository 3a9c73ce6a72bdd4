use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

/// Panic hook to send panic info to `tracing` instead of stderr, so that the panic ends up on a
/// single (JSON) log line next to everything else.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop if the RUST_BACKTRACE or RUST_LIB_BACKTRACE backtrace variables are both not set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        panic_info
            .payload()
            .downcast_ref::<String>()
            .map(|s| s.as_str())
    };

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// Installs the subscriber. Logs go to stderr, stdout carries the window output.
pub fn register() {
    // RUST_LOG can be used to set the log level, the default is `info`.
    let debug_mode =
        std::env::var("TUMBLING_DEBUG").is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_log_level = if debug_mode { "debug" } else { "info" };

    let filter = EnvFilter::builder()
        .with_default_directive(default_log_level.parse().unwrap_or(Level::INFO.into()))
        .from_env_lossy();

    let layer = if debug_mode {
        // Text format
        fmt::layer().with_writer(std::io::stderr).boxed()
    } else {
        // JSON format, flattened
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
