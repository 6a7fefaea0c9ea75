use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const DEBUG_ENV: &str = "TRANSFORM_DEBUG";
const DEFAULT_DIRECTIVES: &str = "info";
// the HTTP client stack is too chatty at debug
const DEBUG_DIRECTIVES: &str = "debug,h2=info,hyper=info,hyper_util=info,reqwest=info";

/// Routes panics into the log stream instead of stderr.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            tracing::error!(
                file = location.file(),
                line = location.line(),
                column = location.column(),
                "panicked: {payload}"
            );
        }
        _ => tracing::error!("{panic_info}\n{backtrace}"),
    }
}

fn is_debug_mode(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with the HTTP stack kept at `info`.
fn env_filter(debug_mode: bool, rust_log: Option<&str>) -> EnvFilter {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => EnvFilter::builder().parse_lossy(directives),
        None if debug_mode => EnvFilter::new(DEBUG_DIRECTIVES),
        None => EnvFilter::new(DEFAULT_DIRECTIVES),
    }
}

/// Installs the global subscriber. Events are JSON, one flattened object per line, unless
/// `TRANSFORM_DEBUG=true` asks for human readable text.
pub fn register() {
    let debug_mode = is_debug_mode(std::env::var(DEBUG_ENV).ok().as_deref());
    let filter = env_filter(
        debug_mode,
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
    );

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
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

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn test_debug_mode_flag() {
        assert!(is_debug_mode(Some("true")));
        assert!(is_debug_mode(Some(" TRUE ")));
        assert!(!is_debug_mode(Some("1")));
        assert!(!is_debug_mode(None));
    }

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(
            env_filter(false, None).max_level_hint(),
            Some(LevelFilter::INFO)
        );

        let debug = env_filter(true, None);
        assert_eq!(debug.max_level_hint(), Some(LevelFilter::DEBUG));
        let directives = debug.to_string();
        assert!(directives.contains("h2=info"), "{directives}");
        assert!(directives.contains("hyper_util=info"), "{directives}");
    }

    #[test]
    fn test_rust_log_overrides_defaults() {
        assert_eq!(
            env_filter(true, Some("warn")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
        // blank counts as unset
        assert_eq!(
            env_filter(true, Some("  ")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }
}
