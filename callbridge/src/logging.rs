//! Tracing setup shared by the worker and host binaries.
//!
//! Everything goes to stderr: in the worker, stdout belongs to the protocol.
//!
//! - `RUST_LOG` wins when set.
//! - Otherwise `CALLBRIDGE_LOG` picks the level for this crate's targets
//!   (`debug`, `warn`/`warning`, `error`, default `info`).
//! - `LOG_FORMAT=json` switches to JSON lines.

use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directives(
            std::env::var("CALLBRIDGE_LOG").ok().as_deref(),
        )),
    };
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer(format))
        .try_init();
}

fn stderr_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("callbridge={level},callbridge_call={level},callbridge_fixture={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_info() {
        insta::assert_snapshot!(
            default_directives(None),
            @"callbridge=info,callbridge_call=info,callbridge_fixture=info"
        );
    }

    #[test]
    fn level_aliases() {
        assert!(default_directives(Some("warning")).starts_with("callbridge=warn,"));
        assert!(default_directives(Some("debug")).starts_with("callbridge=debug,"));
        assert!(default_directives(Some("bogus")).starts_with("callbridge=info,"));
    }

    #[test]
    fn log_format_from_env_value() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Text);
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
    }

    #[test]
    fn directives_parse() {
        for level in [None, Some("trace"), Some("error")] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
