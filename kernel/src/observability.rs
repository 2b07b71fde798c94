// Logging Setup
//
// Structured logging for the sync pipeline, with spans carrying the
// notification being processed.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::event::RawEvent;

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines, for production.
    Json,
    #[default]
    Pretty,
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Levels come from `RUST_LOG` and default to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Span wrapping the processing of one notification.
pub fn event_span(event: &RawEvent) -> Span {
    tracing::info_span!(
        "metastore_event",
        event_id = event.id,
        event_type = %event.type_tag,
        db = %event.db_name,
        table = %event.tbl_name,
    )
}
