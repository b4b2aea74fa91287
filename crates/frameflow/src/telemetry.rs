//! Tracing setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the embedding process, which may call [`init_tracing`] for a stderr logger
//! driven by the environment:
//! - `RUST_LOG`: full `EnvFilter` directive, takes precedence
//! - `FRAMEFLOW_LOG`: level for the `frameflow` target (`trace` .. `error`)
//! - `LOG_FORMAT=json`: one JSON object per event

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const FALLBACK_DIRECTIVE: &str = "frameflow=info";

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub directive: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            directive: FALLBACK_DIRECTIVE.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RUST_LOG").ok().as_deref(),
            std::env::var("FRAMEFLOW_LOG").ok().as_deref(),
            std::env::var("LOG_FORMAT").ok().as_deref(),
        )
    }

    fn from_vars(rust_log: Option<&str>, level: Option<&str>, format: Option<&str>) -> Self {
        let directive = match rust_log.map(str::trim).filter(|d| !d.is_empty()) {
            Some(directive) => directive.to_string(),
            None => format!("frameflow={}", crate_level(level)),
        };
        let json = format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"));
        Self { directive, json }
    }
}

fn crate_level(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Install the stderr subscriber described by the environment.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing() -> bool {
    init_with(&TelemetryConfig::from_env())
}

pub fn init_with(config: &TelemetryConfig) -> bool {
    let (filter, rejected) = match EnvFilter::try_new(&config.directive) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(FALLBACK_DIRECTIVE), Some(e)),
    };

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    };

    if let Some(error) = rejected {
        tracing::warn!(
            directive = %config.directive,
            %error,
            "Invalid log filter, using {FALLBACK_DIRECTIVE}"
        );
    }
    installed
}

/// Event recording for tests that assert on what the queue and cache log.
#[cfg(test)]
pub(crate) mod capture {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Debug, Clone)]
    pub struct CapturedEvent {
        pub level: Level,
        pub message: String,
        /// Structured fields (`queue`, `task`, `signature`, ...) rendered as text.
        pub fields: BTreeMap<&'static str, String>,
    }

    impl CapturedEvent {
        pub fn field(&self, name: &str) -> Option<&str> {
            self.fields.get(name).map(String::as_str)
        }
    }

    #[derive(Clone, Default)]
    pub struct EventCapture {
        events: Arc<Mutex<Vec<CapturedEvent>>>,
    }

    impl EventCapture {
        /// Run `f` with this capture as the thread's subscriber.
        pub fn record<R>(&self, f: impl FnOnce() -> R) -> R {
            let subscriber = tracing_subscriber::registry().with(self.clone());
            tracing::subscriber::with_default(subscriber, f)
        }

        pub fn events(&self) -> Vec<CapturedEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn find(&self, message: &str) -> Option<CapturedEvent> {
            self.events().into_iter().find(|e| e.message == message)
        }
    }

    impl<S: Subscriber> Layer<S> for EventCapture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut recorder = FieldRecorder::default();
            event.record(&mut recorder);
            self.events.lock().unwrap().push(CapturedEvent {
                level: *event.metadata().level(),
                message: recorder.message,
                fields: recorder.fields,
            });
        }
    }

    #[derive(Default)]
    struct FieldRecorder {
        message: String,
        fields: BTreeMap<&'static str, String>,
    }

    impl Visit for FieldRecorder {
        // `%value` fields and the formatted message both arrive here already
        // rendered through Display.
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.record_text(field, format!("{value:?}"));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.record_text(field, value.to_string());
        }
    }

    impl FieldRecorder {
        fn record_text(&mut self, field: &Field, text: String) {
            if field.name() == "message" {
                self.message = text;
            } else {
                self.fields.insert(field.name(), text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::capture::EventCapture;
    use super::*;

    #[test]
    fn rust_log_takes_precedence() {
        let config =
            TelemetryConfig::from_vars(Some("frameflow::queue=trace"), Some("error"), None);
        assert_eq!(config.directive, "frameflow::queue=trace");
        assert!(!config.json);
    }

    #[test]
    fn crate_level_maps_aliases() {
        let cases = [
            (None, "frameflow=info"),
            (Some("DEBUG"), "frameflow=debug"),
            (Some("warning"), "frameflow=warn"),
            (Some("bogus"), "frameflow=info"),
        ];
        for (level, expected) in cases {
            assert_eq!(TelemetryConfig::from_vars(None, level, None).directive, expected);
        }
    }

    #[test]
    fn blank_rust_log_falls_back_to_crate_level() {
        let config = TelemetryConfig::from_vars(Some("  "), Some("trace"), Some("JSON"));
        assert_eq!(config.directive, "frameflow=trace");
        assert!(config.json);
    }

    #[test]
    fn init_reports_existing_subscriber() {
        let config = TelemetryConfig::default();
        init_with(&config);
        assert!(!init_with(&config));
    }

    #[test]
    fn capture_keeps_structured_fields() {
        let capture = EventCapture::default();
        capture.record(|| {
            tracing::info!(signature = %"640x480 BGRA", released = 3u64, "Evicting idle pool");
        });

        let event = capture.find("Evicting idle pool").unwrap();
        assert_eq!(event.level, tracing::Level::INFO);
        assert_eq!(event.field("signature"), Some("640x480 BGRA"));
        assert_eq!(event.field("released"), Some("3"));
    }
}
