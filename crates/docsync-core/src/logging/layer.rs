//! Tracing layer that forwards events to a [`LogSink`].

use std::fmt::Write as FmtWrite;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::{InstanceLogWriter, LogSink};

/// A tracing Layer that writes events as [`JsonLogEntry`] records.
pub struct JsonlLayer<W: LogSink = InstanceLogWriter> {
    sink: Arc<W>,
}

impl JsonlLayer<InstanceLogWriter> {
    /// Create a layer writing to `logs_dir/<date>_<instance>.jsonl`.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> io::Result<Self> {
        Ok(Self::with_sink(Arc::new(InstanceLogWriter::new(
            logs_dir, instance,
        )?)))
    }

    /// Get the path to the log file.
    pub fn log_path(&self) -> &Path {
        self.sink.path()
    }
}

impl<W: LogSink> JsonlLayer<W> {
    /// Create a layer over an existing sink
    pub fn with_sink(sink: Arc<W>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<W> {
        &self.sink
    }

    /// Get the instance name.
    pub fn instance(&self) -> &str {
        self.sink.instance()
    }
}

impl<S, W> Layer<S> for JsonlLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: LogSink,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level().as_str().to_lowercase();

        let mut visitor = JsonVisitor::new();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            level,
            self.sink.instance(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );

        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }

        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // A failing sink must not take the application down
        let _ = self.sink.write(&entry);
    }
}

/// Visitor that extracts fields from tracing events.
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
        }
    }

    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);

        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, serde_json::Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

/// Builder for the global tracing subscriber: console output plus optional
/// JSONL files.
pub struct LoggingBuilder {
    instance: String,
    logs_dir: Option<PathBuf>,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            logs_dir: None,
            console_output: true,
            env_filter: None,
        }
    }

    /// Also write JSONL entries under `logs_dir`.
    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(logs_dir.into());
        self
    }

    /// Disable console output.
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Set the filter directive (e.g., "docsync=info,docsync_core=debug").
    ///
    /// Without one, `RUST_LOG` is used, falling back to `warn`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build the JSONL layer, `None` if no logs directory was set.
    pub fn build_layer(&self) -> io::Result<Option<JsonlLayer>> {
        self.logs_dir
            .as_ref()
            .map(|dir| JsonlLayer::new(dir, &self.instance))
            .transpose()
    }

    fn filter(&self) -> io::Result<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)),
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))),
        }
    }

    /// Install the subscriber as the global default.
    ///
    /// Returns the JSONL file path when file output is enabled.
    ///
    /// # Errors
    ///
    /// Fails if the filter does not parse, the log file cannot be opened or a
    /// global subscriber is already installed.
    pub fn init(self) -> io::Result<Option<PathBuf>> {
        let filter = self.filter()?;
        let jsonl = self.build_layer()?;
        let log_path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());
        let console = self
            .console_output
            .then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
            });

        tracing_subscriber::registry()
            .with(filter)
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(io::Error::other)?;

        Ok(log_path)
    }
}
