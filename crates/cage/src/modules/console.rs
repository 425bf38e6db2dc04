//! Console capability: `console.log` and friends, with a pluggable sink.

use std::sync::{Arc, Mutex};

use rquickjs::function::Rest;
use rquickjs::{Object, Value};

use crate::module::{CageModule, ModuleContext};
use crate::vm::dump;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Receives one formatted line per console call. Sinks are shared across
/// evaluations and may be read from other threads.
pub trait ConsoleSink: Send + Sync + 'static {
    fn write(&self, level: LogLevel, message: &str);
}

/// Default sink: guest output goes to `tracing` under `cage::script`.
pub struct TracingSink;

impl ConsoleSink for TracingSink {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => {
                tracing::trace!(target: "cage::script", "{message}");
            }
            LogLevel::Debug => {
                tracing::debug!(target: "cage::script", "{message}");
            }
            LogLevel::Info => {
                tracing::info!(target: "cage::script", "{message}");
            }
            LogLevel::Warn => {
                tracing::warn!(target: "cage::script", "{message}");
            }
            LogLevel::Error => {
                tracing::error!(target: "cage::script", "{message}");
            }
        }
    }
}

/// Collecting sink for hosts (and tests) that want the output back.
#[derive(Clone, Default)]
pub struct BufferSink {
    entries: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Formatted messages in emission order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl ConsoleSink for BufferSink {
    fn write(&self, level: LogLevel, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

pub struct ConsoleModule {
    sink: Arc<dyn ConsoleSink>,
}

impl ConsoleModule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sink: Arc::new(TracingSink),
        }
    }

    #[must_use]
    pub fn with_sink(sink: Arc<dyn ConsoleSink>) -> Self {
        Self { sink }
    }
}

impl Default for ConsoleModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CageModule for ConsoleModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        let console = Object::new(mcx.ctx().clone())
            .map_err(|err| anyhow::anyhow!("failed to build console: {err}"))?;

        let methods: &[(&str, LogLevel)] = &[
            ("log", LogLevel::Info),
            ("info", LogLevel::Info),
            ("debug", LogLevel::Debug),
            ("trace", LogLevel::Trace),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ];
        for &(name, level) in methods {
            let sink = Arc::clone(&self.sink);
            let function = mcx.fn_raw(name, move |ctx, args: Rest<Value<'_>>| {
                let message = args
                    .iter()
                    .map(|arg| dump(arg).to_display_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                sink.write(level, &message);
                Ok(Value::new_undefined(ctx.clone()))
            })?;
            console
                .set(name, function)
                .map_err(|err| anyhow::anyhow!("failed to install console.{name}: {err}"))?;
        }

        {
            let sink = Arc::clone(&self.sink);
            let function = mcx.fn_raw("assert", move |ctx, args: Rest<Value<'_>>| {
                let passed = args.first().map(truthy).unwrap_or(false);
                if !passed {
                    let detail = args[1..]
                        .iter()
                        .map(|arg| dump(arg).to_display_string())
                        .collect::<Vec<_>>()
                        .join(" ");
                    let message = if detail.is_empty() {
                        "Assertion failed".to_string()
                    } else {
                        format!("Assertion failed: {detail}")
                    };
                    sink.write(LogLevel::Error, &message);
                }
                Ok(Value::new_undefined(ctx.clone()))
            })?;
            console
                .set("assert", function)
                .map_err(|err| anyhow::anyhow!("failed to install console.assert: {err}"))?;
        }

        mcx.set_global("console", console.into_value())
    }
}

fn truthy(value: &Value<'_>) -> bool {
    if value.is_null() || value.is_undefined() {
        return false;
    }
    if let Some(b) = value.as_bool() {
        return b;
    }
    if let Some(n) = value.as_number() {
        return n != 0.0 && !n.is_nan();
    }
    if let Some(s) = value.as_string() {
        return !s.to_string().unwrap_or_default().is_empty();
    }
    true
}
