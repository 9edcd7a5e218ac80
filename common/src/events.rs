use std::sync::Mutex;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Fatal,
}

/// Evento estructurado que emite el núcleo. El formato y destino
/// los decide quien implemente [`EventSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub error: Option<String>,
}

impl LogEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
            error: None,
        }
    }

    pub fn warn(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            level: LogLevel::Warn,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }

    pub fn fatal(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            level: LogLevel::Fatal,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Reenvía los eventos a `tracing`. Fatal se registra como `error!`;
/// terminar el proceso es responsabilidad del binario.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LogEvent) {
        match (event.level, event.error.as_deref()) {
            (LogLevel::Info, None) => info!("{}", event.message),
            (LogLevel::Info, Some(err)) => info!(error = %err, "{}", event.message),
            (LogLevel::Warn, None) => warn!("{}", event.message),
            (LogLevel::Warn, Some(err)) => warn!(error = %err, "{}", event.message),
            (LogLevel::Fatal, None) => error!("{}", event.message),
            (LogLevel::Fatal, Some(err)) => error!(error = %err, "{}", event.message),
        }
    }
}

/// Guarda los eventos en memoria (útil para tests).
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
