use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errores de preparación: impiden arrancar el pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no se pudo leer la lista de URLs {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no se pudo preparar el CSV de salida {path}: {reason}")]
    Output { path: PathBuf, reason: String },
    #[error("configuración inválida: {0}")]
    Config(String),
    #[error("no se pudo crear el cliente HTTP: {0}")]
    Http(String),
}

/// Falla de una sola URL. Nunca tumba el pipeline: se convierte en una fila vacía.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("error de red: {0}")]
    Fetch(String),
    #[error("el servidor respondió con status {0}")]
    HttpStatus(u16),
    #[error("no se pudo decodificar la imagen: {0}")]
    Decode(String),
    #[error("la imagen supera el límite de tamaño: {0}")]
    SizeLimit(String),
    #[error("presupuesto de memoria insuficiente: se necesitan {needed} bytes (límite {limit})")]
    Budget { needed: u64, limit: u64 },
    #[error("la tarea superó el tiempo máximo de {0:?}")]
    Timeout(Duration),
    #[error("tarea cancelada por apagado del pipeline")]
    Cancelled,
}

impl TaskError {
    /// Etiqueta estable del motivo, usada en logs y métricas.
    pub fn reason(&self) -> &'static str {
        match self {
            TaskError::Fetch(_) | TaskError::HttpStatus(_) => "fetch",
            TaskError::Decode(_) => "decode",
            TaskError::SizeLimit(_) => "size_limit",
            TaskError::Budget { .. } => "budget",
            TaskError::Timeout(_) => "timeout",
            TaskError::Cancelled => "cancelled",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::Timeout(_))
    }
}

/// Fallo al escribir el CSV a mitad de corrida.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("error escribiendo resultados: {0}")]
    Sink(#[from] SinkError),
    #[error("la tarea de escritura terminó de forma inesperada: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_agrupa_errores_de_red() {
        assert_eq!(TaskError::Fetch("refused".into()).reason(), "fetch");
        assert_eq!(TaskError::HttpStatus(404).reason(), "fetch");
        assert_eq!(
            TaskError::Timeout(Duration::from_secs(1)).reason(),
            "timeout"
        );
        assert_eq!(
            TaskError::Budget { needed: 10, limit: 5 }.reason(),
            "budget"
        );
    }

    #[test]
    fn mensaje_de_status_incluye_codigo() {
        let msg = TaskError::HttpStatus(404).to_string();
        assert!(msg.contains("404"));
    }
}
