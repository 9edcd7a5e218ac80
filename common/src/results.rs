use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    color::CountMode,
    error::{SetupError, SinkError, TaskError},
    task::TaskIndex,
    topk::TopColors,
};

pub const CSV_HEADER: [&str; 4] = ["URL", "top_color1", "top_color2", "top_color3"];

/// Resultado de procesar una imagen con éxito.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub width: u32,
    pub height: u32,
    pub colors: TopColors,
    pub mode: CountMode,
    pub distinct_colors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(ImageReport),
    Failed(TaskError),
}

/// Resultado terminal de una tarea, tal como llega al sink.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub index: TaskIndex,
    pub url: String,
    pub attempts: u32,
    pub elapsed: Duration,
    pub outcome: TaskOutcome,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded(_))
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.outcome {
            TaskOutcome::Failed(e) => Some(e),
            TaskOutcome::Succeeded(_) => None,
        }
    }
}

/// Fila del CSV de salida.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(rename = "URL")]
    pub url: String,
    pub top_color1: String,
    pub top_color2: String,
    pub top_color3: String,
}

impl From<&TaskResult> for OutputRecord {
    fn from(result: &TaskResult) -> Self {
        let [top_color1, top_color2, top_color3] = match &result.outcome {
            TaskOutcome::Succeeded(report) => report.colors.columns(),
            // las fallas sólo dejan la URL; el motivo va al log
            TaskOutcome::Failed(_) => Default::default(),
        };

        OutputRecord {
            url: result.url.clone(),
            top_color1,
            top_color2,
            top_color3,
        }
    }
}

/// Escritor de filas CSV. Recibe el handle de escritura desde afuera.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    written: u64,
}

impl CsvSink<BufWriter<File>> {
    /// Crea (o trunca) el archivo de salida y escribe el encabezado.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let path = path.as_ref();
        let output_err = |reason: String| SetupError::Output {
            path: path.to_path_buf(),
            reason,
        };

        // Crear carpeta de salida si hace falta
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| output_err(e.to_string()))?;
            }
        }

        let file = File::create(path).map_err(|e| output_err(e.to_string()))?;
        CsvSink::new(BufWriter::new(file)).map_err(|e| output_err(e.to_string()))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Result<Self, SinkError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        writer.write_record(CSV_HEADER)?;
        Ok(Self { writer, written: 0 })
    }

    pub fn append(&mut self, record: &OutputRecord) -> Result<(), SinkError> {
        self.writer.serialize(record)?;
        self.written += 1;
        Ok(())
    }

    /// Filas de datos escritas (sin contar el encabezado).
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Vacía el buffer y devuelve el writer interno.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(std::io::Error::new(e.error().kind(), e.error().to_string())))
    }
}

/// Resumen de una corrida del pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workers: usize,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub peak_running: usize,
}

impl RunSummary {
    pub fn start(workers: usize, total: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            workers,
            total,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            peak_running: 0,
        }
    }

    pub fn record(&mut self, result: &TaskResult) {
        match result.error() {
            None => self.succeeded += 1,
            Some(e) if e.is_cancellation() => self.cancelled += 1,
            Some(_) => self.failed += 1,
        }
    }

    pub fn finish(&mut self, peak_running: usize) {
        self.peak_running = peak_running;
        self.finished_at = Some(Utc::now());
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }
}
