use std::{collections::BTreeMap, io::Write, sync::Arc};

use common::{
    CsvSink, EventSink, LogEvent, OutputRecord, PipelineError, RunSummary, TaskIndex, TaskOutcome,
    TaskResult,
};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::state::PoolState;

/// Cada cuántas filas se vacía el buffer del CSV.
const FLUSH_EVERY: u64 = 64;

/// Resultado terminal más el slot del pool que ocupaba la tarea.
/// El slot vuelve al pool recién cuando la fila se escribe, así el buffer
/// de reordenamiento nunca crece más que el tamaño del pool.
#[derive(Debug)]
pub struct Completed {
    pub result: TaskResult,
    pub slot: Option<OwnedSemaphorePermit>,
}

/// Reordena resultados que llegan fuera de orden por índice de entrada.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next: TaskIndex,
    pending: BTreeMap<TaskIndex, Completed>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, done: Completed) {
        self.pending.insert(done.result.index, done);
    }

    /// Devuelve el siguiente resultado en orden, si ya llegó.
    pub fn pop_ready(&mut self) -> Option<Completed> {
        let done = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(done)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Vacía lo que quede, en orden de índice, aunque haya huecos.
    pub fn drain_remaining(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

fn report_result(events: &dyn EventSink, result: &TaskResult) {
    match &result.outcome {
        TaskOutcome::Succeeded(report) => {
            debug!(
                "URL {}: {}\n\tH: {}, W: {} ({} colores, {:?}, {:?})",
                result.index + 1,
                result.url,
                report.height,
                report.width,
                report.distinct_colors,
                report.mode,
                result.elapsed
            );
        }
        TaskOutcome::Failed(err) => {
            events.emit(LogEvent::warn(
                format!("falló la url {} (motivo: {})", result.url, err.reason()),
                err,
            ));
        }
    }
}

/// Consume el stream de resultados y escribe una fila por URL en orden de entrada.
pub async fn drain_results<W: Write>(
    mut rx: mpsc::Receiver<Completed>,
    mut sink: CsvSink<W>,
    events: Arc<dyn EventSink>,
    state: PoolState,
    mut summary: RunSummary,
) -> Result<(CsvSink<W>, RunSummary), PipelineError> {
    let mut buffer = ReorderBuffer::new();

    while let Some(done) = rx.recv().await {
        report_result(events.as_ref(), &done.result);
        buffer.push(done);

        while let Some(ready) = buffer.pop_ready() {
            write_one(&mut sink, &mut summary, &state, ready)?;
        }
    }

    if !buffer.is_empty() {
        warn!(
            "quedaron {} resultados sin predecesor; se escriben igual",
            buffer.len()
        );
        for done in buffer.drain_remaining() {
            write_one(&mut sink, &mut summary, &state, done)?;
        }
    }

    sink.flush()?;
    Ok((sink, summary))
}

fn write_one<W: Write>(
    sink: &mut CsvSink<W>,
    summary: &mut RunSummary,
    state: &PoolState,
    done: Completed,
) -> Result<(), PipelineError> {
    sink.append(&OutputRecord::from(&done.result))?;
    summary.record(&done.result);
    state.record_completed();
    if sink.written() % FLUSH_EVERY == 0 {
        sink.flush()?;
    }
    // libera el slot del pool
    drop(done.slot);
    Ok(())
}
