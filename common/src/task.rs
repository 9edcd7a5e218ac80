use serde::{Deserialize, Serialize};
use tracing::trace;

/// Posición de la URL en la lista de entrada; define el orden del CSV.
pub type TaskIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Dispatched,
    Fetching,
    Decoding,
    Counting,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Fetching, Decoding y Counting son los sub-estados de "Running".
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            TaskState::Fetching | TaskState::Decoding | TaskState::Counting
        )
    }
}

/// Unidad de trabajo: una URL, desde que sale de la cola hasta su resultado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTask {
    pub index: TaskIndex,
    pub url: String,
    /// Intentos usados al ampliar la reserva para decodificar
    /// (1 = entró al primer intento, 0 = todavía no llegó a reservar)
    pub attempt: u32,
    pub state: TaskState,
}

impl ImageTask {
    pub fn new(index: TaskIndex, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            attempt: 0,
            state: TaskState::Queued,
        }
    }

    /// Avanza el estado. Un estado terminal no se vuelve a tocar.
    pub fn advance(&mut self, next: TaskState) {
        if self.state.is_terminal() {
            return;
        }
        trace!("tarea {} ({}): {:?} -> {:?}", self.index, self.url, self.state, next);
        self.state = next;
    }
}
