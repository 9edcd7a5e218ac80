use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use worker::MemoryBudget;

use crate::state::PoolState;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Loguea el avance de la corrida cada `interval` hasta que se cancele `done`.
pub async fn monitor_progress(
    state: PoolState,
    budget: MemoryBudget,
    total: u64,
    interval: Duration,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        info!(
            "progreso: {}/{} urls, {} corriendo, memoria {}/{} bytes",
            state.completed(),
            total,
            state.running(),
            budget.in_use(),
            budget.limit()
        );
    }
}
