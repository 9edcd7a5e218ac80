// scheduler/src/state.rs

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Contadores compartidos del pool. Sólo atómicos: ninguna tarea
/// toma un lock mientras espera red.
#[derive(Debug, Clone, Default)]
pub struct PoolState {
    inner: Arc<PoolCounters>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    dispatched: AtomicU64,
    completed: AtomicU64,
}

impl PoolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca una tarea como Running. Devuelve cuántas corren ahora.
    pub fn task_started(&self) -> usize {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        let now = self.inner.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak_running.fetch_max(now, Ordering::AcqRel);
        now
    }

    pub fn task_finished(&self) {
        self.inner.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Una fila más llegó al sink (incluye canceladas sin despachar).
    pub fn record_completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::Acquire)
    }

    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }
}
