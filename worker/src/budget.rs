use std::{
    pin::pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use common::TaskError;
use tokio::{sync::Notify, time::timeout};
use tracing::debug;

#[derive(Debug)]
struct BudgetInner {
    limit: u64,
    in_use: AtomicU64,
    released: Notify,
}

/// Presupuesto global de memoria en vuelo (bytes estimados).
/// El contador es atómico; nunca se toma un lock para reservar.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                in_use: AtomicU64::new(0),
                released: Notify::new(),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn in_use(&self) -> u64 {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.limit().saturating_sub(self.in_use())
    }

    fn try_add(&self, bytes: u64) -> bool {
        let limit = self.inner.limit;
        self.inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(bytes).filter(|next| *next <= limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.inner.in_use.fetch_sub(bytes, Ordering::AcqRel);
        self.inner.released.notify_waiters();
    }

    /// Reserva sin esperar.
    pub fn try_claim(&self, bytes: u64) -> Option<BudgetClaim> {
        if self.try_add(bytes) {
            Some(BudgetClaim {
                budget: self.clone(),
                bytes,
            })
        } else {
            None
        }
    }

    /// Reserva esperando a que otras tareas liberen memoria.
    /// Si `bytes` supera el límite total, falla enseguida.
    pub async fn reserve(&self, bytes: u64) -> Result<BudgetClaim, TaskError> {
        if bytes > self.limit() {
            return Err(TaskError::Budget {
                needed: bytes,
                limit: self.limit(),
            });
        }

        loop {
            // registrarse antes de intentar, para no perder un aviso
            let mut notified = pin!(self.inner.released.notified());
            notified.as_mut().enable();

            if let Some(claim) = self.try_claim(bytes) {
                return Ok(claim);
            }
            notified.await;
        }
    }
}

/// Porción reservada del presupuesto. Se libera al hacer drop.
#[derive(Debug)]
pub struct BudgetClaim {
    budget: MemoryBudget,
    bytes: u64,
}

impl BudgetClaim {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Ajusta la reserva a `total` bytes sin esperar.
    /// Achicar siempre funciona; agrandar depende del espacio libre.
    pub fn try_resize(&mut self, total: u64) -> bool {
        if total <= self.bytes {
            self.budget.release(self.bytes - total);
            self.bytes = total;
            return true;
        }
        if self.budget.try_add(total - self.bytes) {
            self.bytes = total;
            true
        } else {
            false
        }
    }

    /// Agranda la reserva a `total` bytes, reintentando hasta `retries` veces
    /// tras esperar una liberación o `backoff`, lo que pase primero.
    /// Devuelve la cantidad de intentos usados.
    pub async fn grow_to(
        &mut self,
        total: u64,
        retries: u32,
        backoff: Duration,
    ) -> Result<u32, TaskError> {
        let limit = self.budget.limit();
        if total <= self.bytes {
            self.try_resize(total);
            return Ok(1);
        }
        let exhausted = TaskError::Budget {
            needed: total,
            limit,
        };
        if total > limit {
            return Err(exhausted);
        }

        let budget = self.budget.clone();
        for attempt in 0..=retries {
            let mut notified = pin!(budget.inner.released.notified());
            notified.as_mut().enable();

            if self.try_resize(total) {
                return Ok(attempt + 1);
            }
            if attempt == retries {
                break;
            }

            debug!(
                "sin memoria para {} bytes (en uso {}/{}), reintento {}",
                total,
                budget.in_use(),
                limit,
                attempt + 1
            );
            let _ = timeout(backoff, notified).await;
        }

        Err(exhausted)
    }
}

impl Drop for BudgetClaim {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}
