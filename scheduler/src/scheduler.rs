use std::{
    io::Write,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    input::dedupe_urls, CsvSink, EventSink, ImageTask, LogEvent, PipelineConfig, PipelineError,
    RunSummary, SetupError, TaskError, TaskOutcome, TaskResult, TaskState,
};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use worker::{BudgetClaim, ImageSource, ImageWorker, MemoryBudget};

use crate::{
    monitor::{monitor_progress, PROGRESS_INTERVAL},
    sink::{drain_results, Completed},
    state::PoolState,
};

/// Reparte las URLs entre un pool fijo de workers.
///
/// - A lo sumo `workers` tareas vivas a la vez (semáforo).
/// - Despacho FIFO; una tarea espera en cola si no hay slot o memoria.
/// - Timeout por tarea y apagado global vía `CancellationToken`.
/// - Resultados por un canal acotado hacia el sink, que restaura el orden.
pub struct Scheduler<S: ImageSource> {
    worker: Arc<ImageWorker<S>>,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    state: PoolState,
    progress_interval: Duration,
}

impl<S: ImageSource> Scheduler<S> {
    pub fn new(
        source: Arc<S>,
        config: PipelineConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let budget = MemoryBudget::new(config.memory_budget_bytes);
        let worker = Arc::new(ImageWorker::new(source, budget, config.clone()));

        Ok(Self {
            worker,
            config,
            events,
            shutdown: CancellationToken::new(),
            state: PoolState::new(),
            progress_interval: PROGRESS_INTERVAL,
        })
    }

    /// Usa un token externo de apagado (p. ej. Ctrl-C).
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &PoolState {
        &self.state
    }

    pub fn budget(&self) -> &MemoryBudget {
        self.worker.budget()
    }

    /// Procesa todas las URLs y escribe una fila por cada una en `sink`.
    /// Sólo falla si no se puede escribir el CSV.
    pub async fn run<W>(
        &self,
        urls: Vec<String>,
        sink: CsvSink<W>,
    ) -> Result<(CsvSink<W>, RunSummary), PipelineError>
    where
        W: Write + Send + 'static,
    {
        let urls = dedupe_urls(urls);
        let total = urls.len() as u64;
        let summary = RunSummary::start(self.config.workers, total);

        self.events.emit(LogEvent::info(format!(
            "iniciando pipeline {}: {} urls, {} workers, presupuesto {} bytes",
            summary.run_id, total, self.config.workers, self.config.memory_budget_bytes
        )));

        let run_token = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel::<Completed>(self.config.workers);

        let drain = tokio::spawn(drain_results(
            rx,
            sink,
            self.events.clone(),
            self.state.clone(),
            summary,
        ));

        let monitor_done = CancellationToken::new();
        let monitor = tokio::spawn(monitor_progress(
            self.state.clone(),
            self.budget().clone(),
            total,
            self.progress_interval,
            monitor_done.clone(),
        ));

        let slots = Arc::new(Semaphore::new(self.config.workers));
        let reserve = self.config.effective_dispatch_reserve();

        for (index, url) in urls.into_iter().enumerate() {
            if tx.is_closed() {
                // el sink falló; no vale la pena seguir despachando
                run_token.cancel();
                break;
            }
            let mut task = ImageTask::new(index, url);

            let Some((slot, claim)) = self.acquire(&slots, reserve, &run_token).await else {
                // apagado: la tarea no llega a despacharse, pero igual tiene su fila
                task.advance(TaskState::Cancelled);
                let result = TaskResult {
                    index,
                    url: task.url,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    outcome: TaskOutcome::Failed(TaskError::Cancelled),
                };
                if tx.send(Completed { result, slot: None }).await.is_err() {
                    break;
                }
                continue;
            };

            task.advance(TaskState::Dispatched);
            let worker = self.worker.clone();
            let tx = tx.clone();
            let token = run_token.clone();
            let state = self.state.clone();
            let timeout = self.config.task_timeout;

            tokio::spawn(async move {
                let result = run_task(worker, task, claim, timeout, token, state).await;
                // si el sink ya murió no hay a quién avisar; el slot se libera igual
                let _ = tx
                    .send(Completed {
                        result,
                        slot: Some(slot),
                    })
                    .await;
            });
        }
        drop(tx);

        let drained = drain
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))
            .and_then(|r| r);

        monitor_done.cancel();
        let _ = monitor.await;

        let (sink, mut summary) = match drained {
            Ok(v) => v,
            Err(e) => {
                // sin CSV no tiene sentido seguir: se abortan las tareas en vuelo
                run_token.cancel();
                return Err(e);
            }
        };

        summary.finish(self.state.peak_running());
        self.events.emit(LogEvent::info(format!(
            "pipeline {} terminado: {} ok, {} fallidas, {} canceladas",
            summary.run_id, summary.succeeded, summary.failed, summary.cancelled
        )));

        Ok((sink, summary))
    }

    /// Espera un slot del pool y la reserva inicial de memoria, en ese orden.
    /// Devuelve `None` si se pidió apagar.
    async fn acquire(
        &self,
        slots: &Arc<Semaphore>,
        reserve: u64,
        token: &CancellationToken,
    ) -> Option<(OwnedSemaphorePermit, BudgetClaim)> {
        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            permit = slots.clone().acquire_owned() => permit.ok()?,
        };

        let claim = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            claim = self.budget().reserve(reserve) => claim.ok()?,
        };

        Some((slot, claim))
    }
}

/// Corre una tarea ya despachada. Al vencer el timeout o apagarse, el
/// future de `process` se suelta: el conteo corta en la próxima fila, pero
/// un decode ya empezado sigue en el pool de bloqueo con su reserva de
/// memoria hasta terminar. El slot, en cambio, vuelve al pool enseguida.
async fn run_task<S: ImageSource>(
    worker: Arc<ImageWorker<S>>,
    mut task: ImageTask,
    claim: BudgetClaim,
    task_timeout: Duration,
    token: CancellationToken,
    state: PoolState,
) -> TaskResult {
    let started = Instant::now();
    let running = state.task_started();
    debug!("despachada tarea {} ({}), {} corriendo", task.index, task.url, running);

    let res = tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Cancelled),
        res = tokio::time::timeout(task_timeout, worker.process(&mut task, claim)) => {
            res.unwrap_or(Err(TaskError::Timeout(task_timeout)))
        }
    };

    state.task_finished();

    let outcome = match res {
        Ok(report) => {
            task.advance(TaskState::Succeeded);
            TaskOutcome::Succeeded(report)
        }
        Err(err) => {
            let next = if err.is_cancellation() {
                TaskState::Cancelled
            } else {
                TaskState::Failed
            };
            task.advance(next);
            TaskOutcome::Failed(err)
        }
    };

    TaskResult {
        index: task.index,
        url: task.url,
        attempts: task.attempt,
        elapsed: started.elapsed(),
        outcome,
    }
}
