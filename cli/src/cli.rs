use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use common::{
    input::read_urls, CsvSink, EventSink, ImageTask, LogEvent, PipelineConfig, RunSummary,
    TracingSink,
};
use scheduler::Scheduler;
use sysinfo::{System, SystemExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::{HttpSource, ImageSource, ImageWorker, MemoryBudget};

#[derive(Parser)]
#[command(name = "colorchallenge")]
#[command(about = "Extrae los 3 colores más frecuentes de una lista de imágenes")]
pub struct Cli {
    /// Archivo de log (por defecto, stderr)
    #[arg(long, global = true, value_name = "RUTA")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Procesa la lista de URLs y escribe el CSV
    Run {
        /// Lista de URLs, una por línea
        #[arg(long, short, default_value = "input.txt")]
        input: PathBuf,

        /// CSV de salida
        #[arg(long, short, default_value = "ColorChallengeOutput.csv")]
        output: PathBuf,

        /// Imprime el resumen final como JSON
        #[arg(long)]
        summary_json: bool,

        #[command(flatten)]
        tuning: Tuning,
    },
    /// Descarga una sola imagen y muestra sus dimensiones y colores
    Inspect {
        #[arg(value_name = "URL")]
        url: String,

        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Sobreescrituras de configuración. Lo que no se pase sale de las
/// variables de entorno COLOR_* o de los valores por defecto.
#[derive(Args, Debug, Default)]
pub struct Tuning {
    /// Tamaño del pool de workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Timeout por URL, en segundos
    #[arg(long, value_name = "SEGUNDOS")]
    pub timeout_secs: Option<u64>,

    /// Presupuesto global de memoria, en MB
    #[arg(long, value_name = "MB")]
    pub memory_budget_mb: Option<u64>,

    /// Tamaño máximo de cada imagen descargada, en MB
    #[arg(long, value_name = "MB")]
    pub max_image_mb: Option<u64>,

    /// Activa el muestreo aproximado con este paso (conteos estimados)
    #[arg(long, value_name = "N")]
    pub sample_stride: Option<u32>,

    /// Sólo muestrear imágenes con al menos esta cantidad de pixeles
    #[arg(long, value_name = "PIXELES")]
    pub sample_min_pixels: Option<u64>,
}

const MB: u64 = 1024 * 1024;

impl Tuning {
    pub fn apply(&self, mut cfg: PipelineConfig) -> PipelineConfig {
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.timeout_secs {
            cfg.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.memory_budget_mb {
            cfg.memory_budget_bytes = v.saturating_mul(MB);
        }
        if let Some(v) = self.max_image_mb {
            cfg.max_image_bytes = v.saturating_mul(MB);
        }
        if let Some(v) = self.sample_stride {
            cfg.sample_stride = Some(v);
        }
        if let Some(v) = self.sample_min_pixels {
            cfg.sample_min_pixels = v;
        }
        cfg
    }
}

/// Aborta el proceso registrando el evento Fatal.
fn fatal(events: &dyn EventSink, message: &str, err: impl std::fmt::Display) -> anyhow::Error {
    events.emit(LogEvent::fatal(message, &err));
    anyhow::anyhow!("{message}: {err}")
}

fn load_config(tuning: &Tuning, events: &dyn EventSink) -> Result<PipelineConfig> {
    let cfg = tuning.apply(PipelineConfig::from_env());
    cfg.validate()
        .map_err(|e| fatal(events, "configuración inválida", e))?;
    warn_if_budget_exceeds_memory(&cfg);
    Ok(cfg)
}

fn warn_if_budget_exceeds_memory(cfg: &PipelineConfig) {
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory();

    if available > 0 && cfg.memory_budget_bytes > available {
        warn!(
            "el presupuesto de memoria ({} bytes) supera la memoria disponible ({} bytes)",
            cfg.memory_budget_bytes, available
        );
    }
}

pub async fn run(
    input: PathBuf,
    output: PathBuf,
    summary_json: bool,
    tuning: Tuning,
) -> Result<RunSummary> {
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    events.emit(LogEvent::info("Comenzando setup."));

    let cfg = load_config(&tuning, events.as_ref())?;

    let sink = CsvSink::create(&output)
        .map_err(|e| fatal(events.as_ref(), "no se pudo preparar el CSV", e))?;
    events.emit(LogEvent::info("Setup del CSV completo."));

    let urls = read_urls(&input)
        .map_err(|e| fatal(events.as_ref(), "falló la extracción de URLs durante el setup", e))?;
    events.emit(LogEvent::info(format!("URLs extraídas: {}", urls.len())));

    let source = HttpSource::new(cfg.task_timeout)
        .map_err(|e| fatal(events.as_ref(), "no se pudo crear el cliente HTTP", e))?;

    // Ctrl-C cancela todo lo que esté en cola o en vuelo
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C recibido, cancelando tareas...");
                shutdown.cancel();
            }
        });
    }

    let scheduler = Scheduler::new(Arc::new(source), cfg, events.clone())
        .map_err(|e| fatal(events.as_ref(), "no se pudo crear el scheduler", e))?
        .with_shutdown(shutdown);
    let summary = run_pipeline(&scheduler, urls, sink, events.as_ref(), &output).await?;

    if summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Corrida {}:", summary.run_id);
        println!("  urls: {}", summary.total);
        println!("  ok: {}", summary.succeeded);
        println!("  fallidas: {}", summary.failed);
        println!("  canceladas: {}", summary.cancelled);
        println!("  máximo en paralelo: {}", summary.peak_running);
        println!("  salida: {}", output.display());
    }

    Ok(summary)
}

/// Corre el scheduler completo. Un error acá (el CSV dejó de aceptar
/// escrituras) termina el proceso, así que también se registra como Fatal.
async fn run_pipeline<S, W>(
    scheduler: &Scheduler<S>,
    urls: Vec<String>,
    sink: CsvSink<W>,
    events: &dyn EventSink,
    output: &Path,
) -> Result<RunSummary>
where
    S: ImageSource,
    W: Write + Send + 'static,
{
    let (_sink, summary) = scheduler.run(urls, sink).await.map_err(|e| {
        fatal(
            events,
            &format!("falló la escritura de {}", output.display()),
            e,
        )
    })?;
    Ok(summary)
}

pub async fn inspect(url: String, tuning: Tuning) -> Result<()> {
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let cfg = load_config(&tuning, events.as_ref())?;

    let source = HttpSource::new(cfg.task_timeout)?;
    let budget = MemoryBudget::new(cfg.memory_budget_bytes);
    let worker = ImageWorker::new(Arc::new(source), budget.clone(), cfg.clone());

    let claim = budget.reserve(cfg.effective_dispatch_reserve()).await?;
    let mut task = ImageTask::new(0, url.clone());
    let report = tokio::time::timeout(cfg.task_timeout, worker.process(&mut task, claim))
        .await
        .map_err(|_| anyhow::anyhow!("timeout tras {:?}", cfg.task_timeout))??;

    info!("inspección de {} terminada", url);
    println!("URL: {}", url);
    println!("\tH: {}, W: {}", report.height, report.width);
    println!("\tcolores distintos: {}", report.distinct_colors);
    if !report.mode.is_exact() {
        println!("\tconteo estimado ({:?})", report.mode);
    }
    for (i, hex) in report.colors.hex_codes().iter().enumerate() {
        println!("\ttop_color{}: {}", i + 1, hex);
    }

    Ok(())
}
