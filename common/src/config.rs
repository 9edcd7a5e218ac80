use std::{env, str::FromStr, time::Duration};

use crate::{color::ScanMode, error::SetupError};

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 15;
/// 512 MB, el techo de memoria pensado para correr dentro de un contenedor.
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_PIXELS: u64 = 50_000_000;
pub const DEFAULT_DISPATCH_RESERVE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_BUDGET_RETRIES: u32 = 3;
pub const DEFAULT_BUDGET_BACKOFF_MS: u64 = 250;

/// Parámetros de una corrida del pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Tamaño del pool de workers (tareas en ejecución simultánea)
    pub workers: usize,
    /// Tiempo máximo por URL (descarga + decodificación + conteo)
    pub task_timeout: Duration,
    /// Techo global de memoria estimada en vuelo
    pub memory_budget_bytes: u64,
    /// Tamaño máximo del cuerpo HTTP
    pub max_image_bytes: u64,
    /// Máximo de pixeles (ancho * alto) antes de decodificar
    pub max_image_pixels: u64,
    /// Reserva inicial de memoria al despachar una tarea
    pub dispatch_reserve_bytes: u64,
    /// Paso de muestreo; `None` = escaneo completo
    pub sample_stride: Option<u32>,
    /// Sólo se muestrean imágenes con al menos esta cantidad de pixeles
    pub sample_min_pixels: u64,
    pub budget_retries: u32,
    pub budget_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_image_pixels: DEFAULT_MAX_IMAGE_PIXELS,
            dispatch_reserve_bytes: DEFAULT_DISPATCH_RESERVE_BYTES,
            sample_stride: None,
            sample_min_pixels: 0,
            budget_retries: DEFAULT_BUDGET_RETRIES,
            budget_backoff: Duration::from_millis(DEFAULT_BUDGET_BACKOFF_MS),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl PipelineConfig {
    /// Valores por defecto, sobreescritos por variables de entorno
    /// (COLOR_WORKERS, COLOR_TASK_TIMEOUT_SECS, ...).
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_parse("COLOR_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse("COLOR_TASK_TIMEOUT_SECS") {
            self.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("COLOR_MEMORY_BUDGET_BYTES") {
            self.memory_budget_bytes = v;
        }
        if let Some(v) = env_parse("COLOR_MAX_IMAGE_BYTES") {
            self.max_image_bytes = v;
        }
        if let Some(v) = env_parse("COLOR_MAX_IMAGE_PIXELS") {
            self.max_image_pixels = v;
        }
        if let Some(v) = env_parse("COLOR_DISPATCH_RESERVE_BYTES") {
            self.dispatch_reserve_bytes = v;
        }
        if let Some(v) = env_parse("COLOR_SAMPLE_STRIDE") {
            self.sample_stride = Some(v);
        }
        if let Some(v) = env_parse("COLOR_SAMPLE_MIN_PIXELS") {
            self.sample_min_pixels = v;
        }
        if let Some(v) = env_parse("COLOR_BUDGET_RETRIES") {
            self.budget_retries = v;
        }
        if let Some(v) = env_parse("COLOR_BUDGET_BACKOFF_MS") {
            self.budget_backoff = Duration::from_millis(v);
        }
        self
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.workers == 0 {
            return Err(SetupError::Config("workers debe ser mayor que 0".into()));
        }
        if self.task_timeout.is_zero() {
            return Err(SetupError::Config("task_timeout debe ser mayor que 0".into()));
        }
        if self.memory_budget_bytes == 0 {
            return Err(SetupError::Config(
                "memory_budget_bytes debe ser mayor que 0".into(),
            ));
        }
        if self.max_image_bytes == 0 || self.max_image_pixels == 0 {
            return Err(SetupError::Config(
                "los límites de tamaño de imagen deben ser mayores que 0".into(),
            ));
        }
        if self.sample_stride == Some(0) {
            return Err(SetupError::Config("sample_stride debe ser al menos 1".into()));
        }
        Ok(())
    }

    /// Modo de escaneo para una imagen de `pixels` pixeles.
    pub fn scan_mode_for(&self, pixels: u64) -> ScanMode {
        match self.sample_stride {
            Some(stride) if stride > 1 && pixels >= self.sample_min_pixels => {
                ScanMode::Sampled { stride }
            }
            _ => ScanMode::Full,
        }
    }

    /// La reserva de despacho nunca supera el presupuesto total.
    pub fn effective_dispatch_reserve(&self) -> u64 {
        self.dispatch_reserve_bytes.min(self.memory_budget_bytes)
    }
}
