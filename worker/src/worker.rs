use std::sync::Arc;

use common::{
    count_colors_until, top_colors, ImageReport, ImageTask, PipelineConfig, TaskError, TaskState,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    budget::{BudgetClaim, MemoryBudget},
    decode,
    source::{ImageBody, ImageSource},
};

/// Procesa una URL: descarga, decodifica, cuenta colores y extrae el top 3.
pub struct ImageWorker<S: ImageSource> {
    source: Arc<S>,
    budget: MemoryBudget,
    config: PipelineConfig,
}

impl<S: ImageSource> ImageWorker<S> {
    pub fn new(source: Arc<S>, budget: MemoryBudget, config: PipelineConfig) -> Self {
        Self {
            source,
            budget,
            config,
        }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ejecuta la tarea con la reserva de memoria que le dio el scheduler.
    /// La reserva se agranda antes de cada alocación grande (cuerpo, decode)
    /// y se libera al terminar o al abortarse el future, porque viaja dentro de él.
    pub async fn process(
        &self,
        task: &mut ImageTask,
        mut claim: BudgetClaim,
    ) -> Result<ImageReport, TaskError> {
        // si el future se suelta (timeout, apagado) el trabajo en el pool
        // de bloqueo se entera por acá
        let abort = CancellationToken::new();
        let _abort_on_drop = abort.clone().drop_guard();

        task.advance(TaskState::Fetching);
        let body = self.download(&task.url, &mut claim).await?;

        task.advance(TaskState::Decoding);
        let (width, height) = decode::probe_dimensions(&body)?;
        let pixels = decode::check_limits(width, height, self.config.max_image_pixels)?;

        let body_bytes = body.capacity() as u64;
        let needed = body_bytes + decode::estimate_decoded_bytes(&body, width, height);
        match claim
            .grow_to(needed, self.config.budget_retries, self.config.budget_backoff)
            .await
        {
            Ok(attempts) => task.attempt = attempts,
            Err(e) => {
                task.attempt = self.config.budget_retries + 1;
                return Err(e);
            }
        }

        debug!(
            "url {}: {}x{} ({} bytes, reserva {} bytes)",
            task.url,
            width,
            height,
            body.len(),
            claim.bytes()
        );

        // decodificar y contar es CPU puro: va al pool de bloqueo
        let decode_abort = abort.clone();
        let (img, claim) = run_blocking(move || {
            if decode_abort.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let img = decode::decode_rgb(&body);
            drop(body);
            // del decode sólo queda la copia RGB8
            let mut claim = claim;
            claim.try_resize(pixels * decode::RGB8_BYTES_PER_PIXEL);
            img.map(|img| (img, claim))
        })
        .await??;

        task.advance(TaskState::Counting);
        let scan = self.config.scan_mode_for(pixels);
        let report = run_blocking(move || -> Result<ImageReport, TaskError> {
            let _claim = claim;
            let hist = count_colors_until(&img, scan, || abort.is_cancelled())
                .ok_or(TaskError::Cancelled)?;
            Ok(ImageReport {
                width,
                height,
                colors: top_colors(&hist),
                mode: hist.mode(),
                distinct_colors: hist.len(),
            })
        })
        .await??;

        Ok(report)
    }

    /// Lee el cuerpo entero sin pasarse de `max_image_bytes`. Cada alocación
    /// del buffer se cubre antes con la reserva, así la memoria del cuerpo
    /// siempre cuenta contra el presupuesto global.
    async fn download(&self, url: &str, claim: &mut BudgetClaim) -> Result<Vec<u8>, TaskError> {
        let max_bytes = self.config.max_image_bytes;
        let mut body = self.source.open(url).await?;

        let mut buf = Vec::new();
        if let Some(len) = body.content_length() {
            if len > max_bytes {
                return Err(size_limit(len, max_bytes));
            }
            self.cover(claim, len).await?;
            buf.reserve_exact(len as usize);
        }

        while let Some(chunk) = body.next_chunk().await? {
            let got = (buf.len() + chunk.len()) as u64;
            if got > max_bytes {
                return Err(size_limit(got, max_bytes));
            }
            if buf.len() + chunk.len() > buf.capacity() {
                // crece al doble, pero reservando antes de alocar
                let target = got.max(buf.capacity() as u64 * 2).min(max_bytes);
                self.cover(claim, target).await?;
                buf.reserve_exact(target as usize - buf.len());
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(buf)
    }

    /// Asegura que la reserva cubra al menos `total` bytes (nunca la achica).
    async fn cover(&self, claim: &mut BudgetClaim, total: u64) -> Result<(), TaskError> {
        if total > claim.bytes() {
            claim
                .grow_to(total, self.config.budget_retries, self.config.budget_backoff)
                .await?;
        }
        Ok(())
    }
}

fn size_limit(got: u64, max_bytes: u64) -> TaskError {
    TaskError::SizeLimit(format!("cuerpo de {} bytes, máximo {}", got, max_bytes))
}

async fn run_blocking<T, F>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TaskError::Decode(format!("panic o join error procesando la imagen: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryBody;
    use common::CountMode;
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use std::{
        collections::HashMap,
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Fuente en memoria: url -> respuesta. Cuenta los bytes leídos del cuerpo.
    #[derive(Default)]
    struct MockSource {
        responses: HashMap<String, Result<MemoryBody, TaskError>>,
        pulled: Arc<AtomicUsize>,
    }

    struct CountingBody {
        inner: MemoryBody,
        pulled: Arc<AtomicUsize>,
    }

    impl ImageSource for MockSource {
        type Body = CountingBody;

        async fn open(&self, url: &str) -> Result<CountingBody, TaskError> {
            let inner = self
                .responses
                .get(url)
                .cloned()
                .unwrap_or(Err(TaskError::HttpStatus(404)))?;
            Ok(CountingBody {
                inner,
                pulled: self.pulled.clone(),
            })
        }
    }

    impl ImageBody for CountingBody {
        fn content_length(&self) -> Option<u64> {
            self.inner.content_length()
        }

        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TaskError> {
            let chunk = self.inner.next_chunk().await?;
            if let Some(c) = &chunk {
                self.pulled.fetch_add(c.len(), Ordering::Relaxed);
            }
            Ok(chunk)
        }
    }

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn scenario_2x2() -> Vec<u8> {
        png_bytes(RgbImage::from_fn(2, 2, |x, y| match (x, y) {
            (0, 0) | (1, 0) => Rgb([255, 0, 0]),
            (0, 1) => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        }))
    }

    fn worker_with(
        responses: Vec<(&str, Result<MemoryBody, TaskError>)>,
        config: PipelineConfig,
    ) -> ImageWorker<MockSource> {
        let source = MockSource {
            responses: responses
                .into_iter()
                .map(|(u, r)| (u.to_string(), r))
                .collect(),
            ..Default::default()
        };
        let budget = MemoryBudget::new(config.memory_budget_bytes);
        ImageWorker::new(Arc::new(source), budget, config)
    }

    async fn run(
        worker: &ImageWorker<MockSource>,
        url: &str,
    ) -> (ImageTask, Result<ImageReport, TaskError>) {
        let mut task = ImageTask::new(0, url);
        let claim = worker
            .budget()
            .reserve(worker.config().effective_dispatch_reserve())
            .await
            .unwrap();
        let res = worker.process(&mut task, claim).await;
        (task, res)
    }

    fn pulled(worker: &ImageWorker<MockSource>) -> usize {
        worker.source.pulled.load(Ordering::Relaxed)
    }

    #[tokio::test]
    async fn escenario_2x2_da_rojo_azul_verde() {
        let worker = worker_with(
            vec![("http://a/img1.jpg", Ok(scenario_2x2().into()))],
            PipelineConfig::default(),
        );

        let (task, res) = run(&worker, "http://a/img1.jpg").await;
        let report = res.unwrap();

        assert_eq!(report.colors.hex_codes(), vec!["#FF0000", "#0000FF", "#00FF00"]);
        assert_eq!((report.width, report.height), (2, 2));
        assert_eq!(report.distinct_colors, 3);
        assert_eq!(report.mode, CountMode::Exact);
        assert_eq!(task.state, TaskState::Counting);
        assert_eq!(task.attempt, 1);
        // la reserva se liberó
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test]
    async fn error_de_red_se_propaga_como_fetch() {
        let worker = worker_with(vec![], PipelineConfig::default());
        let (task, res) = run(&worker, "http://a/no-existe.png").await;

        assert_eq!(res.unwrap_err(), TaskError::HttpStatus(404));
        assert_eq!(task.state, TaskState::Fetching);
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test]
    async fn bytes_corruptos_son_error_de_decode() {
        let worker = worker_with(
            vec![("http://a/roto.png", Ok(b"no soy un png".to_vec().into()))],
            PipelineConfig::default(),
        );
        let (_, res) = run(&worker, "http://a/roto.png").await;
        assert_eq!(res.unwrap_err().reason(), "decode");
    }

    #[tokio::test]
    async fn imagen_con_demasiados_pixeles_se_rechaza_antes_de_decodificar() {
        let config = PipelineConfig {
            max_image_pixels: 3,
            ..Default::default()
        };
        let worker = worker_with(vec![("http://a/img1.jpg", Ok(scenario_2x2().into()))], config);
        let (_, res) = run(&worker, "http://a/img1.jpg").await;
        assert_eq!(res.unwrap_err().reason(), "size_limit");
    }

    #[tokio::test]
    async fn presupuesto_menor_que_la_imagen_es_error_de_budget() {
        let config = PipelineConfig {
            memory_budget_bytes: 16,
            budget_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let worker = worker_with(vec![("http://a/img1.jpg", Ok(scenario_2x2().into()))], config);
        let (_, res) = run(&worker, "http://a/img1.jpg").await;

        assert!(matches!(res, Err(TaskError::Budget { limit: 16, .. })));
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test]
    async fn muestreo_queda_marcado_en_el_reporte() {
        let img = RgbImage::from_fn(64, 4, |x, _| {
            if x < 40 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let config = PipelineConfig {
            sample_stride: Some(8),
            ..Default::default()
        };
        let worker = worker_with(vec![("http://a/big.png", Ok(png_bytes(img).into()))], config);
        let (_, res) = run(&worker, "http://a/big.png").await;
        let report = res.unwrap();

        assert_eq!(report.mode, CountMode::Estimated { stride: 8 });
        assert_eq!(report.colors.hex_codes(), vec!["#000000", "#FFFFFF"]);
    }

    #[tokio::test]
    async fn cuerpo_mayor_que_el_presupuesto_falla_antes_de_leerse() {
        let config = PipelineConfig {
            memory_budget_bytes: 16,
            budget_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let body = MemoryBody::new(vec![0u8; 4 << 20]);
        let worker = worker_with(vec![("http://a/grande.png", Ok(body))], config);

        let (task, res) = run(&worker, "http://a/grande.png").await;

        assert_eq!(
            res.unwrap_err(),
            TaskError::Budget {
                needed: 4 << 20,
                limit: 16
            }
        );
        assert_eq!(task.state, TaskState::Fetching);
        assert_eq!(pulled(&worker), 0);
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test]
    async fn cuerpo_sin_largo_reserva_antes_de_cada_pedazo() {
        let config = PipelineConfig {
            memory_budget_bytes: 64 * 1024,
            budget_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let body = MemoryBody::chunked(&vec![0u8; 4 << 20], 16 * 1024);
        let worker = worker_with(vec![("http://a/chunked.png", Ok(body))], config);

        let (_, res) = run(&worker, "http://a/chunked.png").await;

        assert!(matches!(res, Err(TaskError::Budget { limit: 65536, .. })));
        // se cortó apenas el buffer no entraba en el presupuesto
        assert!(pulled(&worker) <= 128 * 1024, "leídos {}", pulled(&worker));
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test]
    async fn cuerpo_mayor_que_el_maximo_es_size_limit() {
        let config = PipelineConfig {
            max_image_bytes: 1024,
            ..Default::default()
        };
        let worker = worker_with(
            vec![
                ("http://a/anunciado.png", Ok(MemoryBody::new(vec![7u8; 2048]))),
                ("http://a/chunked.png", Ok(MemoryBody::chunked(&[7u8; 2048], 512))),
            ],
            config,
        );

        let (_, res) = run(&worker, "http://a/anunciado.png").await;
        assert_eq!(res.unwrap_err().reason(), "size_limit");
        assert_eq!(pulled(&worker), 0);

        let (_, res) = run(&worker, "http://a/chunked.png").await;
        assert_eq!(res.unwrap_err().reason(), "size_limit");
        assert!(pulled(&worker) <= 1024 + 512);
    }

    #[tokio::test]
    async fn cuerpo_en_pedazos_da_el_mismo_resultado() {
        let body = MemoryBody::chunked(&scenario_2x2(), 7);
        let worker = worker_with(vec![("http://a/img1.jpg", Ok(body))], PipelineConfig::default());

        let (_, res) = run(&worker, "http://a/img1.jpg").await;

        assert_eq!(
            res.unwrap().colors.hex_codes(),
            vec!["#FF0000", "#0000FF", "#00FF00"]
        );
        assert_eq!(worker.budget().in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reserva_se_libera_aunque_se_suelte_el_future() {
        let img = RgbImage::from_pixel(1500, 1500, Rgb([9, 9, 9]));
        let worker = worker_with(
            vec![("http://a/lenta.png", Ok(png_bytes(img).into()))],
            PipelineConfig::default(),
        );

        let mut task = ImageTask::new(0, "http://a/lenta.png");
        let claim = worker.budget().reserve(1024).await.unwrap();
        let _ = tokio::time::timeout(
            Duration::from_millis(1),
            worker.process(&mut task, claim),
        )
        .await;

        // el trabajo que quedó en el pool de bloqueo termina o corta solo
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while worker.budget().in_use() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "la reserva no se liberó");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
