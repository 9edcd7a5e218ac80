use std::{collections::VecDeque, future::Future, time::Duration};

use common::{SetupError, TaskError};
use reqwest::{Client, Response};

/// Cuerpo de una respuesta, leído de a pedazos.
pub trait ImageBody: Send {
    /// Tamaño anunciado por el servidor, si lo hay.
    fn content_length(&self) -> Option<u64>;

    /// Siguiente pedazo del cuerpo; `None` al terminar.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TaskError>> + Send;
}

/// De dónde salen los bytes de una imagen.
///
/// `open` sólo valida el status; el cuerpo lo lee el worker, que va
/// reservando memoria antes de acumularlo.
pub trait ImageSource: Send + Sync + 'static {
    type Body: ImageBody + 'static;

    fn open(&self, url: &str) -> impl Future<Output = Result<Self::Body, TaskError>> + Send;
}

/// Fuente HTTP real (reqwest).
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// `timeout` acota cada request completo; el timeout por tarea
    /// del scheduler sigue aplicando por encima.
    pub fn new(timeout: Duration) -> Result<Self, SetupError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("colorchallenge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SetupError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl ImageSource for HttpSource {
    type Body = HttpBody;

    async fn open(&self, url: &str) -> Result<HttpBody, TaskError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TaskError::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TaskError::HttpStatus(status.as_u16()));
        }
        Ok(HttpBody { resp })
    }
}

/// Respuesta HTTP abierta. La conexión se suelta con el drop.
#[derive(Debug)]
pub struct HttpBody {
    resp: Response,
}

impl ImageBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.resp.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TaskError> {
        let chunk = self
            .resp
            .chunk()
            .await
            .map_err(|e| TaskError::Fetch(e.to_string()))?;
        Ok(chunk.map(|c| c.to_vec()))
    }
}

/// Cuerpo que ya está en memoria, entregado en pedazos fijos.
#[derive(Debug, Clone, Default)]
pub struct MemoryBody {
    chunks: VecDeque<Vec<u8>>,
    declared: Option<u64>,
}

impl MemoryBody {
    /// Un solo pedazo, con su largo anunciado.
    pub fn new(bytes: Vec<u8>) -> Self {
        let declared = Some(bytes.len() as u64);
        let mut chunks = VecDeque::new();
        if !bytes.is_empty() {
            chunks.push_back(bytes);
        }
        Self { chunks, declared }
    }

    /// Pedazos de `chunk_size` bytes sin largo anunciado (como un
    /// `Transfer-Encoding: chunked`).
    pub fn chunked(bytes: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
            declared: None,
        }
    }

    /// Pedazos que todavía no se leyeron.
    pub fn remaining_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl From<Vec<u8>> for MemoryBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl ImageBody for MemoryBody {
    fn content_length(&self) -> Option<u64> {
        self.declared
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TaskError> {
        Ok(self.chunks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Servidor HTTP mínimo que responde siempre lo mismo.
    async fn serve_once(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut read = Vec::new();
                // leer hasta el fin de los headers
                while !read.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}/img.png", addr)
    }

    fn source() -> HttpSource {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpSource::with_client(client)
    }

    async fn read_all<B: ImageBody>(body: &mut B) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn status_404_es_error_de_fetch() {
        let url = serve_once("404 Not Found", Vec::new()).await;
        let err = source().open(&url).await.unwrap_err();
        assert_eq!(err, TaskError::HttpStatus(404));
        assert_eq!(err.reason(), "fetch");
    }

    #[tokio::test]
    async fn status_200_anuncia_largo_y_entrega_el_cuerpo() {
        let url = serve_once("200 OK", b"hola imagen".to_vec()).await;
        let mut body = source().open(&url).await.unwrap();

        assert_eq!(body.content_length(), Some(11));
        assert_eq!(read_all(&mut body).await, b"hola imagen");
    }

    #[tokio::test]
    async fn conexion_rechazada_es_error_de_fetch() {
        // puerto recién liberado: nadie escucha
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = source()
            .open(&format!("http://{}/x.png", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Fetch(_)));
    }

    #[tokio::test]
    async fn memory_body_chunked_no_anuncia_largo() {
        let mut body = MemoryBody::chunked(&[1, 2, 3, 4, 5], 2);
        assert_eq!(body.content_length(), None);
        assert_eq!(body.remaining_chunks(), 3);
        assert_eq!(read_all(&mut body).await, vec![1, 2, 3, 4, 5]);

        let mut empty = MemoryBody::new(Vec::new());
        assert_eq!(empty.content_length(), Some(0));
        assert!(empty.next_chunk().await.unwrap().is_none());
    }
}
