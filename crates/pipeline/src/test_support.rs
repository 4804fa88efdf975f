//! Canned HTTP server, scripted engine and in-memory asset catalog for
//! unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use kiln_comfyui::api::ComfyUIApiError;
use kiln_comfyui::catalog::AssetCatalog;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct Canned {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    chunked: bool,
}

impl Canned {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".into(), "application/octet-stream".into())],
            body,
            chunked: false,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            chunked: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send the body with chunked transfer encoding (no declared length).
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }
}

/// Serve `handler(path)` for every request; returns `http://127.0.0.1:<port>`.
pub async fn serve<F>(handler: F) -> String
where
    F: Fn(&str) -> Canned + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let canned = handler(&path);

                let mut head = format!("HTTP/1.1 {} Canned\r\nconnection: close\r\n", canned.status);
                for (k, v) in &canned.headers {
                    head.push_str(&format!("{k}: {v}\r\n"));
                }
                if canned.chunked {
                    head.push_str("transfer-encoding: chunked\r\n\r\n");
                    let _ = socket.write_all(head.as_bytes()).await;
                    for piece in canned.body.chunks(256) {
                        let frame = format!("{:x}\r\n", piece.len());
                        if socket.write_all(frame.as_bytes()).await.is_err()
                            || socket.write_all(piece).await.is_err()
                            || socket.write_all(b"\r\n").await.is_err()
                        {
                            return;
                        }
                    }
                    let _ = socket.write_all(b"0\r\n\r\n").await;
                } else {
                    head.push_str(&format!("content-length: {}\r\n\r\n", canned.body.len()));
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&canned.body).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

/// Prompt id the scripted engine hands out.
pub const ENGINE_PROMPT_ID: &str = "p1";

/// Bytes of the single image the scripted engine renders.
pub const ENGINE_IMAGE: &[u8] = b"\x89PNGrendered";

/// Engine that accepts any graph, reports it finished on the push channel
/// and serves one output image. The last submitted graph is kept.
pub struct FakeEngine {
    pub api_url: String,
    pub ws_url: String,
    submitted: Arc<Mutex<Option<serde_json::Value>>>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let submitted = Arc::new(Mutex::new(None));
        let api_url = engine_http(Arc::clone(&submitted)).await;
        let ws_url = engine_ws().await;
        Self {
            api_url,
            ws_url,
            submitted,
        }
    }

    /// The `prompt` object of the last `POST /prompt`.
    pub fn submitted_graph(&self) -> Option<serde_json::Value> {
        self.submitted.lock().unwrap().clone()
    }
}

async fn engine_http(submitted: Arc<Mutex<Option<serde_json::Value>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let submitted = Arc::clone(&submitted);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 256 * 1024];
                let mut read = 0;
                let head_end = loop {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                    if let Some(i) = buf[..read].windows(4).position(|w| w == b"\r\n\r\n") {
                        break i + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let body_len = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while read < head_end + body_len {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                }

                let mut parts = head.split_whitespace();
                let method = parts.next().unwrap_or("");
                let path = parts.next().unwrap_or("");
                let (status, body): (u16, Vec<u8>) = match (method, path) {
                    ("POST", "/prompt") => {
                        let posted: serde_json::Value =
                            serde_json::from_slice(&buf[head_end..read]).unwrap_or_default();
                        *submitted.lock().unwrap() = posted.get("prompt").cloned();
                        (200, format!(r#"{{"prompt_id":"{ENGINE_PROMPT_ID}","number":0}}"#).into_bytes())
                    }
                    ("GET", p) if p == format!("/history/{ENGINE_PROMPT_ID}") => (
                        200,
                        format!(
                            r#"{{"{ENGINE_PROMPT_ID}":{{"status":{{"status_str":"success","completed":true}},"outputs":{{"9":{{"images":[{{"filename":"engine_0001.png","subfolder":"","type":"output"}}]}}}}}}}}"#
                        )
                        .into_bytes(),
                    ),
                    ("GET", p) if p.starts_with("/view?") => (200, ENGINE_IMAGE.to_vec()),
                    _ => (404, b"not found".to_vec()),
                };
                let head = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

async fn engine_ws() -> String {
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // Let the client submit before events flow.
                tokio::time::sleep(Duration::from_millis(50)).await;
                for frame in [
                    format!(r#"{{"type":"progress","data":{{"value":1,"max":2,"prompt_id":"{ENGINE_PROMPT_ID}"}}}}"#),
                    format!(r#"{{"type":"executing","data":{{"node":null,"prompt_id":"{ENGINE_PROMPT_ID}"}}}}"#),
                ] {
                    if ws.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    format!("ws://{addr}")
}

/// Catalog whose advertised list grows when it is refreshed.
#[derive(Default)]
pub struct FakeCatalog {
    advertised: Mutex<Vec<String>>,
    after_refresh: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
    failing: AtomicBool,
}

impl FakeCatalog {
    pub fn with_assets(names: &[&str]) -> Self {
        let catalog = Self::default();
        *catalog.advertised.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
        catalog
    }

    /// Names that appear once `refresh` has been called.
    pub fn appear_on_refresh(&self, names: &[&str]) {
        self.after_refresh
            .lock()
            .unwrap()
            .extend(names.iter().map(|n| n.to_string()));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetCatalog for FakeCatalog {
    async fn advertised_assets(&self) -> Result<Vec<String>, ComfyUIApiError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ComfyUIApiError::Malformed("catalog offline".into()));
        }
        Ok(self.advertised.lock().unwrap().clone())
    }

    async fn refresh(&self) -> Result<(), ComfyUIApiError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let pending: Vec<String> = self.after_refresh.lock().unwrap().drain(..).collect();
        self.advertised.lock().unwrap().extend(pending);
        Ok(())
    }
}
