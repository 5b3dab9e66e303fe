use crate::encode::{multipart_chunk, MULTIPART_CONTENT_TYPE};
use crate::session::CameraSession;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub screenshot_path: PathBuf,
    /// Pause between placeholder frames on `/video_feed` so a dead device
    /// does not turn the stream into a busy loop.
    pub placeholder_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            screenshot_path: PathBuf::from("screenshot.jpg"),
            placeholder_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and end open streams.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    session: Arc<CameraSession>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, session: Arc<CameraSession>) -> Self {
        Self { cfg, session }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let session = self.session;
        let join = std::thread::Builder::new()
            .name("camwatch-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, cfg, session, shutdown_thread) {
                    log::error!("camera api stopped: {}", err);
                }
            })?;

        log::info!("camera api listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    session: Arc<CameraSession>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let session = session.clone();
                let shutdown = shutdown.clone();
                // One thread per connection; /video_feed holds its thread for
                // as long as the viewer stays connected.
                let spawned = std::thread::Builder::new()
                    .name("camwatch-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &cfg, &session, &shutdown) {
                            log::warn!("camera api request failed: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    session: &CameraSession,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        "/status" => {
            let payload = serde_json::to_value(session.status())?;
            write_json_response(&mut stream, 200, &payload)
        }
        "/video_feed" => stream_video(&mut stream, cfg, session, shutdown),
        "/record" => match session.toggle_recording() {
            Ok(recording) => {
                write_json_response(&mut stream, 200, &json!({"recording": recording}))
            }
            Err(err) => {
                log::warn!("record toggle failed: {:#}", err);
                write_json_response(&mut stream, 503, &json!({"error": format!("{:#}", err)}))
            }
        },
        "/screenshot" => match session.screenshot(&cfg.screenshot_path) {
            Ok(path) => write_json_response(
                &mut stream,
                200,
                &json!({"screenshot": "happened", "path": path}),
            ),
            Err(err) => {
                log::warn!("screenshot failed: {:#}", err);
                write_json_response(&mut stream, 503, &json!({"error": format!("{:#}", err)}))
            }
        },
        "/reset" => {
            session.reset_device();
            let payload = json!({"device_state": session.status().device_state});
            write_json_response(&mut stream, 200, &payload)
        }
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

/// Serve `multipart/x-mixed-replace` until the viewer goes away or the
/// server stops.
fn stream_video(
    stream: &mut TcpStream,
    cfg: &ApiConfig,
    session: &CameraSession,
    shutdown: &AtomicBool,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        MULTIPART_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let mut served = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        let frame = session.get_frame();
        if let Err(err) = stream.write_all(&multipart_chunk(&frame.data)) {
            log::debug!("video feed viewer left after {} frames: {}", served, err);
            break;
        }
        served += 1;
        if frame.is_placeholder() {
            std::thread::sleep(cfg.placeholder_interval);
        }
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
