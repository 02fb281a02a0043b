//! Minimal HTTP/1.1 surface for collaborators.
//!
//! - `GET /`          small HTML page embedding the stream
//! - `GET /stream`    multipart MJPEG stream, one thread per consumer
//! - `GET /snapshot`  save the latest frame (`?quality=1..100&filename=name`)
//! - `GET /info`      connection state and stream statistics (never credentials)
//! - `GET /health`    liveness
//!
//! The accept loop only accepts; every connection is read and answered on its own thread.

use crate::candidates::TransportScheme;
use crate::error::SnapshotError;
use crate::snapshot::SnapshotService;
use crate::stream::{StreamMultiplexer, CONTENT_TYPE};
use crate::supervisor::{CameraContext, ConnectionState};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const INDEX_HTML: &str = "<!DOCTYPE html>\n<html><head><title>camrelay</title></head>\
<body style=\"background:#111;color:#ddd;font-family:sans-serif\">\
<h1>camrelay</h1><img src=\"/stream\" alt=\"camera stream\">\
<p><a href=\"/snapshot\">snapshot</a> | <a href=\"/info\">info</a></p></body></html>\n";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
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
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Everything a request handler may touch.
#[derive(Clone, Debug)]
pub struct RelayServices {
    pub context: Arc<CameraContext>,
    pub multiplexer: Arc<StreamMultiplexer>,
    pub snapshots: Arc<SnapshotService>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    services: RelayServices,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, services: RelayServices) -> Self {
        Self { cfg, services }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("relay api listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let services = self.services;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, services, shutdown_thread) {
                log::error!("relay api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    services: RelayServices,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let services = services.clone();
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name("api-request".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &services, &shutdown) {
                            log::warn!("relay api request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("relay api could not serve {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    services: &RelayServices,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }
    match request.path.as_str() {
        "/" => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            INDEX_HTML.as_bytes(),
        ),
        "/health" => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        "/info" => {
            let info = InfoResponse::collect(services);
            write_json_response(&mut stream, 200, &info)
        }
        "/snapshot" => handle_snapshot(&mut stream, &request, &services.snapshots),
        "/stream" => serve_stream(stream, peer, services, shutdown),
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn handle_snapshot(
    stream: &mut TcpStream,
    request: &HttpRequest,
    snapshots: &SnapshotService,
) -> Result<()> {
    let quality = match request.query.get("quality") {
        Some(raw) => match raw.trim().parse::<u8>() {
            Ok(quality) => Some(quality),
            Err(_) => {
                let body = json!({
                    "success": false,
                    "error": format!("quality must be an integer in 1..=100, got '{raw}'"),
                });
                return write_json_response(stream, 400, &body);
            }
        },
        None => None,
    };
    let hint = request.query.get("filename").map(String::as_str);

    match snapshots.capture(quality, hint) {
        Ok((result, path)) => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&result.filename)
                .to_string();
            let body = json!({
                "success": true,
                "filename": filename,
                "sequence": result.sequence,
                "width": result.width,
                "height": result.height,
                "bytes": result.jpeg.len(),
            });
            write_json_response(stream, 200, &body)
        }
        Err(err) => {
            let status = match err {
                SnapshotError::NoFrameAvailable => 503,
                SnapshotError::InvalidQuality(_) => 400,
                SnapshotError::Encode(_) | SnapshotError::Io(_) => 500,
            };
            log::warn!("snapshot failed: {}", err);
            let body = json!({"success": false, "error": err.to_string()});
            write_json_response(stream, status, &body)
        }
    }
}

/// Runs on the connection's own thread until the consumer leaves or the server stops.
fn serve_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    services: &RelayServices,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {CONTENT_TYPE}\r\nCache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;

    let cancelled = || shutdown.load(Ordering::SeqCst);
    if let Err(err) = services
        .multiplexer
        .serve(&mut stream, &peer.to_string(), &cancelled)
    {
        log::info!("stream consumer {} went away: {}", peer, err);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    state: ConnectionState,
    host: String,
    model: String,
    port: u16,
    rtsp_port: u16,
    scheme: Option<TransportScheme>,
    url: Option<String>,
    width: u32,
    height: u32,
    fps: f64,
    frames_total: u64,
    last_error: Option<String>,
    reconnects: u64,
    active_sessions: usize,
    started_at: String,
    uptime_secs: u64,
}

impl InfoResponse {
    fn collect(services: &RelayServices) -> Self {
        let status = services.context.status();
        let endpoint = services.context.endpoint();
        Self {
            state: status.state,
            host: endpoint.host().to_string(),
            model: endpoint.model().to_string(),
            port: endpoint.port(),
            rtsp_port: endpoint.rtsp_port(),
            scheme: status.candidate.as_ref().map(|c| c.scheme),
            url: status.candidate.map(|c| c.url),
            width: status.width,
            height: status.height,
            fps: (status.fps * 10.0).round() / 10.0,
            frames_total: status.frames_total,
            last_error: status.last_error,
            reconnects: status.reconnects,
            active_sessions: services.multiplexer.active_sessions(),
            started_at: status.started_at.to_rfc3339(),
            uptime_secs: status.uptime.as_secs(),
        }
    }
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
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn write_json_response<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<()> {
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
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    query: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_strings_are_decoded() {
        let query = parse_query("quality=80&filename=front%20door.jpg&flag");
        assert_eq!(query.get("quality").map(String::as_str), Some("80"));
        assert_eq!(query.get("filename").map(String::as_str), Some("front door.jpg"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }
}
