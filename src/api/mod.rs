//! HTTP front end: live viewer streams plus session and recording control.
//!
//! Routes:
//! - `GET /health`
//! - `GET /stream[?address=<url>]`: starts a live session for this viewer and
//!   streams newline-delimited JSON frames until the viewer disconnects
//! - `GET /sessions`
//! - `POST /recordings[?address=<url>&max_duration=<secs>]`
//! - `POST /recordings/<id>/stop[?analyze=true&frame_interval=<n>]`

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::control::Control;
use crate::deliver::{DeliveryLoop, DeliverySettings, TcpViewerConnection};
use crate::detect::ProcessorKind;
use crate::error::StreamError;
use crate::worker::StopSignal;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_IDLE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub delivery: DeliverySettings,
    pub processor: ProcessorKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8081".to_string(),
            delivery: DeliverySettings::default(),
            processor: ProcessorKind::default(),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, end every viewer stream and wait for the server thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("viewer server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ViewerServer {
    cfg: ServerConfig,
    control: Control,
}

struct ServerContext {
    cfg: ServerConfig,
    control: Control,
}

struct Viewer {
    stop: StopSignal,
    join: JoinHandle<()>,
}

impl ViewerServer {
    pub fn new(cfg: ServerConfig, control: Control) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("binding viewer server to {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(ServerContext {
            cfg: self.cfg,
            control: self.control,
        });
        let join = std::thread::Builder::new()
            .name("viewer-server".into())
            .spawn(move || {
                if let Err(err) = run_server(listener, ctx, shutdown_thread) {
                    log::error!("viewer server stopped: {:#}", err);
                }
            })?;
        log::info!("viewer server listening on {}", addr);

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut viewers: Vec<Viewer> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        viewers.retain(|v| !v.join.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let stop = StopSignal::new();
                let viewer_stop = stop.clone();
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("viewer-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx, viewer_stop) {
                            log::warn!("viewer {} request failed: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(join) => viewers.push(Viewer { stop, join }),
                    Err(err) => log::error!("could not spawn viewer thread: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };

    for viewer in &viewers {
        viewer.stop.stop();
    }
    for viewer in viewers {
        if viewer.join.join().is_err() {
            log::error!("viewer thread panicked");
        }
    }
    result
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext, server_stop: StopSignal) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", ["sessions"]) => {
            let sessions = ctx.control.list_active_sessions();
            write_serialized(&mut stream, 200, &sessions)
        }
        ("GET", ["stream"]) => serve_stream(stream, ctx, &request, server_stop),
        ("POST", ["recordings"]) => {
            let max_duration = match request.query_parsed::<u64>("max_duration") {
                Ok(secs) => secs.map(Duration::from_secs),
                Err(err) => return write_error(&mut stream, 400, "bad_request", &err.to_string()),
            };
            let address = request.query("address");
            match ctx.control.start_recording(address.as_deref(), max_duration) {
                Ok(started) => write_serialized(&mut stream, 200, &started),
                Err(err) => write_stream_error(&mut stream, &err),
            }
        }
        ("POST", ["recordings", id, "stop"]) => {
            let analyze = request
                .query("analyze")
                .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
            let frame_interval = match request.query_parsed::<u64>("frame_interval") {
                Ok(n) => n,
                Err(err) => return write_error(&mut stream, 400, "bad_request", &err.to_string()),
            };
            match ctx.control.stop_recording(id, analyze, frame_interval) {
                Ok(stopped) => write_serialized(&mut stream, 200, &stopped),
                Err(err) => write_stream_error(&mut stream, &err),
            }
        }
        (_, ["health"] | ["sessions"] | ["stream"] | ["recordings"] | ["recordings", _, "stop"]) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_stream(
    mut stream: TcpStream,
    ctx: &ServerContext,
    request: &HttpRequest,
    server_stop: StopSignal,
) -> Result<()> {
    let address = request
        .query("address")
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| ctx.control.defaults().source_url.clone());
    let manager = ctx.control.manager();
    let live = match manager.start_session(&address) {
        Ok(live) => live,
        Err(err) => {
            log::warn!("viewer stream for {} unavailable: {}", address, err);
            return write_error(&mut stream, 503, "source_unavailable", &err.to_string());
        }
    };

    let header = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n";
    let streamed = stream
        .write_all(header.as_bytes())
        .map_err(anyhow::Error::from)
        .and_then(|_| TcpViewerConnection::new(stream))
        .map(|connection| {
            // Server shutdown ends this viewer's delivery too.
            let session_stop = live.stop.clone();
            let watcher = std::thread::spawn(move || {
                while !session_stop.is_stopped() {
                    if server_stop.wait_timeout(Duration::from_millis(100)) {
                        session_stop.stop();
                    }
                }
            });
            let mut delivery = DeliveryLoop::new(
                live.buffer.clone(),
                ctx.cfg.processor.build(),
                Box::new(connection),
                ctx.cfg.delivery,
                live.stop.clone(),
            )
            .with_source(address.clone());
            if let Some(history) = manager.history() {
                delivery =
                    delivery.with_history(live.id.clone(), history.filter.clone(), history.handle.clone());
            }
            let stats = delivery.run();
            live.stop.stop();
            let _ = watcher.join();
            stats
        });

    match manager.stop_session(&live.id) {
        Ok(_) | Err(StreamError::UnknownSession(_)) => {}
        Err(err) => log::warn!("stopping session {}: {}", live.id, err),
    }
    let stats = streamed?;
    log::info!(
        "viewer of {} done: {} frames sent ({:?})",
        address,
        stats.frames_sent,
        stats.ended
    );
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
    parse_request(&data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_uppercase(),
        path: path.to_string(),
        headers,
        params,
    })
}

fn write_serialized<T: Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, code: &str, detail: &str) -> Result<()> {
    write_serialized(
        stream,
        status,
        &serde_json::json!({ "error": code, "detail": detail }),
    )
}

fn write_stream_error(stream: &mut TcpStream, err: &StreamError) -> Result<()> {
    let (status, code) = match err {
        StreamError::UnknownSession(_) => (404, "unknown_session"),
        StreamError::Transport { .. } | StreamError::SessionStart { .. } | StreamError::StaleData(_) => {
            (503, "source_unavailable")
        }
        StreamError::Resource { .. } => (500, "resource_unavailable"),
        StreamError::Processor(_) | StreamError::Persistence(_) => (500, "internal"),
    };
    write_error(stream, status, code, &err.to_string())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
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
    #[allow(dead_code)]
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<String> {
        self.params.get(key).cloned()
    }

    fn query_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("invalid {} '{}': {}", key, raw, e)),
        }
    }
}
