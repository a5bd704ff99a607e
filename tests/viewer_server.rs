use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use streamwatch::api::{ServerConfig, ServerHandle, ViewerServer};
use streamwatch::control::{Control, ControlDefaults};
use streamwatch::ingest::{SourceSettings, StreamSourceFactory};
use streamwatch::record::RecorderSettings;
use streamwatch::session::{SessionManager, SessionSettings};
use streamwatch::ProcessorKind;

fn start_server(recordings: &std::path::Path) -> (ServerHandle, Arc<SessionManager>) {
    let settings = SessionSettings {
        recorder: RecorderSettings {
            output_dir: recordings.to_path_buf(),
            ..RecorderSettings::default()
        },
        ..SessionSettings::default()
    };
    let manager = Arc::new(SessionManager::new(
        Arc::new(StreamSourceFactory::new(SourceSettings::default())),
        settings,
    ));
    let control = Control::new(
        manager.clone(),
        ControlDefaults {
            source_url: "stub://default_stream?fps=30&width=32&height=24".into(),
            ..ControlDefaults::default()
        },
    );
    let cfg = ServerConfig {
        addr: "127.0.0.1:0".into(),
        processor: ProcessorKind::Motion,
        ..ServerConfig::default()
    };
    let handle = ViewerServer::new(cfg, control).spawn().expect("spawn server");
    (handle, manager)
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn request(addr: SocketAddr, method: &str, target: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    write!(stream, "{} {} HTTP/1.1\r\nHost: local\r\n\r\n", method, target).expect("write");
    let mut raw = String::new();
    stream.read_to_string(&mut raw).expect("read response");
    let (head, body) = raw.split_once("\r\n\r\n").expect("header terminator");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).expect("json body")
    };
    (status, body)
}

fn wait_for_sessions(addr: SocketAddr, expected: usize) -> Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = request(addr, "GET", "/sessions");
        assert_eq!(status, 200);
        let count = body.as_array().map_or(0, |a| a.len());
        if count == expected || Instant::now() > deadline {
            assert_eq!(count, expected, "sessions: {}", body);
            return body;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn health_and_unknown_routes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _manager) = start_server(dir.path());

    let (status, body) = request(server.addr, "GET", "/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, _) = request(server.addr, "GET", "/nope");
    assert_eq!(status, 404);

    let (status, _) = request(server.addr, "DELETE", "/sessions");
    assert_eq!(status, 405);

    server.stop().expect("stop server");
}

#[test]
fn stream_sends_json_frames_until_viewer_leaves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _manager) = start_server(dir.path());

    let address = "stub://porch?fps=30&width=32&height=24";
    let mut stream = TcpStream::connect(server.addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    write!(
        stream,
        "GET /stream?address={} HTTP/1.1\r\nHost: local\r\n\r\n",
        encode(address)
    )
    .expect("write request");

    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut status_line = String::new();
    reader.read_line(&mut status_line).expect("status line");
    assert!(status_line.starts_with("HTTP/1.1 200"), "{}", status_line);
    let mut content_type = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("header");
        if line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Type:") {
            content_type = Some(value.trim().to_string());
        }
    }
    assert_eq!(content_type.as_deref(), Some("application/x-ndjson"));

    let mut sequences = Vec::new();
    for _ in 0..3 {
        let mut line = String::new();
        reader.read_line(&mut line).expect("frame line");
        let message: Value = serde_json::from_str(line.trim_end()).expect("frame json");
        assert!(!message["image"].as_str().unwrap_or_default().is_empty());
        assert_eq!(message["source"], address);
        assert!(message["fps"].as_f64().unwrap_or_default() > 0.0);
        assert!(message["detections"].is_object());
        sequences.push(message["sequence"].as_u64().expect("sequence"));
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{:?}", sequences);

    let listed = wait_for_sessions(server.addr, 1);
    assert_eq!(listed[0]["kind"], "live");
    assert_eq!(listed[0]["address"], address);

    drop(reader);
    drop(stream);
    wait_for_sessions(server.addr, 0);

    server.stop().expect("stop server");
}

#[test]
fn unreachable_source_is_service_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, manager) = start_server(dir.path());

    let target = format!("/stream?address={}", encode("stub://down?fail_open=true"));
    let (status, body) = request(server.addr, "GET", &target);
    assert_eq!(status, 503);
    assert_eq!(body["error"], "source_unavailable");
    assert_eq!(manager.session_count(), 0);

    let target = format!("/recordings?address={}", encode("ftp://camera"));
    let (status, _) = request(server.addr, "POST", &target);
    assert_eq!(status, 503);

    server.stop().expect("stop server");
}

#[test]
fn recording_start_list_stop_and_analyze() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _manager) = start_server(dir.path());

    let target = format!(
        "/recordings?address={}&max_duration=30",
        encode("stub://yard?fps=30&width=16&height=16")
    );
    let (status, started) = request(server.addr, "POST", &target);
    assert_eq!(status, 200, "{}", started);
    let session_id = started["session_id"].as_str().expect("session id").to_string();
    let output_path = started["output_path"].as_str().expect("path").to_string();
    assert!(output_path.ends_with(".svr"));

    let listed = wait_for_sessions(server.addr, 1);
    assert_eq!(listed[0]["kind"], "recording");
    assert_eq!(listed[0]["session_id"], session_id.as_str());

    std::thread::sleep(Duration::from_millis(400));
    let target = format!("/recordings/{}/stop?analyze=true&frame_interval=2", session_id);
    let (status, stopped) = request(server.addr, "POST", &target);
    assert_eq!(status, 200, "{}", stopped);
    assert_eq!(stopped["output_path"], output_path.as_str());
    assert!(stopped["outcome"]["frames"].as_u64().unwrap_or_default() > 0);
    assert_eq!(stopped["outcome"]["ended"], "stopped");
    assert_eq!(stopped["analysis"]["frame_interval"], 2);
    assert!(std::path::Path::new(&output_path).exists());

    let (status, body) = request(server.addr, "POST", &target);
    assert_eq!(status, 404);
    assert_eq!(body["error"], "unknown_session");
    wait_for_sessions(server.addr, 0);

    let (status, _) = request(server.addr, "POST", "/recordings?max_duration=soon");
    assert_eq!(status, 400);

    server.stop().expect("stop server");
}
