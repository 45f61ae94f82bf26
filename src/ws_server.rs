use crate::preview::{CompactPreview, PreviewFrame};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use sha1_smol::Sha1;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Page served when `preview.html` is not found next to the working directory.
const BUILTIN_PAGE: &str = include_str!("../preview.html");
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Browser preview over one port: plain HTTP for the page, WebSocket
/// upgrade for the live matrix.
///
/// - `GET /` or `GET /preview.html` → the preview page
/// - other paths → static files next to the page
/// - WebSocket upgrade → `CompactPreview` JSON, throttled to `target_fps`
///   (which should not exceed the loop's fps; it is also the gate rate)
pub struct WsServer {
    preview_rx: Receiver<PreviewFrame>,
    addr: String,
    target_fps: u32,
    page_path: PathBuf,
}

struct WsClient {
    stream: TcpStream,
    alive: bool,
}

impl WsClient {
    fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));
        Self {
            stream,
            alive: true,
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        let frame = text_frame(text.as_bytes());
        if self.stream.write_all(&frame).is_err() {
            self.alive = false;
        }
        self.alive
    }
}

/// Unmasked single-fragment text frame (server → client).
fn text_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(10 + len);
    frame.push(0x81); // FIN + text
    if len < 126 {
        frame.push(len as u8);
    } else if len < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

type ClientList = Arc<Mutex<Vec<WsClient>>>;

fn lock_clients(clients: &ClientList) -> MutexGuard<'_, Vec<WsClient>> {
    clients.lock().unwrap_or_else(|e| e.into_inner())
}

struct HttpRequest {
    path: String,
    ws_key: Option<String>,
    is_upgrade: bool,
}

fn parse_request<R: BufRead>(reader: &mut R) -> Result<HttpRequest, String> {
    let mut req = HttpRequest {
        path: "/".to_string(),
        ws_key: None,
        is_upgrade: false,
    };
    let mut first = true;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).map_err(|e| e.to_string())? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if first {
            // "GET /path HTTP/1.1"
            if let Some(path) = line.split_whitespace().nth(1) {
                req.path = path.to_string();
            }
            first = false;
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => req.is_upgrade = value.eq_ignore_ascii_case("websocket"),
            "sec-websocket-key" => req.ws_key = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(req)
}

/// `Sec-WebSocket-Accept` for a client key.
fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64_encode(&hasher.digest().bytes())
}

fn base64_encode(data: &[u8]) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let triple = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
        for i in 0..4 {
            if i <= chunk.len() {
                out.push(CHARS[((triple >> (18 - 6 * i)) & 0x3F) as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Cache-Control: no-cache\r\n\
         \r\n",
        status,
        content_type,
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}

fn not_found(stream: &mut TcpStream) {
    respond(
        stream,
        "404 Not Found",
        "text/html",
        b"<h1>404</h1><p>Open <a href=\"/\">/</a> for the LED preview</p>",
    );
}

fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Serve one accepted connection: answer HTTP and close, or upgrade and
/// park the socket in the broadcast list.
fn handle_connection(mut stream: TcpStream, page: &[u8], static_dir: &Path, clients: &ClientList) {
    let req = match stream
        .try_clone()
        .map_err(|e| e.to_string())
        .and_then(|s| parse_request(&mut BufReader::new(s)))
    {
        Ok(r) => r,
        Err(e) => {
            warn!("Request parse error: {}", e);
            return;
        }
    };

    if req.is_upgrade {
        let Some(key) = req.ws_key else {
            respond(&mut stream, "400 Bad Request", "text/plain", b"missing key");
            return;
        };
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            accept_key(&key)
        );
        match stream.write_all(response.as_bytes()) {
            Ok(()) => {
                info!("Preview client connected");
                lock_clients(clients).push(WsClient::new(stream));
            }
            Err(e) => warn!("WS handshake failed: {}", e),
        }
        return;
    }

    match req.path.as_str() {
        "/" | "/index.html" | "/preview.html" => {
            respond(&mut stream, "200 OK", "text/html; charset=utf-8", page)
        }
        path => {
            let clean = path.trim_start_matches('/');
            if clean.contains("..") || clean.contains('\\') {
                not_found(&mut stream);
                return;
            }
            match fs::read(static_dir.join(clean)) {
                Ok(data) => respond(&mut stream, "200 OK", content_type_for(clean), &data),
                Err(_) => not_found(&mut stream),
            }
        }
    }
}

impl WsServer {
    pub fn new(
        preview_rx: Receiver<PreviewFrame>,
        addr: String,
        target_fps: u32,
        page_path: PathBuf,
    ) -> Self {
        Self {
            preview_rx,
            addr,
            target_fps,
            page_path,
        }
    }

    /// Blocks until the preview channel closes.
    pub fn run(self) -> io::Result<()> {
        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));

        let page: Arc<Vec<u8>> = Arc::new(match fs::read(&self.page_path) {
            Ok(data) => {
                info!(
                    "Loaded preview page: {} ({} bytes)",
                    self.page_path.display(),
                    data.len()
                );
                data
            }
            Err(_) => BUILTIN_PAGE.as_bytes().to_vec(),
        });
        let static_dir = Arc::new(
            self.page_path
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf(),
        );

        let listener = TcpListener::bind(&self.addr).inspect_err(|e| {
            error!("Server failed to bind {}: {}", self.addr, e);
        })?;
        info!("Preview server listening on http://{}", self.addr);

        let accept_clients = Arc::clone(&clients);
        thread::Builder::new()
            .name("ws-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let page = Arc::clone(&page);
                            let dir = Arc::clone(&static_dir);
                            let cl = Arc::clone(&accept_clients);
                            // HTTP closes right away; upgraded sockets move to the client list
                            thread::spawn(move || handle_connection(stream, &page, &dir, &cl));
                        }
                        Err(e) => warn!("TCP accept error: {}", e),
                    }
                }
            })?;

        let fps = self.target_fps.max(1);
        let frame_interval = Duration::from_micros(1_000_000 / fps as u64);
        let mut last_send: Option<Instant> = None;
        for frame in self.preview_rx.iter() {
            let now = Instant::now();
            if last_send.is_some_and(|t| now.duration_since(t) < frame_interval) {
                continue;
            }
            last_send = Some(now);

            let json = match serde_json::to_string(&CompactPreview::new(&frame, fps as f32)) {
                Ok(j) => j,
                Err(e) => {
                    warn!("JSON serialize error: {}", e);
                    continue;
                }
            };
            let mut cl = lock_clients(&clients);
            for client in cl.iter_mut() {
                client.send_text(&json);
            }
            let before = cl.len();
            cl.retain(|c| c.alive);
            if cl.len() < before {
                info!("Preview client disconnected ({} remaining)", cl.len());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_accept_key_rfc6455() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_base64_padding() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_text_frame_lengths() {
        assert_eq!(&text_frame(b"hi")[..2], &[0x81, 2]);
        let mid = text_frame(&[b'x'; 300]);
        assert_eq!(&mid[..4], &[0x81, 126, 0x01, 0x2C]);
        let big = text_frame(&vec![b'x'; 70_000]);
        assert_eq!(big[1], 127);
        assert_eq!(&big[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn test_parse_upgrade_request() {
        let raw = "GET /live HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\nSec-WebSocket-Key: abc==\r\n\r\n";
        let req = parse_request(&mut raw.as_bytes()).unwrap();
        assert_eq!(req.path, "/live");
        assert!(req.is_upgrade);
        assert_eq!(req.ws_key.as_deref(), Some("abc=="));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("a/b.js"), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for("x.png"), "image/png");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    fn roundtrip(request: &str) -> (String, ClientList) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));
        let cl = Arc::clone(&clients);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, b"<html>page</html>", Path::new("/nonexistent"), &cl);
        });
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request.as_bytes()).unwrap();
        server.join().unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        // Upgraded sockets stay open, so read until close or timeout
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = client.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        (String::from_utf8_lossy(&out).into_owned(), clients)
    }

    #[test]
    fn test_serves_page() {
        let (resp, clients) = roundtrip("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.ends_with("<html>page</html>"));
        assert!(lock_clients(&clients).is_empty());
    }

    #[test]
    fn test_rejects_traversal() {
        let (resp, _) = roundtrip("GET /../etc/passwd HTTP/1.1\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_upgrade_registers_client() {
        let (resp, clients) = roundtrip(
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 101"));
        assert!(resp.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(lock_clients(&clients).len(), 1);
    }
}
