// End-to-end tests: each case boots a real server on an ephemeral port
// over a throwaway document root and speaks HTTP/1.1 over a raw
// TcpStream.

use satie::{Config, Server};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct TestServer {
    port: u16,
    _root: tempfile::TempDir,
}

fn populate_root(root: &Path) {
    fs::write(root.join("small.txt"), "hello\n".repeat(500)).unwrap();

    let big: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("big.bin"), big).unwrap();

    let range: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
    fs::write(root.join("range.bin"), range).unwrap();

    fs::write(root.join("a.txt"), "AAA").unwrap();
    fs::write(root.join("b.txt"), "BBB").unwrap();

    fs::create_dir(root.join("subdir")).unwrap();
    fs::write(root.join("subdir/index.html"), "<h1>sub index</h1>").unwrap();

    fs::create_dir(root.join("plain")).unwrap();
    fs::write(root.join("plain/visible.txt"), "v").unwrap();
    fs::write(root.join("plain/.hidden"), "h").unwrap();
}

fn start_server(keep_alive_timeout: u32) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    populate_root(root.path());

    let mut config = Config::for_root(root.path().to_str().unwrap());
    config.server_port = 0;
    config.worker_threads = 2;
    config.keep_alive_timeout = keep_alive_timeout;

    let server = Server::bind(config).unwrap();
    let port = server.local_port();

    let shutdown = Arc::new(AtomicBool::new(false));
    thread::spawn(move || {
        server.serve_with_shutdown(shutdown).unwrap();
    });

    // Give the workers time to register their pipes
    thread::sleep(Duration::from_millis(50));

    TestServer { port, _root: root }
}

type Response = (u16, Vec<(String, String)>, Vec<u8>);

fn send_request(port: u16, raw: &str) -> Response {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(raw.as_bytes()).unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    parse_response(&buf)
}

fn parse_response(buf: &[u8]) -> Response {
    let pos = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");

    let head = std::str::from_utf8(&buf[..pos]).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    assert!(status_line.starts_with("HTTP/1.1 "), "{}", status_line);
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();

    let headers = lines
        .map(|line| {
            let (name, value) = line.split_once(": ").unwrap();
            (name.to_string(), value.to_string())
        })
        .collect();

    (status, headers, buf[pos + 4..].to_vec())
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read exactly one response off a keep-alive connection.
fn read_one_response(stream: &mut TcpStream) -> Response {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-response");
        buf.extend_from_slice(&chunk[..n]);
    };

    let (_, headers, _) = parse_response(&buf[..header_end]);
    let content_length: usize = header(&headers, "Content-Length")
        .expect("Content-Length missing")
        .parse()
        .unwrap();

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    parse_response(&buf[..header_end + content_length])
}

#[test]
fn test_s1_small_file_without_compression() {
    let server = start_server(15);
    let (status, headers, body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Length"), Some("3000"));
    assert_eq!(header(&headers, "Content-Type"), Some("text/plain"));
    assert!(header(&headers, "Content-Encoding").is_none());
    assert!(header(&headers, "Last-Modified").is_some());
    assert!(header(&headers, "Date").is_some());
    assert!(header(&headers, "Expires").is_some());
    assert_eq!(body, "hello\n".repeat(500).into_bytes());
}

#[test]
fn test_s2_range_request_on_large_file() {
    let server = start_server(15);
    let (status, headers, body) = send_request(
        server.port,
        "GET /big.bin HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-65535\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(status, 206);
    assert_eq!(header(&headers, "Content-Length"), Some("65536"));
    let expected: Vec<u8> = (0..65536).map(|i| (i % 251) as u8).collect();
    assert_eq!(body, expected);
}

#[test]
fn test_s3_directory_with_index_html() {
    let server = start_server(15);
    let (status, headers, body) = send_request(
        server.port,
        "GET /subdir/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), Some("text/html"));
    assert_eq!(body, b"<h1>sub index</h1>");
}

#[test]
fn test_s4_directory_listing() {
    let server = start_server(15);
    let (status, headers, body) = send_request(
        server.port,
        "GET /plain/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), Some("text/html"));
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("visible.txt"));
    assert!(!html.contains(".hidden"));
}

#[test]
fn test_s5_path_escape_is_not_found() {
    let server = start_server(15);
    let (status, _, _) = send_request(
        server.port,
        "GET /../etc/passwd HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 404);

    // Inner parent references that stay below the root are fine.
    let (status, _, body) = send_request(
        server.port,
        "GET /subdir/../a.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(body, b"AAA");
}

#[test]
fn test_s6_keep_alive_serves_in_order_then_times_out() {
    let server = start_server(1);
    let mut stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream
        .write_all(b"GET /a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_one_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Connection"), Some("keep-alive"));
    assert_eq!(body, b"AAA");

    stream
        .write_all(b"GET /b.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_one_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"BBB");

    // The idle connection is reaped once keep_alive_timeout elapses.
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(n) => assert_eq!(n, 0, "unexpected extra bytes"),
        Err(e) => panic!("expected clean close, got {}", e),
    }
}

#[test]
fn test_p5_head_matches_get() {
    let server = start_server(15);
    let (get_status, get_headers, get_body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let (head_status, head_headers, head_body) = send_request(
        server.port,
        "HEAD /small.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(head_status, get_status);
    assert!(head_body.is_empty());
    assert!(!get_body.is_empty());
    for name in ["Content-Length", "Content-Type", "Last-Modified"] {
        assert_eq!(header(&head_headers, name), header(&get_headers, name));
    }
}

#[test]
fn test_p6_compression_is_opt_in() {
    let server = start_server(15);

    let (status, headers, body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: deflate\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Encoding"), Some("deflate"));
    assert!(body.len() < 3000);

    let mut decoder = flate2::read::ZlibDecoder::new(body.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    assert_eq!(decompressed, "hello\n".repeat(500).into_bytes());

    // A client that did not ask for deflate never receives it.
    let (_, headers, body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
    );
    assert!(header(&headers, "Content-Encoding").is_none());
    assert_eq!(body.len(), 3000);
}

#[test]
fn test_p7_conditional_get() {
    let server = start_server(15);

    let (status, _, body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nIf-Modified-Since: Thu, 01 Jan 2037 00:00:00 GMT\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 304);
    assert!(body.is_empty());

    let (status, _, body) = send_request(
        server.port,
        "GET /small.txt HTTP/1.1\r\nHost: localhost\r\nIf-Modified-Since: Thu, 01 Jan 1970 00:00:00 GMT\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(body.len(), 3000);
}

#[test]
fn test_p8_range_semantics_table() {
    let server = start_server(15);

    let (status, headers, body) = send_request(
        server.port,
        "GET /range.bin HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-99\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 206);
    assert_eq!(header(&headers, "Content-Length"), Some("100"));
    assert_eq!(body.len(), 100);
    assert_eq!(body, (0..100).map(|i| i as u8).collect::<Vec<u8>>());

    let (status, headers, body) = send_request(
        server.port,
        "GET /range.bin HTTP/1.1\r\nHost: localhost\r\nRange: bytes=900-\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 206);
    assert_eq!(header(&headers, "Content-Length"), Some("100"));
    assert_eq!(body, (900..1000).map(|i| (i % 256) as u8).collect::<Vec<u8>>());

    let (status, _, _) = send_request(
        server.port,
        "GET /range.bin HTTP/1.1\r\nHost: localhost\r\nRange: bytes=2000-3000\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 416);

    let (status, headers, body) = send_request(
        server.port,
        "GET /range.bin HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Length"), Some("1000"));
    assert_eq!(body.len(), 1000);
}

#[test]
fn test_p8_range_applies_to_small_files_with_deflate_capable_client() {
    let server = start_server(15);

    // range.bin is far below the small-file threshold; a ranged request
    // must window the stored bytes and never pick the compressed copy.
    let (status, headers, body) = send_request(
        server.port,
        "GET /range.bin HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: deflate\r\nRange: bytes=10-19\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 206);
    assert_eq!(header(&headers, "Content-Length"), Some("10"));
    assert!(header(&headers, "Content-Encoding").is_none());
    assert_eq!(body, (10..20).map(|i| i as u8).collect::<Vec<u8>>());
}

#[test]
fn test_pipelined_requests_straddle_the_read_buffer() {
    let server = start_server(15);
    let mut stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Three ~1500-byte requests in one send: the third head straddles
    // the 4096-byte read buffer and must still be answered normally.
    let filler = "x".repeat(1400);
    let request = format!(
        "GET /a.txt HTTP/1.1\r\nHost: localhost\r\nX-Filler: {}\r\n\r\n",
        filler
    );
    assert!(request.len() > 1400 && request.len() < 1600);
    stream.write_all(request.repeat(3).as_bytes()).unwrap();

    for _ in 0..3 {
        let (status, _, body) = read_one_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(body, b"AAA");
    }
}

#[test]
fn test_missing_file_is_404_with_error_page() {
    let server = start_server(15);
    let (status, headers, body) = send_request(
        server.port,
        "GET /no-such-file HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status, 404);
    assert_eq!(header(&headers, "Content-Type"), Some("text/html"));
    assert!(String::from_utf8(body).unwrap().contains("404 Not Found"));
}
