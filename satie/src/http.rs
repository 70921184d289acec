// src/http.rs
use crate::date::{self, DateCache};
use std::io::Write;

pub const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }
}

/// A request as parsed straight out of the read buffer; borrows from it.
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub http10: bool,
    pub headers: [(&'a str, &'a str); MAX_HEADERS],
    pub header_count: u8,
}

impl<'a> Request<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers[..self.header_count as usize]
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

/// The owned, typed head of a request: everything the file handler needs,
/// decoupled from the read buffer so it can outlive task suspensions.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub accepts_deflate: bool,
    pub if_modified_since: Option<i64>,
    /// Raw `Range: bytes=from-to` endpoints; -1 marks an absent endpoint.
    pub range: Option<(i64, i64)>,
    pub keep_alive: bool,
}

impl RequestHead {
    /// Extract the typed head, filling `query_out` with the parsed
    /// query-string key/value sequence.
    pub fn parse(req: &Request<'_>, query_out: &mut Vec<(String, String)>) -> Self {
        if let Some(q) = req.query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                match pair.find('=') {
                    Some(idx) => {
                        query_out.push((pair[..idx].to_string(), pair[idx + 1..].to_string()))
                    }
                    None => query_out.push((pair.to_string(), String::new())),
                }
            }
        }

        let keep_alive = match req.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            // HTTP/1.1 defaults to keep-alive per RFC 7230
            _ => !req.http10,
        };

        let accepts_deflate = req
            .header("Accept-Encoding")
            .map(client_accepts_deflate)
            .unwrap_or(false);

        let if_modified_since = req
            .header("If-Modified-Since")
            .and_then(date::parse_http_date);

        let range = req.header("Range").and_then(parse_range_header);

        Self {
            method: req.method,
            path: req.path.to_string(),
            accepts_deflate,
            if_modified_since,
            range,
            keep_alive,
        }
    }
}

fn client_accepts_deflate(value: &str) -> bool {
    value
        .split(',')
        .any(|tok| tok.trim().split(';').next() == Some("deflate"))
}

/// Parse the single-range `bytes=start-end` form. Anything else (other
/// units, multiple ranges) is treated as if no Range header were present.
fn parse_range_header(value: &str) -> Option<(i64, i64)> {
    let range = value.strip_prefix("bytes=")?;
    if range.contains(',') {
        return None;
    }
    let dash = range.find('-')?;
    let (lhs, rhs) = (&range[..dash], &range[dash + 1..]);
    let from = if lhs.is_empty() { -1 } else { lhs.trim().parse().ok()? };
    let to = if rhs.is_empty() { -1 } else { rhs.trim().parse().ok()? };
    Some((from, to))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok,
    PartialContent,
    NotModified,
    Forbidden,
    NotFound,
    RangeUnsatisfiable,
    InternalError,
    Unavailable,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::PartialContent => 206,
            HttpStatus::NotModified => 304,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::RangeUnsatisfiable => 416,
            HttpStatus::InternalError => 500,
            HttpStatus::Unavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::PartialContent => "Partial Content",
            HttpStatus::NotModified => "Not Modified",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::RangeUnsatisfiable => "Requested Range Not Satisfiable",
            HttpStatus::InternalError => "Internal Server Error",
            HttpStatus::Unavailable => "Service Unavailable",
        }
    }
}

/// Format the response head into the connection's reusable buffer.
/// `content_length` is computed on the payload actually chosen (the
/// compressed copy when it is going to be sent).
#[allow(clippy::too_many_arguments)]
pub fn prepare_response_header(
    buf: &mut Vec<u8>,
    status: HttpStatus,
    content_length: u64,
    mime_type: &str,
    last_modified: Option<&str>,
    dates: &DateCache,
    deflated: bool,
    keep_alive: bool,
) {
    let _ = write!(
        buf,
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\n",
        status.code(),
        status.reason(),
        content_length,
        mime_type
    );
    if let Some(lm) = last_modified {
        let _ = write!(buf, "Last-Modified: {}\r\n", lm);
    }
    let _ = write!(buf, "Date: {}\r\nExpires: {}\r\n", dates.date, dates.expires);
    if deflated {
        let _ = buf.write_all(b"Content-Encoding: deflate\r\n");
    }
    if keep_alive {
        let _ = buf.write_all(b"Connection: keep-alive\r\n\r\n");
    } else {
        let _ = buf.write_all(b"Connection: close\r\n\r\n");
    }
}

/// Build a complete canned error response (headers + small HTML body).
pub fn fill_error_response(
    buf: &mut Vec<u8>,
    status: HttpStatus,
    dates: &DateCache,
    keep_alive: bool,
) {
    let body = format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.code(),
        reason = status.reason()
    );
    buf.clear();
    prepare_response_header(
        buf,
        status,
        body.len() as u64,
        "text/html",
        None,
        dates,
        false,
        keep_alive,
    );
    buf.extend_from_slice(body.as_bytes());
}
