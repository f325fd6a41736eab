//! Response heads and HTTP dates.

use std::fmt::Write as _;
use std::time::SystemTime;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};

const SERVER: &str = concat!("mentor/", env!("CARGO_PKG_VERSION"));

/// Status line and headers of a response, serialized before any body bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![
                ("Server", SERVER.to_string()),
                ("Date", http_date(SystemTime::now())),
            ],
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn content_length(self, len: u64) -> Self {
        self.header("Content-Length", len.to_string())
    }

    pub fn chunked(self) -> Self {
        self.header("Transfer-Encoding", "chunked")
    }

    pub fn connection(self, keep_alive: bool) -> Self {
        self.header("Connection", if keep_alive { "keep-alive" } else { "close" })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize the head, including the blank line that ends it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown")
        );
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// A short plain-text error response. The body only ever names the
    /// status; filesystem details stay in the logs.
    pub fn error(status: StatusCode) -> (Self, Vec<u8>) {
        let body = format!(
            "{} {}\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        )
        .into_bytes();
        let head = Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .content_length(body.len() as u64);
        (head, body)
    }
}

/// Format a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an IMF-fixdate. Obsolete RFC 850 and asctime forms are not accepted.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
