//! Request head parsing.

use axum::http::{Method, StatusCode, Version};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::response::parse_http_date;

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Reasons a request head is rejected before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("malformed request line")]
    MalformedRequestLine,

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("malformed header line")]
    MalformedHeader,

    #[error("malformed request target")]
    MalformedTarget,

    #[error("request target tries to leave the share root")]
    Traversal,

    #[error("request bodies are not accepted")]
    BodyNotAllowed,

    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
}

impl RequestError {
    /// Status code sent back for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Traversal => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Decoded request target: the path split into percent-decoded segments.
///
/// Decoding happens exactly once, here. A segment that decodes to `.`, `..`,
/// or contains a path separator or NUL is rejected as traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    segments: Vec<String>,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        let path = strip_authority(raw)?;
        let path = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        if !path.starts_with('/') {
            return Err(RequestError::MalformedTarget);
        }

        let mut segments = Vec::new();
        for encoded in path.split('/').filter(|s| !s.is_empty()) {
            let decoded = percent_decode_str(encoded)
                .decode_utf8()
                .map_err(|_| RequestError::MalformedTarget)?;
            if decoded == "." || decoded == ".." || decoded.contains(['/', '\\', '\0']) {
                return Err(RequestError::Traversal);
            }
            segments.push(decoded.into_owned());
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn strip_authority(raw: &str) -> Result<&str, RequestError> {
    for scheme in ["http://", "https://"] {
        if raw
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        {
            let rest = &raw[scheme.len()..];
            return Ok(rest.find('/').map(|i| &rest[i..]).unwrap_or("/"));
        }
    }
    Ok(raw)
}

/// A parsed request head. Only GET and HEAD are representable.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: Target,
    pub version: Version,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Parse a request head (request line plus header lines, without the
    /// terminating blank line). Lines may end in `\r\n` or `\n`.
    pub fn parse(head: &str) -> Result<Self, RequestError> {
        let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));

        let request_line = lines.next().ok_or(RequestError::MalformedRequestLine)?;
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RequestError::MalformedRequestLine);
        };

        let method = match method {
            "GET" => Method::GET,
            "HEAD" => Method::HEAD,
            other => return Err(RequestError::UnsupportedMethod(other.to_string())),
        };
        let version = match version {
            "HTTP/1.1" => Version::HTTP_11,
            "HTTP/1.0" => Version::HTTP_10,
            other => return Err(RequestError::UnsupportedVersion(other.to_string())),
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            // obs-fold continuation lines are not accepted
            if line.starts_with([' ', '\t']) {
                return Err(RequestError::MalformedHeader);
            }
            let (name, value) = line.split_once(':').ok_or(RequestError::MalformedHeader)?;
            if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
                return Err(RequestError::MalformedHeader);
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let request = Self {
            method,
            target: Target::parse(target)?,
            version,
            headers,
        };
        request.reject_body()?;
        Ok(request)
    }

    fn reject_body(&self) -> Result<(), RequestError> {
        if self.header("transfer-encoding").is_some() {
            return Err(RequestError::BodyNotAllowed);
        }
        match self.header("content-length") {
            Some(len) => match len.parse::<u64>() {
                Ok(0) => Ok(()),
                Ok(_) => Err(RequestError::BodyNotAllowed),
                Err(_) => Err(RequestError::MalformedHeader),
            },
            None => Ok(()),
        }
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Whether the client wants the connection kept open after this exchange.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(str::to_ascii_lowercase);
        let has = |token: &str| {
            connection
                .as_deref()
                .is_some_and(|v| v.split(',').any(|t| t.trim() == token))
        };

        if has("close") {
            false
        } else if self.version == Version::HTTP_10 {
            has("keep-alive")
        } else {
            true
        }
    }

    pub fn range(&self) -> Option<&str> {
        self.header("range")
    }

    pub fn if_modified_since(&self) -> Option<DateTime<Utc>> {
        self.header("if-modified-since").and_then(parse_http_date)
    }
}
