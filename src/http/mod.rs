//! The HTTP/1.1 subset spoken by the transfer engine.
//!
//! Parsing ([`Request::parse`]) and resolution (`ShareRegistry::resolve`) are
//! separate stages: this module only turns bytes into typed values and back.

pub mod mime;
pub mod range;
pub mod request;
pub mod response;

pub use axum::http::{Method, StatusCode, Version};
pub use mime::content_type;
pub use range::{ByteRange, RangeRequest};
pub use request::{Request, RequestError, Target, MAX_HEAD_BYTES};
pub use response::{http_date, parse_http_date, ResponseHead};
