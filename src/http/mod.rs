//! HTTP/1.1 protocol engine.
//!
//! The parsers here are incremental and transport-driven: the owner of
//! the connection loops "receive into the buffer, call a parse step"
//! until the step reports completion. Nothing in this module performs
//! I/O except through the [`Io`] facade it is handed.
//!
//! [`Io`]: crate::net::Io

use std::collections::HashMap;

mod body;
mod url;

pub mod client;
pub mod proxy;
mod request;
mod response;

pub use self::client::{ClientOptions, HttpClient, HttpClientPool};
pub use self::request::Request;
pub use self::response::{Response, ResponseData};

pub(crate) use self::body::{body_kind, BodyDecoder};
pub(crate) use self::url::Url;

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const HEADER_SEP: &[u8] = b": ";

/// Map of header key to value. Keys produced by the parsers are always
/// lowercase; values preserve case. Insertion order is not preserved.
pub type HeaderMap = HashMap<String, String>;

/// Request methods understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

/// Status codes the crate composes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    SwitchingProtocols,
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    UpgradeRequired,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::SwitchingProtocols => 101,
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::UpgradeRequired => 426,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::SwitchingProtocols => "Switching Protocols",
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::UpgradeRequired => "Upgrade Required",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// Position of the first CRLF, if a complete line is buffered.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Splits one header line. `": "` is the fast path; a bare `":"` is
/// accepted with the value left-trimmed. `None` means the line carries
/// no separator at all and continues the previous header.
pub(crate) fn split_header_line(line: &[u8]) -> Option<(String, String)> {
    let line = std::str::from_utf8(line).ok()?;
    if let Some((key, value)) = line.split_once(": ") {
        if key.is_empty() {
            return None;
        }
        return Some((key.to_ascii_lowercase(), value.to_string()));
    }
    let (key, value) = line.split_once(':')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim_start().to_string()))
}

/// Case-insensitive key lookup for client-side header maps, which keep
/// the caller's spelling.
pub(crate) fn contains_key_ci(headers: &HeaderMap, key: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(key))
}
