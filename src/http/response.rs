//! HTTP response: server-side composer and client-side parser.

use std::time::Duration;

use log::trace;

use crate::http::{
    body_kind, contains_key_ci, find_crlf, split_header_line, BodyDecoder, HeaderMap, Status, CRLF,
    HEADER_SEP,
};
use crate::net::Io;
use crate::{Error, Result};

const RECV_WANT: usize = Io::BUF_MAX_SIZE;

/// The parsed half of a response, detached from the connection.
#[derive(Debug)]
pub struct ResponseData {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ResponseData {
    /// The body as text.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// An HTTP/1.1 response tied to a connection; the mirror of
/// [`Request`](crate::http::Request).
pub struct Response<'a> {
    io: &'a Io,
    rbuf: Vec<u8>,
    scratch: Vec<u8>,
    version: String,
    status: u16,
    reason: String,
    line_done: bool,
    headers: HeaderMap,
    last_key: Option<String>,
    head_done: bool,
    body: Vec<u8>,
    decoder: Option<BodyDecoder>,
}

impl<'a> Response<'a> {
    pub fn new(io: &'a Io) -> Response<'a> {
        Response {
            io,
            rbuf: Vec::new(),
            scratch: Vec::new(),
            version: String::new(),
            status: 0,
            reason: String::new(),
            line_done: false,
            headers: HeaderMap::new(),
            last_key: None,
            head_done: false,
            body: Vec::new(),
            decoder: None,
        }
    }

    // ===== server side =====

    /// Sets the status line; the protocol is always `HTTP/1.1`.
    pub fn set_status(&mut self, status: Status) -> &mut Self {
        self.version = "HTTP/1.1".to_string();
        self.status = status.code();
        self.reason = status.reason().to_string();
        self.line_done = true;
        self
    }

    pub fn add_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>) -> &mut Self {
        self.body = body;
        self
    }

    /// Sends the composed response. `Content-Length` is appended iff a
    /// body is present.
    pub async fn send(&self, timeout: Duration) -> Result<()> {
        debug_assert!(
            !contains_key_ci(&self.headers, "content-length"),
            "Content-Length is added automatically"
        );
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.version.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(CRLF);
        for (key, value) in &self.headers {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(HEADER_SEP);
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        if self.body.is_empty() {
            buf.extend_from_slice(CRLF);
            self.io.send_link_timeout(&buf, timeout).await
        } else {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(self.body.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n\r\n");
            self.io.send_link_timeout(&buf, timeout).await?;
            self.io.send_link_timeout(&self.body, timeout).await
        }
    }

    // ===== client side =====

    /// Parses the status line and headers. `Ok(false)` on disconnect
    /// or timeout before a complete head.
    pub async fn parse(&mut self, timeout: Duration) -> Result<bool> {
        loop {
            let want = self.parse_head_step()?;
            if want == 0 {
                if self.decoder.is_none() {
                    self.decoder = Some(BodyDecoder::new(body_kind(&self.headers)?));
                }
                trace!("response head complete; status={}", self.status);
                return Ok(true);
            }
            self.scratch.resize(want.min(RECV_WANT), 0);
            match self.io.recv_link_timeout(&mut self.scratch, timeout).await? {
                None | Some(0) => return Ok(false),
                Some(n) => self.rbuf.extend_from_slice(&self.scratch[..n]),
            }
        }
    }

    fn parse_head_step(&mut self) -> Result<usize> {
        if !self.line_done {
            let pos = match find_crlf(&self.rbuf) {
                Some(pos) => pos,
                None => return Ok(RECV_WANT),
            };
            {
                let line = std::str::from_utf8(&self.rbuf[..pos])
                    .map_err(|_| Error::Protocol("malformed status line"))?;
                let mut parts = line.splitn(3, ' ');
                let version = parts.next().unwrap_or("");
                let status = parts.next().unwrap_or("");
                let reason = parts.next().unwrap_or("");
                if version.is_empty() || status.is_empty() {
                    return Err(Error::Protocol("malformed status line"));
                }
                self.version = version.to_string();
                self.status = status
                    .parse()
                    .map_err(|_| Error::Protocol("malformed status code"))?;
                self.reason = reason.to_string();
            }
            self.rbuf.drain(..pos + 2);
            self.line_done = true;
        }
        while !self.head_done {
            let pos = match find_crlf(&self.rbuf) {
                Some(pos) => pos,
                None => return Ok(RECV_WANT),
            };
            if pos == 0 {
                self.rbuf.drain(..2);
                self.head_done = true;
                break;
            }
            match split_header_line(&self.rbuf[..pos]) {
                Some((key, value)) => {
                    self.last_key = Some(key.clone());
                    self.headers.insert(key, value);
                }
                None => {
                    let key = self
                        .last_key
                        .as_ref()
                        .ok_or(Error::Protocol("header continuation without a header"))?;
                    let tail = std::str::from_utf8(&self.rbuf[..pos])
                        .map_err(|_| Error::Protocol("malformed header line"))?;
                    self.headers
                        .get_mut(key)
                        .expect("last_key tracks an inserted header")
                        .push_str(tail);
                }
            }
            self.rbuf.drain(..pos + 2);
        }
        Ok(0)
    }

    /// Reads the body and detaches the response from the connection.
    pub async fn into_data(mut self, timeout: Duration) -> Result<ResponseData> {
        loop {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or(Error::Protocol("body requested before the head"))?;
            let want = decoder.step(&mut self.rbuf, &mut self.body)?;
            if want == 0 {
                break;
            }
            self.scratch.resize(want.min(RECV_WANT), 0);
            match self.io.recv_link_timeout(&mut self.scratch, timeout).await? {
                None => return Err(Error::Timeout),
                Some(0) => return Err(Error::PeerClosed),
                Some(n) => self.rbuf.extend_from_slice(&self.scratch[..n]),
            }
        }
        Ok(ResponseData {
            status: self.status,
            reason: self.reason,
            headers: self.headers,
            body: self.body,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use crate::EventLoop;

    fn leaked_io() -> &'static Io {
        let ev = EventLoop::new().unwrap();
        Box::leak(Box::new(Io::new(sys::INVALID_SOCKET, ev.handle())))
    }

    #[test]
    fn parses_status_line() {
        let mut res = Response::new(leaked_io());
        res.rbuf
            .extend_from_slice(b"HTTP/1.1 404 Not Found\r\nServer: x\r\n\r\n");
        assert_eq!(res.parse_head_step().unwrap(), 0);
        assert_eq!(res.status(), 404);
        assert_eq!(res.reason, "Not Found");
        assert_eq!(res.headers().get("server").unwrap(), "x");
    }

    #[test]
    fn reason_may_contain_spaces_or_be_absent() {
        let mut res = Response::new(leaked_io());
        res.rbuf
            .extend_from_slice(b"HTTP/1.1 500 Internal Server Error\r\n\r\n");
        assert_eq!(res.parse_head_step().unwrap(), 0);
        assert_eq!(res.reason, "Internal Server Error");

        let mut res = Response::new(leaked_io());
        res.rbuf.extend_from_slice(b"HTTP/1.1 200\r\n\r\n");
        assert_eq!(res.parse_head_step().unwrap(), 0);
        assert_eq!(res.reason, "");
    }
}
