//! WebSocket opening handshake, both directions.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sha1::{Digest, Sha1};

use crate::http::{Method, Request, Response, Status, Url};
use crate::net::Io;
use crate::ws::WebSocket;
use crate::{Error, Result};

/// The GUID every conforming endpoint concatenates to the key.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Budget for the upgrade exchange itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// `Sec-Websocket-Accept` for a given `Sec-WebSocket-Key`:
/// `base64(sha1(key + GUID))`.
pub(crate) fn secret_hash(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// A fresh 16-byte random key, base64-encoded.
fn random_key() -> String {
    let mut bytes = [0u8; 16];
    SmallRng::from_os_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn header_contains(value: Option<&String>, needle: &str) -> bool {
    value.map_or(false, |v| v.to_ascii_lowercase().contains(needle))
}

/// Builds [`WebSocket`] endpoints out of HTTP connections.
pub struct WebSocketFactory;

impl WebSocketFactory {
    /// Server side: validates the upgrade request and answers
    /// `101 Switching Protocols`.
    ///
    /// A request without `Origin` is answered `403`; a broken upgrade
    /// header is answered `400`; a missing `Connection: Upgrade` is
    /// answered `426`. All three fail the call.
    pub async fn accept<'a>(req: &Request<'a>, res: &mut Response<'a>) -> Result<WebSocket<'a>> {
        let headers = req.headers();
        if !headers.contains_key("origin") {
            // Required by the RFC; refusing without it avoids plain
            // HTTP requests being mistaken for WebSocket traffic.
            res.set_status(Status::Forbidden)
                .send(HANDSHAKE_TIMEOUT)
                .await?;
            return Err(Error::Protocol("upgrade request is missing Origin"));
        }
        if headers.get("upgrade").map(String::as_str) != Some("websocket") {
            res.set_status(Status::BadRequest)
                .send(HANDSHAKE_TIMEOUT)
                .await?;
            return Err(Error::Protocol("not a websocket upgrade"));
        }
        if !header_contains(headers.get("connection"), "upgrade") {
            res.set_status(Status::UpgradeRequired)
                .send(HANDSHAKE_TIMEOUT)
                .await?;
            return Err(Error::Protocol("connection header does not upgrade"));
        }
        let key = headers
            .get("sec-websocket-key")
            .ok_or(Error::Protocol("missing Sec-WebSocket-Key"))?;

        res.set_status(Status::SwitchingProtocols)
            .add_header("Connection", "keep-alive, Upgrade")
            .add_header("Upgrade", "websocket")
            .add_header("Sec-Websocket-Accept", &secret_hash(key))
            .send(HANDSHAKE_TIMEOUT)
            .await?;
        debug!("websocket accepted; path={}", req.path());
        Ok(WebSocket::server(req.io()))
    }

    /// Client side: sends the upgrade for `url` over an established
    /// connection and validates the server's accept hash.
    pub async fn connect<'a>(url: &str, io: &'a Io, timeout: Duration) -> Result<WebSocket<'a>> {
        let url = Url::parse(url)?;
        let key = random_key();

        let mut req = Request::new(io);
        req.set_req_line(Method::Get, &url.path)
            .add_header("Host", &url.host_header())
            .add_header("Origin", &url.origin())
            .add_header("Connection", "Upgrade")
            .add_header("Upgrade", "websocket")
            .add_header("Sec-WebSocket-Key", &key)
            .add_header("Sec-WebSocket-Version", "13");
        req.send(timeout).await?;

        let mut res = Response::new(io);
        if !res.parse(timeout).await? {
            return Err(Error::Timeout);
        }
        let headers = res.headers();
        if !header_contains(headers.get("connection"), "upgrade") {
            return Err(Error::Protocol("server did not upgrade the connection"));
        }
        if headers.get("upgrade").map(String::as_str) != Some("websocket") {
            return Err(Error::Protocol("server upgraded to something else"));
        }
        if headers.get("sec-websocket-accept") != Some(&secret_hash(&key)) {
            return Err(Error::Protocol("accept hash mismatch"));
        }
        debug!("websocket established; path={}", url.path);
        Ok(WebSocket::client(io))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6455_section_1_3_example() {
        assert_eq!(
            secret_hash("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn random_keys_decode_to_16_bytes() {
        let key = random_key();
        let decoded = BASE64.decode(key.as_bytes()).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(random_key(), random_key());
    }
}
