//! SOCKS5 client handshake (RFC 1928 / 1929).
//!
//! Only what an outbound HTTP client needs: method negotiation with
//! no-auth (0x00) or username/password (0x02), an optional USER/PASS
//! sub-negotiation, and a CONNECT request with the domain (0x03)
//! address type. The server's REP byte is surfaced verbatim in the
//! error message on failure.

use log::debug;

use crate::http::Url;
use crate::net::Io;
use crate::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub struct Socks5Proxy<'a> {
    io: &'a Io,
}

impl<'a> Socks5Proxy<'a> {
    pub fn new(io: &'a Io) -> Socks5Proxy<'a> {
        Socks5Proxy { io }
    }

    /// Runs the whole proxy handshake so that the connection tunnels
    /// to `target` afterwards. `proxy` carries the optional
    /// credentials in its userinfo.
    pub(crate) async fn connect(&self, proxy: &Url, target: &Url) -> Result<()> {
        let auth = proxy.user.as_ref().filter(|(account, _)| !account.is_empty());
        self.handshake(auth.is_some()).await?;
        if let Some((account, password)) = auth {
            self.sub_negotiation(account, password).await?;
        }
        self.connect_request(target).await
    }

    async fn handshake(&self, authentication: bool) -> Result<()> {
        let method = if authentication {
            METHOD_USER_PASS
        } else {
            METHOD_NONE
        };
        self.io.fully_send(&[SOCKS_VERSION, 1, method]).await?;

        let reply: [u8; 2] = self.io.recv_array().await?;
        if reply[0] != SOCKS_VERSION || reply[1] != method {
            debug!("socks5 method rejected; method={:#04x}", reply[1]);
            return Err(Error::Protocol("socks5: no acceptable method"));
        }
        Ok(())
    }

    async fn sub_negotiation(&self, account: &str, password: &str) -> Result<()> {
        if account.len() > 255 || password.len() > 255 {
            return Err(Error::Protocol("socks5: credentials too long"));
        }
        let mut request = Vec::with_capacity(3 + account.len() + password.len());
        request.push(0x01); // sub-negotiation version
        request.push(account.len() as u8);
        request.extend_from_slice(account.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        self.io.fully_send(&request).await?;

        let reply: [u8; 2] = self.io.recv_array().await?;
        if reply[1] != 0x00 {
            return Err(Error::Protocol("socks5: authentication rejected"));
        }
        Ok(())
    }

    async fn connect_request(&self, target: &Url) -> Result<()> {
        if target.host.len() > 255 {
            return Err(Error::Protocol("socks5: hostname too long"));
        }
        let mut request = Vec::with_capacity(7 + target.host.len());
        request.push(SOCKS_VERSION);
        request.push(CMD_CONNECT);
        request.push(0x00); // reserved
        request.push(ATYP_DOMAIN);
        request.push(target.host.len() as u8);
        request.extend_from_slice(target.host.as_bytes());
        request.extend_from_slice(&target.port.to_be_bytes());
        self.io.fully_send(&request).await?;

        let head: [u8; 4] = self.io.recv_array().await?;
        if head[0] != SOCKS_VERSION {
            return Err(Error::Protocol("socks5: bad reply version"));
        }
        if head[1] != 0x00 {
            return Err(reply_error(head[1]));
        }
        // Drain the bound address so the tunnel starts clean.
        match head[3] {
            ATYP_IPV4 => {
                let _: [u8; 6] = self.io.recv_array().await?;
            }
            ATYP_IPV6 => {
                let _: [u8; 18] = self.io.recv_array().await?;
            }
            ATYP_DOMAIN => {
                let len: [u8; 1] = self.io.recv_array().await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                self.io.fully_recv(&mut rest).await?;
            }
            _ => return Err(Error::Protocol("socks5: bad address type in reply")),
        }
        debug!("socks5 tunnel established to {}:{}", target.host, target.port);
        Ok(())
    }
}

fn reply_error(rep: u8) -> Error {
    Error::Protocol(match rep {
        0x01 => "socks5: general server failure",
        0x02 => "socks5: connection not allowed by ruleset",
        0x03 => "socks5: network unreachable",
        0x04 => "socks5: host unreachable",
        0x05 => "socks5: connection refused",
        0x06 => "socks5: TTL expired",
        0x07 => "socks5: command not supported",
        0x08 => "socks5: address type not supported",
        _ => "socks5: request rejected",
    })
}
