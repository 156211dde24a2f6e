//! WebSocket engine: RFC 6455 framing over an [`Io`].
//!
//! Client frames are masked with a per-frame random key; server frames
//! are not, and a frame whose mask flag violates the sender's role is
//! a protocol error. Control frames must fit in the 7-bit length and
//! may not be fragmented. Fragmented data frames carry the data opcode
//! on the first fragment only, `Cont` afterwards, and are concatenated
//! until FIN.
//!
//! [`Io`]: crate::net::Io

use std::time::Duration;

use log::{debug, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::net::Io;
use crate::{Error, Result};

mod handshake;

pub use self::handshake::WebSocketFactory;

/// Frame opcodes defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Cont,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_wire(bits: u8) -> Result<OpCode> {
        match bits {
            0 => Ok(OpCode::Cont),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            _ => Err(Error::Protocol("unknown opcode")),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            OpCode::Cont => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One logical message: a frame, or a fragmented sequence already
/// reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// A pre-encoded server frame for broadcast: the header is computed
/// once and reused for every connection the payload goes to.
#[derive(Debug, Clone)]
pub struct PacketView<'p> {
    head: Vec<u8>,
    payload: &'p [u8],
}

/// Builds a reusable broadcast frame. Server-side only: the header
/// carries no mask.
pub fn packet_view(opcode: OpCode, payload: &[u8]) -> PacketView<'_> {
    PacketView {
        head: encode_head(opcode, payload.len() as u64, None),
        payload,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Ping round-trip budget, also used by the close handshake.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a read may sit idle before the engine probes with a ping.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// One endpoint of an established WebSocket connection.
///
/// Only one task may use a `WebSocket` at a time; the methods take
/// `&mut self` accordingly (the client's mask source lives inside).
pub struct WebSocket<'a> {
    io: &'a Io,
    role: Role,
    rng: Option<SmallRng>,
}

impl<'a> WebSocket<'a> {
    pub(crate) fn server(io: &'a Io) -> WebSocket<'a> {
        WebSocket {
            io,
            role: Role::Server,
            rng: None,
        }
    }

    pub(crate) fn client(io: &'a Io) -> WebSocket<'a> {
        WebSocket {
            io,
            role: Role::Client,
            rng: Some(SmallRng::from_os_rng()),
        }
    }

    pub fn io(&self) -> &'a Io {
        self.io
    }

    /// Receives a text message.
    pub async fn recv_text(&mut self) -> Result<String> {
        let packet = self.recv(OpCode::Text).await?;
        String::from_utf8(packet.payload).map_err(|_| Error::Protocol("text frame is not UTF-8"))
    }

    /// Receives a binary message.
    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.recv(OpCode::Binary).await?.payload)
    }

    /// Receives the next message of the wanted kind with the default
    /// read timeout.
    pub async fn recv(&mut self, want: OpCode) -> Result<Packet> {
        self.recv_timeout(want, DEFAULT_READ_TIMEOUT).await
    }

    /// Receives the next message of the wanted kind.
    ///
    /// Pings are answered transparently. A peer close is answered and
    /// surfaced as [`Error::WsClosed`] with code 1000. When the read
    /// timeout expires the engine sends a ping and waits once more for
    /// the pong; only a silent peer raises [`Error::Timeout`]. A user
    /// frame that races the pong is returned as the result, with the
    /// still-pending pong consumed before returning.
    pub async fn recv_timeout(&mut self, want: OpCode, timeout: Duration) -> Result<Packet> {
        loop {
            match self.recv_packet(timeout).await? {
                Some(packet) => {
                    if let Some(packet) = self.triage(packet, want).await? {
                        return Ok(packet);
                    }
                }
                None => {
                    trace!("read timed out; probing with a ping");
                    self.ping(&[]).await?;
                    loop {
                        match self.recv_packet(DEFAULT_PING_TIMEOUT).await? {
                            None => return Err(Error::Timeout),
                            Some(packet) if packet.opcode == OpCode::Pong => break,
                            Some(packet) => {
                                if let Some(packet) = self.triage(packet, want).await? {
                                    // The user frame won the race; the
                                    // pong is still in flight.
                                    match self.recv_packet(DEFAULT_PING_TIMEOUT).await? {
                                        Some(pong) if pong.opcode == OpCode::Pong => {}
                                        None => return Err(Error::Timeout),
                                        Some(_) => {
                                            return Err(Error::Protocol("expected a pong"))
                                        }
                                    }
                                    return Ok(packet);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handles the frames `recv` absorbs on the caller's behalf.
    async fn triage(&mut self, packet: Packet, want: OpCode) -> Result<Option<Packet>> {
        if packet.opcode == want {
            return Ok(Some(packet));
        }
        match packet.opcode {
            OpCode::Ping => {
                self.send(OpCode::Pong, &packet.payload).await?;
                Ok(None)
            }
            OpCode::Close => {
                self.send(OpCode::Close, &packet.payload).await?;
                debug!("peer initiated close");
                Err(Error::WsClosed(1000))
            }
            // A pong from an earlier probe; stale, swallow it.
            OpCode::Pong => Ok(None),
            _ => Err(Error::Protocol("unexpected frame type")),
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(OpCode::Binary, bytes).await
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send(OpCode::Ping, payload).await
    }

    /// Sends one unfragmented frame.
    pub async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        match self.role {
            Role::Server => {
                let head = encode_head(opcode, payload.len() as u64, None);
                self.io.fully_send(&head).await?;
                self.io.fully_send(payload).await
            }
            Role::Client => {
                let key = self
                    .rng
                    .as_mut()
                    .expect("client endpoints own a mask source")
                    .random::<u32>()
                    .to_le_bytes();
                let head = encode_head(opcode, payload.len() as u64, Some(key));
                let mut masked = payload.to_vec();
                apply_mask(&mut masked, key);
                self.io.fully_send(&head).await?;
                self.io.fully_send(&masked).await
            }
        }
    }

    /// Writes a pre-encoded broadcast frame. Server-side only.
    pub async fn send_packet_view(&self, view: &PacketView<'_>) -> Result<()> {
        debug_assert!(
            self.role == Role::Server,
            "packet views are a server-side broadcast optimization"
        );
        self.io.fully_send(&view.head).await?;
        self.io.fully_send(view.payload).await
    }

    /// Active close: send Close, await the peer's Close (softly), and
    /// confirm with a second Close.
    pub async fn close(&mut self) -> Result<()> {
        self.send(OpCode::Close, &[]).await?;
        match self.recv_packet(DEFAULT_PING_TIMEOUT).await {
            Ok(Some(packet)) if packet.opcode == OpCode::Close => {
                // The peer may tear the connection down right after its
                // Close; the handshake is complete either way.
                let _ = self.send(OpCode::Close, &[]).await;
                Ok(())
            }
            // Timeout, an unexpected frame, or a peer that already tore
            // the connection down: treat the close as done.
            Ok(_) | Err(Error::PeerClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads one message, reassembling fragments. `Ok(None)` is a read
    /// timeout on the first header byte pair.
    async fn recv_packet(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        let mut payload = Vec::new();
        let mut first: Option<OpCode> = None;
        loop {
            let mut head = [0u8; 2];
            let n = match self.io.recv_link_timeout(&mut head, timeout).await? {
                None => return Ok(None),
                Some(0) => return Err(Error::PeerClosed),
                Some(n) => n,
            };
            if n < 2 {
                self.io.fully_recv(&mut head[n..]).await?;
            }

            let fin = head[0] & 0x80 != 0;
            if head[0] & 0x70 != 0 {
                return Err(Error::Protocol("non-zero RSV bits"));
            }
            let opcode = OpCode::from_wire(head[0] & 0x0F)?;
            let masked = head[1] & 0x80 != 0;
            if masked != (self.role == Role::Server) {
                return Err(Error::Protocol("mask flag violates role"));
            }
            let len7 = head[1] & 0x7F;

            if opcode.is_control() {
                if !fin {
                    return Err(Error::Protocol("fragmented control frame"));
                }
                if len7 >= 126 {
                    return Err(Error::Protocol("control frame too big"));
                }
            } else if opcode == OpCode::Cont {
                if first.is_none() {
                    return Err(Error::Protocol("continuation without a first fragment"));
                }
            } else if first.is_some() {
                return Err(Error::Protocol("expected a continuation frame"));
            }

            let len = match len7 {
                126 => u64::from(u16::from_be_bytes(self.io.recv_array().await?)),
                127 => u64::from_be_bytes(self.io.recv_array().await?),
                n => u64::from(n),
            };
            let len = usize::try_from(len).map_err(|_| Error::Protocol("frame too large"))?;
            let mask_key = if self.role == Role::Server {
                Some(self.io.recv_array::<4>().await?)
            } else {
                None
            };
            let mut data = vec![0u8; len];
            self.io.fully_recv(&mut data).await?;
            if let Some(key) = mask_key {
                apply_mask(&mut data, key);
            }

            if opcode.is_control() {
                if first.is_none() {
                    return Ok(Some(Packet {
                        opcode,
                        payload: data,
                    }));
                }
                // Control frame interleaved in a fragmented message.
                match opcode {
                    OpCode::Ping => {
                        self.send(OpCode::Pong, &data).await?;
                        continue;
                    }
                    OpCode::Pong => continue,
                    OpCode::Close => {
                        self.send(OpCode::Close, &data).await?;
                        return Err(Error::WsClosed(1000));
                    }
                    _ => unreachable!(),
                }
            }

            if first.is_none() {
                first = Some(opcode);
            }
            payload.extend_from_slice(&data);
            if fin {
                return Ok(Some(Packet {
                    opcode: first.expect("set on the first fragment"),
                    payload,
                }));
            }
        }
    }
}

/// Encodes a FIN frame header with the smallest valid length encoding.
fn encode_head(opcode: OpCode, len: u64, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut head = Vec::with_capacity(2 + 8 + 4);
    head.push(0x80 | opcode.to_wire());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        head.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        head.push(mask_bit | 126);
        head.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        head.push(mask_bit | 127);
        head.extend_from_slice(&len.to_be_bytes());
    }
    if let Some(key) = mask {
        head.extend_from_slice(&key);
    }
    head
}

/// XORs the payload with the masking key, in place. Its own inverse.
pub(crate) fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_round_trips() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let original = b"Hello, masked world".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn length_encodings_pick_smallest_form() {
        // 125 fits in 7 bits.
        let head = encode_head(OpCode::Binary, 125, None);
        assert_eq!(head, vec![0x82, 125]);
        // 126 needs the 16-bit form.
        let head = encode_head(OpCode::Binary, 126, None);
        assert_eq!(head, vec![0x82, 126, 0x00, 0x7E]);
        // 65536 needs the 64-bit form.
        let head = encode_head(OpCode::Binary, 65_536, None);
        assert_eq!(head[..2], [0x82, 127]);
        assert_eq!(head[2..], 65_536u64.to_be_bytes());
    }

    #[test]
    fn client_header_carries_mask_flag_and_key() {
        let head = encode_head(OpCode::Text, 5, Some([1, 2, 3, 4]));
        assert_eq!(head[0], 0x81);
        assert_eq!(head[1], 0x80 | 5);
        assert_eq!(&head[2..], &[1, 2, 3, 4]);
    }

    #[test]
    fn opcode_wire_round_trip() {
        for code in [
            OpCode::Cont,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::from_wire(code.to_wire()).unwrap(), code);
        }
        assert!(OpCode::from_wire(3).is_err());
        assert!(OpCode::from_wire(11).is_err());
    }

    #[test]
    fn packet_view_header_matches_plain_encode() {
        let payload = b"broadcast me";
        let view = packet_view(OpCode::Text, payload);
        assert_eq!(view.head, encode_head(OpCode::Text, payload.len() as u64, None));
        assert_eq!(view.payload, payload);
    }
}
