use std::io;

/// A specialized result type for coio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the runtime and the protocol engines.
///
/// Kernel failures keep the errno-style detail of the completion that
/// produced them. A timed-out linked operation is reported as [`Timeout`]
/// and carries no payload; the peer half of the pair is presumed
/// cancelled. Malformed HTTP or WebSocket input is fatal for the
/// connection and reported as [`Protocol`].
///
/// [`Timeout`]: Error::Timeout
/// [`Protocol`]: Error::Protocol
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission completed with a negative result that is not the
    /// cancellation sentinel.
    #[error("kernel failure: {0}")]
    Kernel(#[from] io::Error),

    /// The timer half of a linked timeout fired first.
    #[error("operation timed out")]
    Timeout,

    /// The parser saw input that violates the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The peer closed the connection (a read of zero bytes).
    ///
    /// Surfaced as its own variant so keep-alive loops can unwind
    /// without logging an error.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The WebSocket peer completed the close handshake.
    #[error("connection closed ok: {0}")]
    WsClosed(u16),
}

impl Error {
    /// Converts an errno-style completion result into the number of
    /// bytes (or the fd) it carries.
    pub fn check(res: i64) -> Result<u64> {
        if res < 0 {
            Err(Error::Kernel(io::Error::from_raw_os_error(-res as i32)))
        } else {
            Ok(res as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_negative_results_to_errno() {
        let err = Error::check(-9).unwrap_err();
        match err {
            Error::Kernel(io) => assert_eq!(io.raw_os_error(), Some(9)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(Error::check(42).unwrap(), 42);
    }
}
