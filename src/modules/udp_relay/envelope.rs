//! Session envelope parsing.
//!
//! Clients frame every datagram as `<session-id>|<payload>`. Backends echo the
//! session id back in the same position, which is how replies are matched.

use super::config::ForwardMode;
use super::error::{UdpRelayError, UdpRelayResult};

/// Separator between the session id and the payload.
pub const DELIMITER: u8 = b'|';

/// A parsed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Client-chosen session id.
    pub session: &'a str,

    /// Bytes after the first delimiter.
    pub payload: &'a [u8],

    /// The complete datagram.
    pub raw: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Split a datagram at its first delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`UdpRelayError::MalformedEnvelope`] if there is no delimiter
    /// or the session id is empty or not UTF-8.
    pub fn parse(datagram: &'a [u8]) -> UdpRelayResult<Self> {
        let split = datagram
            .iter()
            .position(|&b| b == DELIMITER)
            .ok_or(UdpRelayError::MalformedEnvelope {
                reason: "missing session delimiter",
            })?;

        let session = std::str::from_utf8(&datagram[..split]).map_err(|_| {
            UdpRelayError::MalformedEnvelope {
                reason: "session id is not valid UTF-8",
            }
        })?;
        if session.is_empty() {
            return Err(UdpRelayError::MalformedEnvelope {
                reason: "empty session id",
            });
        }

        Ok(Self {
            session,
            payload: &datagram[split + 1..],
            raw: datagram,
        })
    }

    /// Bytes to send to the backend for the given mode.
    #[must_use]
    pub fn forward_bytes(&self, mode: ForwardMode) -> &'a [u8] {
        match mode {
            ForwardMode::Payload => self.payload,
            ForwardMode::Datagram => self.raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let envelope = Envelope::parse(b"sess1|hello").unwrap();
        assert_eq!(envelope.session, "sess1");
        assert_eq!(envelope.payload, b"hello");
        assert_eq!(envelope.forward_bytes(ForwardMode::Payload), b"hello");
        assert_eq!(envelope.forward_bytes(ForwardMode::Datagram), b"sess1|hello");
    }

    #[test]
    fn test_split_on_first_delimiter() {
        let envelope = Envelope::parse(b"abc|online|server-0").unwrap();
        assert_eq!(envelope.session, "abc");
        assert_eq!(envelope.payload, b"online|server-0");
    }

    #[test]
    fn test_empty_payload_allowed() {
        let envelope = Envelope::parse(b"sess1|").unwrap();
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn test_malformed() {
        assert!(Envelope::parse(b"no delimiter").is_err());
        assert!(Envelope::parse(b"|hello").is_err());
        assert!(Envelope::parse(b"").is_err());
        assert!(Envelope::parse(&[0xff, 0xfe, b'|', b'x']).is_err());
    }
}
