//! Echo reply construction.
//!
//! The wire protocol is a raw TCP byte stream with no framing: each
//! receive completion's bytes are one logical client message, and the
//! reply is those bytes with the literal ASCII prefix `Server:`
//! prepended. No trailing delimiter is added.
//!
//! Messages longer than the receive buffer capacity are truncated to
//! that capacity before being echoed; there is no reassembly across
//! receives.

/// Prefix prepended to every echoed message.
pub const REPLY_PREFIX: &[u8] = b"Server:";

/// Buffer capacity needed to hold a reply for a `message_capacity`-byte
/// receive.
pub fn reply_capacity(message_capacity: usize) -> usize {
    REPLY_PREFIX.len() + message_capacity
}

/// Build an echo reply into `out`, returning the reply length.
///
/// The payload is truncated if `out` cannot hold prefix plus payload.
pub fn build_reply(payload: &[u8], out: &mut [u8]) -> usize {
    debug_assert!(out.len() >= REPLY_PREFIX.len());

    let max_payload = out.len() - REPLY_PREFIX.len();
    let n = payload.len().min(max_payload);

    out[..REPLY_PREFIX.len()].copy_from_slice(REPLY_PREFIX);
    out[REPLY_PREFIX.len()..REPLY_PREFIX.len() + n].copy_from_slice(&payload[..n]);

    REPLY_PREFIX.len() + n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_prefixes_payload() {
        let mut out = [0u8; 64];
        let len = build_reply(b"hello", &mut out);
        assert_eq!(&out[..len], b"Server:hello");
    }

    #[test]
    fn test_reply_empty_payload() {
        let mut out = [0u8; 16];
        let len = build_reply(b"", &mut out);
        assert_eq!(&out[..len], b"Server:");
    }

    #[test]
    fn test_reply_binary_payload() {
        let mut out = [0u8; 32];
        let payload = [0x00, 0xFF, 0x7F, 0x0A];
        let len = build_reply(&payload, &mut out);
        assert_eq!(&out[..REPLY_PREFIX.len()], b"Server:");
        assert_eq!(&out[REPLY_PREFIX.len()..len], &payload);
    }

    #[test]
    fn test_reply_truncates_to_capacity() {
        // Reply buffer sized for an 8-byte message capacity
        let mut out = vec![0u8; reply_capacity(8)];
        let len = build_reply(b"0123456789abcdef", &mut out);
        assert_eq!(&out[..len], b"Server:01234567");
    }

    #[test]
    fn test_full_capacity_message_fits() {
        let capacity = 1024;
        let mut out = vec![0u8; reply_capacity(capacity)];
        let payload = vec![b'x'; capacity];
        let len = build_reply(&payload, &mut out);
        assert_eq!(len, REPLY_PREFIX.len() + capacity);
        assert_eq!(&out[len - 4..len], b"xxxx");
    }
}
