//! BEAST binary and AVR ASCII wire formats
//!
//! BEAST framing: 0x1A, a type byte ('1' Mode A/C, '2' short Mode S,
//! '3' long Mode S), a 6-byte big-endian timestamp, one signal byte, then
//! the payload. Any literal 0x1A inside timestamp, signal or payload is
//! escaped by doubling.
//!
//! AVR framing: one message per line, `*HEX;` or `@TTTTTTTTTTTTHEX;` with a
//! 12-hex-digit timestamp prefix in MLAT mode.

use bytes::{Buf, BytesMut};

pub const BEAST_ESCAPE: u8 = 0x1A;

/// A frame received from a network input, routed into the decoder thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// 12 MHz counter from the sender, zero when the format carries none.
    pub timestamp: u64,
    pub signal: u8,
    /// 2 (Mode A/C), 7 or 14 bytes.
    pub data: Vec<u8>,
    pub mode_ac: bool,
}

fn payload_len(type_byte: u8) -> Option<usize> {
    match type_byte {
        b'1' => Some(2),
        b'2' => Some(7),
        b'3' => Some(14),
        _ => None,
    }
}

/// Incremental BEAST stream reassembler. Feed bytes in, take frames out.
#[derive(Default)]
pub struct BeastParser {
    buf: BytesMut,
}

impl BeastParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, discarding garbage between frames.
    /// Returns None when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<InboundFrame> {
        loop {
            // Sync to a frame start
            match self.buf.iter().position(|&b| b == BEAST_ESCAPE) {
                Some(0) => {}
                Some(n) => self.buf.advance(n),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            let Some(len) = payload_len(self.buf[1]) else {
                // Not a frame start (could be the tail of an escape pair)
                self.buf.advance(1);
                continue;
            };

            // Un-escape 6 timestamp bytes + 1 signal byte + payload
            let mut fields = Vec::with_capacity(7 + len);
            let mut pos = 2;
            while fields.len() < 7 + len {
                if pos >= self.buf.len() {
                    return None; // incomplete
                }
                let b = self.buf[pos];
                if b == BEAST_ESCAPE {
                    if pos + 1 >= self.buf.len() {
                        return None;
                    }
                    if self.buf[pos + 1] == BEAST_ESCAPE {
                        fields.push(BEAST_ESCAPE);
                        pos += 2;
                        continue;
                    }
                    // Unescaped 0x1A: resync on it as a new frame start
                    self.buf.advance(pos);
                    fields.clear();
                    break;
                }
                fields.push(b);
                pos += 1;
            }
            if fields.len() < 7 + len {
                continue;
            }

            self.buf.advance(pos);

            let mut timestamp = 0u64;
            for &b in &fields[..6] {
                timestamp = timestamp << 8 | b as u64;
            }
            return Some(InboundFrame {
                timestamp,
                signal: fields[6],
                data: fields[7..].to_vec(),
                mode_ac: len == 2,
            });
        }
    }
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    out.push(byte);
    if byte == BEAST_ESCAPE {
        out.push(BEAST_ESCAPE);
    }
}

/// Encode one message in BEAST framing.
pub fn encode_beast(payload: &[u8], timestamp: u64, signal: u8) -> Vec<u8> {
    let type_byte = match payload.len() {
        2 => b'1',
        7 => b'2',
        _ => b'3',
    };
    let mut out = Vec::with_capacity(2 + (7 + payload.len()) * 2);
    out.push(BEAST_ESCAPE);
    out.push(type_byte);
    for shift in (0..6).rev() {
        push_escaped(&mut out, (timestamp >> (shift * 8)) as u8);
    }
    push_escaped(&mut out, signal);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    out
}

/// `*HEX;` raw ASCII line.
pub fn format_avr(payload: &[u8]) -> String {
    let mut s = String::with_capacity(payload.len() * 2 + 2);
    s.push('*');
    for b in payload {
        s.push_str(&format!("{b:02X}"));
    }
    s.push(';');
    s
}

/// `@TTTTTTTTTTTTHEX;` MLAT-mode line with the 48-bit sample timestamp.
pub fn format_avr_mlat(payload: &[u8], timestamp: u64) -> String {
    let mut s = String::with_capacity(payload.len() * 2 + 14);
    s.push('@');
    s.push_str(&format!("{:012X}", timestamp & 0xFFFF_FFFF_FFFF));
    for b in payload {
        s.push_str(&format!("{b:02X}"));
    }
    s.push(';');
    s
}

/// Parse an AVR line in either form. Returns the payload bytes and the
/// timestamp when the line carried one.
pub fn parse_avr(line: &str) -> Option<(Vec<u8>, Option<u64>)> {
    let line = line.trim();
    let body = line.strip_suffix(';')?;

    let (hex, timestamp) = if let Some(body) = body.strip_prefix('*') {
        (body, None)
    } else if let Some(body) = body.strip_prefix('@') {
        if body.len() < 12 {
            return None;
        }
        let ts = u64::from_str_radix(&body[..12], 16).ok()?;
        (&body[12..], Some(ts))
    } else {
        return None;
    };

    if hex.is_empty() || hex.len() % 2 != 0 || hex.len() > 28 {
        return None;
    }
    let mut data = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        data.push(u8::from_str_radix(&hex[i..i + 2], 16).ok()?);
    }
    Some((data, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    #[test]
    fn test_beast_round_trip() {
        let payload = hex!("8D4840D6202CC371C32CE0576098");
        let encoded = encode_beast(&payload, 0x123456789ABC, 200);

        let mut parser = BeastParser::new();
        parser.push(&encoded);
        let frame = parser.next_frame().expect("one frame");
        assert_eq!(frame.timestamp, 0x123456789ABC);
        assert_eq!(frame.signal, 200);
        assert_eq!(frame.data, payload.to_vec());
        assert!(!frame.mode_ac);
        assert!(parser.next_frame().is_none());
    }

    #[test]
    fn test_beast_escaping() {
        // 0x1A bytes in timestamp, signal and payload all get doubled
        let payload = [0x1A, 0x1A, 0x40, 0xD6, 0x1A, 0x2C, 0xC3];
        let encoded = encode_beast(&payload, 0x1A1A_1A1A_1A1A, 0x1A);
        // type '2' for 7 bytes, every 0x1A doubled: 2 + 12 + 2 + 10
        assert_eq!(encoded[1], b'2');

        let mut parser = BeastParser::new();
        parser.push(&encoded);
        let frame = parser.next_frame().expect("frame survives escaping");
        assert_eq!(frame.timestamp, 0x1A1A_1A1A_1A1A);
        assert_eq!(frame.signal, 0x1A);
        assert_eq!(frame.data, payload.to_vec());
    }

    #[test]
    fn test_beast_incremental_and_resync() {
        let payload = hex!("5D4840D6B98080");
        let encoded = encode_beast(&payload, 42, 7);

        let mut parser = BeastParser::new();
        // Garbage, then the frame split across pushes
        parser.push(&[0x00, 0xFF, 0x33]);
        parser.push(&encoded[..5]);
        assert!(parser.next_frame().is_none());
        parser.push(&encoded[5..]);
        let frame = parser.next_frame().expect("frame after resync");
        assert_eq!(frame.data, payload.to_vec());
        assert_eq!(frame.timestamp, 42);
    }

    #[test]
    fn test_beast_mode_ac() {
        let encoded = encode_beast(&[0x21, 0x43], 1, 2);
        assert_eq!(encoded[1], b'1');
        let mut parser = BeastParser::new();
        parser.push(&encoded);
        let frame = parser.next_frame().unwrap();
        assert!(frame.mode_ac);
        assert_eq!(frame.data, vec![0x21, 0x43]);
    }

    #[test]
    fn test_avr_round_trip() {
        let payload = hex!("8D4840D6202CC371C32CE0576098");
        let line = format_avr(&payload);
        assert_eq!(line, "*8D4840D6202CC371C32CE0576098;");
        let (data, ts) = parse_avr(&line).unwrap();
        assert_eq!(data, payload.to_vec());
        assert_eq!(ts, None);
    }

    #[test]
    fn test_avr_mlat_round_trip() {
        let payload = hex!("5D4840D6B98080");
        let line = format_avr_mlat(&payload, 0x0000DEADBEEF);
        assert_eq!(line, "@0000DEADBEEF5D4840D6B98080;");
        let (data, ts) = parse_avr(&line).unwrap();
        assert_eq!(data, payload.to_vec());
        assert_eq!(ts, Some(0xDEADBEEF));
    }

    #[test]
    fn test_avr_rejects_malformed() {
        assert!(parse_avr("8D4840D6").is_none());
        assert!(parse_avr("*8D4840D6").is_none()); // no terminator
        assert!(parse_avr("*8D4840D;").is_none()); // odd digits
        assert!(parse_avr("@123;").is_none()); // truncated timestamp
        assert!(parse_avr("*;").is_none());
    }
}
