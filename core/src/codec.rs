//! Stateless byte/text conversions used to render and fingerprint traffic.

use crate::error::{AvError, AvResult};
use serde::{Deserialize, Serialize};

/// Telnet "interpret as command" lead byte.
const IAC: u8 = 0xFF;

/// Line termination convention observed in a payload or assumed for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LineEnding {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "CR")]
    Cr,
    #[serde(rename = "LF")]
    Lf,
    #[serde(rename = "CRLF")]
    CrLf,
}

impl LineEnding {
    /// The bytes appended to a command using this convention.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }

    /// Backslash-escaped form shown to operators, e.g. `\r\n`.
    pub fn escaped(self) -> &'static str {
        match self {
            LineEnding::None => "",
            LineEnding::Cr => "\\r",
            LineEnding::Lf => "\\n",
            LineEnding::CrLf => "\\r\\n",
        }
    }

    /// Inverse of [`LineEnding::escaped`]; anything unrecognised is `None`.
    pub fn from_escaped(s: &str) -> Option<Self> {
        match s {
            "" => Some(LineEnding::None),
            "\\r" => Some(LineEnding::Cr),
            "\\n" => Some(LineEnding::Lf),
            "\\r\\n" => Some(LineEnding::CrLf),
            _ => None,
        }
    }

    /// Serde helper for payloads that carry the escaped form as a string.
    pub fn serialize_escaped<S: serde::Serializer>(le: &LineEnding, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(le.escaped())
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

fn is_text_control(b: u8) -> bool {
    b == b'\r' || b == b'\n' || b == b'\t'
}

/// Space-separated uppercase hex pairs: `[0x0D, 0xAB]` -> `"0D AB"`.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&hex::encode_upper([*b]));
    }
    out
}

/// Byte-for-byte rendering with anything outside 0x20..=0x7E shown as `.`.
pub fn to_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if is_printable(b) { b as char } else { '.' })
        .collect()
}

/// Number of printable-or-CR/LF/TAB bytes.
pub fn text_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| is_printable(b) || is_text_control(b)).count()
}

/// Share of printable-or-CR/LF/TAB bytes; 0.0 for an empty payload.
pub fn text_ratio(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 0.0;
    }
    text_count(bytes) as f32 / bytes.len() as f32
}

/// Human-readable text from a telnet-style banner.
///
/// Drops every `IAC opt opt` negotiation triple (a trailing IAC without two
/// following bytes is dropped alone) and keeps printable bytes plus CR/LF/TAB.
pub fn strip_control_protocol(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == IAC {
            i += if i + 2 < bytes.len() { 3 } else { 1 };
            continue;
        }
        if is_printable(b) || is_text_control(b) {
            out.push(b as char);
        }
        i += 1;
    }
    out
}

/// Infer the line ending of a payload.
///
/// An adjacent CR LF pair anywhere wins. CR and LF both present but never
/// adjacent still reports CRLF.
pub fn classify_line_ending(bytes: &[u8]) -> LineEnding {
    if bytes.windows(2).any(|w| w == b"\r\n") {
        return LineEnding::CrLf;
    }
    let has_cr = bytes.contains(&b'\r');
    let has_lf = bytes.contains(&b'\n');
    match (has_cr, has_lf) {
        (true, false) => LineEnding::Cr,
        (false, true) => LineEnding::Lf,
        (true, true) => LineEnding::CrLf,
        (false, false) => LineEnding::None,
    }
}

/// 32-bit FNV-1a over the UTF-8 bytes, as 8 uppercase hex digits.
///
/// Dedup only. Not collision resistant.
pub fn hash(s: &str) -> String {
    let mut h: u32 = 0x811C_9DC5;
    for &b in s.as_bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    format!("{:08X}", h)
}

/// Random 8-hex-digit identifier. Best-effort uniqueness.
pub fn new_id() -> String {
    format!("{:08X}", rand::random::<u32>())
}

/// Parse whitespace-separated hex byte pairs such as `"0D 0a FF"`.
///
/// Every token must be exactly two hex digits. Blank input is an empty payload.
pub fn parse_hex_pairs(s: &str) -> AvResult<Vec<u8>> {
    let mut out = Vec::new();
    for tok in s.split_whitespace() {
        if tok.len() != 2 {
            return Err(AvError::invalid(format!("bad hex token: {:?}", tok)));
        }
        let byte = hex::decode(tok).map_err(|_| AvError::invalid(format!("bad hex token: {:?}", tok)))?;
        out.extend_from_slice(&byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formatting() {
        assert_eq!(to_hex(&[]), "");
        assert_eq!(to_hex(&[0x0D]), "0D");
        assert_eq!(to_hex(&[0x01, 0xAB, 0xff]), "01 AB FF");
    }

    #[test]
    fn hex_round_trip_every_byte() {
        let all: Vec<u8> = (0..=255u8).collect();
        assert_eq!(parse_hex_pairs(&to_hex(&all)).unwrap(), all);
        assert_eq!(parse_hex_pairs(&to_hex(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn hex_parse_rejects_malformed_tokens() {
        assert!(parse_hex_pairs("0").is_err());
        assert!(parse_hex_pairs("ABC").is_err());
        assert!(parse_hex_pairs("GG").is_err());
        assert!(parse_hex_pairs("01 2").is_err());
        assert_eq!(parse_hex_pairs("  0a\t0B \n").unwrap(), vec![0x0A, 0x0B]);
    }

    #[test]
    fn ascii_is_length_preserving() {
        let samples: [&[u8]; 4] = [b"", b"PWR ON\r\n", &[0x00, 0xFF, 0x7F, 0x20], &[0xAA; 33]];
        for s in samples {
            assert_eq!(to_ascii(s).len(), s.len());
        }
        assert_eq!(to_ascii(b"A\r\x00~"), "A..~");
    }

    #[test]
    fn strips_telnet_negotiation() {
        let raw = [0xFF, 0xFB, 0x01, b'H', b'i', 0x00, b'\r', b'\n', 0xFF, 0xFD];
        // the trailing IAC has only one byte after it, so only the IAC goes
        assert_eq!(strip_control_protocol(&raw), "Hi\r\n");
        assert_eq!(strip_control_protocol(b"\tok\x07"), "\tok");
    }

    #[test]
    fn line_endings() {
        assert_eq!(classify_line_ending(b"abc"), LineEnding::None);
        assert_eq!(classify_line_ending(b"abc\r"), LineEnding::Cr);
        assert_eq!(classify_line_ending(b"abc\n"), LineEnding::Lf);
        assert_eq!(classify_line_ending(b"a\rb\r\n"), LineEnding::CrLf);
        assert_eq!(classify_line_ending(b"a\nb\r"), LineEnding::CrLf);
    }

    #[test]
    fn escaped_forms_round_trip() {
        for le in [LineEnding::None, LineEnding::Cr, LineEnding::Lf, LineEnding::CrLf] {
            assert_eq!(LineEnding::from_escaped(le.escaped()), Some(le));
        }
        assert_eq!(LineEnding::from_escaped("x"), None);
    }

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(hash(""), "811C9DC5");
        assert_eq!(hash("a"), "E40C292C");
        assert_eq!(hash("x").len(), 8);
    }

    #[test]
    fn ids_are_eight_hex_digits() {
        let id = new_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn text_ratio_counts_controls_as_text() {
        assert_eq!(text_ratio(b""), 0.0);
        assert_eq!(text_ratio(b"ab\r\n"), 1.0);
        assert!(text_ratio(&[0x00, 0x01, b'a']) < 0.85);
        assert_eq!(text_count(&[0x00, b'\t', b'a', 0xFF]), 2);
    }
}
