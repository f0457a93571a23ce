//! File transfer codec: bytes to REPL statements and printed hex back to bytes.
//!
//! Writes send one statement per chunk, either `w('<hex>')` or
//! `o(b'<literal>')`, whichever is shorter on the wire. Reads print the file
//! as a single run of lowercase hex digits.

use std::fmt::Write as _;

use crate::{ParseError, Result};

/// Wire form chosen for one write chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChunkEncoding {
    /// `w('<hex>')`, decoded by the device-side `w` helper.
    Hex,
    /// `o(b'...')`, handed straight to the file's `write`.
    Literal,
}

/// Hex-encodes `data` with lowercase digits and no separators.
pub fn hexlify(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Renders `data` as a Python bytes literal (`b'...'`).
///
/// Printable ASCII is kept verbatim with `\` and `'` backslash-escaped;
/// every other byte becomes `\xHH`.
pub fn literal_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &byte in data {
        match byte {
            b'\\' | b'\'' => {
                out.push('\\');
                out.push(char::from(byte));
            }
            0x20..=0x7e => out.push(char::from(byte)),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push('\'');
    out
}

/// Builds the statement for one chunk, picking the shorter encoding.
///
/// Ties go to the literal form.
pub fn encode_chunk(chunk: &[u8]) -> (ChunkEncoding, String) {
    let hex = format!("w('{}')", hexlify(chunk));
    let literal = format!("o({})", literal_bytes(chunk));
    if hex.len() < literal.len() {
        (ChunkEncoding::Hex, hex)
    } else {
        (ChunkEncoding::Literal, literal)
    }
}

/// Decodes the hex text printed by the read script.
///
/// Surrounding whitespace is ignored; anything else that is not a pair of
/// hex digits is an error.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits = text.trim().as_bytes();
    if digits.len() % 2 != 0 {
        return Err(ParseError::OddHexLength(digits.len()));
    }
    digits
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(ParseError::InvalidHex(i * 2)),
        })
        .collect()
}

/// Value of one ASCII hex digit.
const fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hexlify_pads_and_lowercases() {
        assert_eq!(hexlify(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
        assert_eq!(hexlify(&[]), "");
    }

    #[test]
    fn literal_escapes_quotes_backslashes_and_controls() {
        assert_eq!(literal_bytes(b"it's"), r"b'it\'s'");
        assert_eq!(literal_bytes(b"a\\b"), r"b'a\\b'");
        assert_eq!(literal_bytes(b"\r\n\x00\xff~ "), r"b'\x0d\x0a\x00\xff~ '");
    }

    #[test]
    fn printable_text_prefers_literal() {
        let (enc, stmt) = encode_chunk(b"print('hello')\n");
        assert_eq!(enc, ChunkEncoding::Literal);
        assert_eq!(stmt, r"o(b'print(\'hello\')\x0a')");
    }

    #[test]
    fn binary_prefers_hex() {
        let (enc, stmt) = encode_chunk(&[0x00, 0x01, 0x02, 0xfe]);
        assert_eq!(enc, ChunkEncoding::Hex);
        assert_eq!(stmt, "w('000102fe')");
    }

    #[test]
    fn empty_chunk_is_a_tie_won_by_literal() {
        assert_eq!(encode_chunk(b""), (ChunkEncoding::Literal, "o(b'')".to_owned()));
    }

    #[test]
    fn chosen_encoding_is_never_longer() {
        let samples: [&[u8]; 5] = [
            b"plain ascii text",
            b"\x00\x01\x02\x03",
            b"mixed \x00 bytes \\ and 'quotes'",
            &[0x7f; 16],
            b"''''\\\\",
        ];
        for chunk in samples {
            let (_, chosen) = encode_chunk(chunk);
            let hex = format!("w('{}')", hexlify(chunk));
            let literal = format!("o({})", literal_bytes(chunk));
            assert!(chosen.len() <= hex.len().min(literal.len()), "{chunk:?}");
        }
    }

    #[test]
    fn decode_hex_accepts_both_cases_and_trims() {
        assert_eq!(decode_hex(" 00ffAb\r\n").unwrap(), vec![0x00, 0xff, 0xab]);
        assert!(decode_hex("").unwrap().is_empty());
    }

    #[test]
    fn decode_hex_rejects_garbage() {
        assert!(matches!(decode_hex("abc"), Err(ParseError::OddHexLength(3))));
        assert!(matches!(decode_hex("00zz"), Err(ParseError::InvalidHex(2))));
    }

    #[test]
    fn hex_roundtrip_all_byte_values() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_hex(&hexlify(&data)).unwrap(), data);
    }
}
