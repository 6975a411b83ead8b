//! Netascii line-ending transform (RFC 764 as used by RFC 1350).
//!
//! On the wire a native LF becomes CR LF and a literal CR becomes CR NUL.
//! Decoding reverses both; any other byte after a CR is malformed.

use std::fmt;

pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;
pub const NUL: u8 = 0x00;

/// A bare CR was followed by something other than LF or NUL,
/// or ended the stream.
#[derive(Debug, PartialEq)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bare carriage return in netascii stream")
    }
}

impl std::error::Error for DecodeError {}

/// Expands native bytes into their netascii representation.
/// The output is at most twice the input length.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        encode_byte(b, &mut out);
    }
    out
}

pub(crate) fn encode_byte(b: u8, out: &mut Vec<u8>) {
    match b {
        LF => out.extend_from_slice(&[CR, LF]),
        CR => out.extend_from_slice(&[CR, NUL]),
        other => out.push(other),
    }
}

/// Collapses a complete netascii buffer back to native bytes.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(data.len());
    let mut decoder = Decoder::new();
    decoder.push(data, &mut out)?;
    decoder.finish()?;
    Ok(out)
}

/// Streaming netascii-to-native decoder. A CR at the end of one block
/// is carried so the decision can be made when the next block arrives.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), DecodeError> {
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    _ => return Err(DecodeError),
                }
            } else if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        Ok(())
    }

    /// Call once at end of stream; a still-pending CR is malformed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.pending_cr {
            Err(DecodeError)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lf_expands_to_cr_lf() {
        assert_eq!(encode(b"abc\n"), b"abc\r\n");
    }

    #[test]
    fn cr_expands_to_cr_nul() {
        assert_eq!(encode(b"\r"), b"\r\0");
    }

    #[test]
    fn decode_collapses_cr_lf() {
        assert_eq!(decode(b"a\r\nb").unwrap(), b"a\nb");
    }

    #[test]
    fn decode_collapses_cr_nul() {
        assert_eq!(decode(b"a\r\0b").unwrap(), b"a\rb");
    }

    #[test]
    fn bare_cr_is_malformed() {
        assert_eq!(decode(b"a\rb"), Err(DecodeError));
        assert_eq!(decode(b"a\r"), Err(DecodeError));
    }

    #[test]
    fn round_trip_identity() {
        let samples: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"no line endings at all".to_vec(),
            b"unix\nlines\n".to_vec(),
            b"mac\rlines\r".to_vec(),
            b"dos\r\nlines\r\n".to_vec(),
            (0u8..=255).collect(),
        ];
        for sample in samples {
            assert_eq!(decode(&encode(&sample)).unwrap(), sample);
        }
    }

    #[test]
    fn decoder_carries_cr_across_blocks() {
        let mut out = vec![];
        let mut dec = Decoder::new();
        // "x\r" / "\ny" split exactly on the escape sequence
        dec.push(b"x\r", &mut out).unwrap();
        dec.push(b"\ny", &mut out).unwrap();
        dec.finish().unwrap();
        assert_eq!(out, b"x\ny");
    }

    #[test]
    fn decoder_rejects_trailing_cr_at_finish() {
        let mut out = vec![];
        let mut dec = Decoder::new();
        dec.push(b"x\r", &mut out).unwrap();
        assert_eq!(dec.finish(), Err(DecodeError));
    }
}
