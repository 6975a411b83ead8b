pub use crate::options::{TftpOption, MAX_BLOCKSIZE, MIN_BLOCKSIZE};
use byteorder::{BigEndian, ByteOrder};
use std::convert::TryFrom;
use std::{fmt, result, str};

/// Codec failures. The listener drops frames that fail to decode; a live
/// connection answers them with an ERROR frame instead.
#[derive(Debug, PartialEq)]
pub enum PacketErr {
    /// Fewer bytes than the opcode's fixed fields require
    TooShort,
    /// Bytes left over after a fixed-length frame
    ExcessBytes,
    BadOpcode(u16),
    BadErrorCode(u16),
    /// A string field without terminator, or one that is not UTF-8
    BadString,
    UnknownMode,
    OversizedRequest,
}

impl fmt::Display for PacketErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PacketErr::TooShort => write!(f, "frame shorter than its opcode requires"),
            PacketErr::ExcessBytes => write!(f, "trailing bytes after fixed-length frame"),
            PacketErr::BadOpcode(op) => write!(f, "unknown opcode {}", op),
            PacketErr::BadErrorCode(code) => write!(f, "unknown error code {}", code),
            PacketErr::BadString => write!(f, "malformed string field"),
            PacketErr::UnknownMode => write!(f, "unsupported transfer mode"),
            PacketErr::OversizedRequest => write!(f, "request frame too large"),
        }
    }
}

pub type Result<T> = result::Result<T, PacketErr>;

#[derive(PartialEq, Copy, Clone, Debug)]
#[repr(u16)]
pub enum OpCode {
    RRQ = 1,
    WRQ = 2,
    DATA = 3,
    ACK = 4,
    ERROR = 5,
    OACK = 6,
}

impl TryFrom<u16> for OpCode {
    type Error = PacketErr;
    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            1 => Ok(OpCode::RRQ),
            2 => Ok(OpCode::WRQ),
            3 => Ok(OpCode::DATA),
            4 => Ok(OpCode::ACK),
            5 => Ok(OpCode::ERROR),
            6 => Ok(OpCode::OACK),
            other => Err(PacketErr::BadOpcode(other)),
        }
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalTFTP = 4,
    UnknownID = 5,
    FileExists = 6,
    NoUser = 7,
}

impl TryFrom<u16> for ErrorCode {
    type Error = PacketErr;
    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(ErrorCode::NotDefined),
            1 => Ok(ErrorCode::FileNotFound),
            2 => Ok(ErrorCode::AccessViolation),
            3 => Ok(ErrorCode::DiskFull),
            4 => Ok(ErrorCode::IllegalTFTP),
            5 => Ok(ErrorCode::UnknownID),
            6 => Ok(ErrorCode::FileExists),
            7 => Ok(ErrorCode::NoUser),
            other => Err(PacketErr::BadErrorCode(other)),
        }
    }
}

impl ErrorCode {
    /// Default human-readable text for ERROR frames carrying this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalTFTP => "Illegal TFTP operation.",
            ErrorCode::UnknownID => "Unknown transfer ID.",
            ErrorCode::FileExists => "File already exists.",
            ErrorCode::NoUser => "No such user.",
        }
    }
}

impl From<ErrorCode> for Packet {
    /// An ERROR frame carrying the code's default message.
    fn from(code: ErrorCode) -> Packet {
        Packet::ERROR {
            code,
            msg: code.message().to_owned(),
        }
    }
}

/// Largest frame this implementation sends or receives:
/// a DATA packet carrying a maximally negotiated block.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCKSIZE as usize + 4 /*opcode + block number*/;

/// Requests are a filename, a mode and a few short option tokens; anything
/// bigger is garbage.
const MAX_REQUEST_SIZE: usize = 512;

#[derive(PartialEq, Clone, Debug)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: TransferMode,
        options: Vec<TftpOption>,
    },
    WRQ {
        filename: String,
        mode: TransferMode,
        options: Vec<TftpOption>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK(u16),
    ERROR {
        code: ErrorCode,
        msg: String,
    },
    OACK {
        options: Vec<TftpOption>,
    },
}

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum TransferMode {
    Octet,
    Netascii,
}

impl TransferMode {
    fn from_token(token: &str) -> Result<Self> {
        match token.to_ascii_lowercase().as_str() {
            "octet" => Ok(TransferMode::Octet),
            "netascii" => Ok(TransferMode::Netascii),
            // `mail` is obsolete and not served here
            _ => Err(PacketErr::UnknownMode),
        }
    }

    fn token(self) -> &'static str {
        match self {
            TransferMode::Octet => "octet",
            TransferMode::Netascii => "netascii",
        }
    }
}

/// Cursor over a frame body. Integer fields are big-endian; strings are
/// NUL-terminated (RFC 1350 §5).
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Scanner { rest }
    }

    fn u16(&mut self) -> Result<u16> {
        if self.rest.len() < 2 {
            return Err(PacketErr::TooShort);
        }
        let value = BigEndian::read_u16(self.rest);
        self.rest = &self.rest[2..];
        Ok(value)
    }

    /// The next NUL-terminated string; the terminator is consumed.
    fn cstr(&mut self) -> Result<&'a str> {
        let nul = self
            .rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(PacketErr::BadString)?;
        let parsed = str::from_utf8(&self.rest[..nul]).map_err(|_| PacketErr::BadString)?;
        self.rest = &self.rest[nul + 1..];
        Ok(parsed)
    }

    /// Everything left in the frame, consumed as raw bytes.
    fn payload(&mut self) -> Vec<u8> {
        let bytes = self.rest.to_vec();
        self.rest = &[];
        bytes
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Splits whatever is left into NUL-terminated tokens. Trailing bytes
    /// without a terminator are dropped.
    fn tokens(mut self) -> Vec<&'a str> {
        let mut tokens = vec![];
        while let Ok(token) = self.cstr() {
            tokens.push(token);
        }
        tokens
    }
}

impl Packet {
    /// Parses a single datagram into its frame shape.
    pub fn read(bytes: &[u8]) -> Result<Packet> {
        let mut scan = Scanner::new(bytes);
        let opcode = OpCode::try_from(scan.u16()?)?;
        match opcode {
            OpCode::RRQ | OpCode::WRQ => {
                if bytes.len() > MAX_REQUEST_SIZE {
                    return Err(PacketErr::OversizedRequest);
                }
                let filename = scan.cstr()?.to_owned();
                if filename.is_empty() {
                    return Err(PacketErr::BadString);
                }
                let mode = TransferMode::from_token(scan.cstr()?)?;
                let options = parse_options(scan.tokens());
                Ok(if opcode == OpCode::RRQ {
                    Packet::RRQ {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Packet::WRQ {
                        filename,
                        mode,
                        options,
                    }
                })
            }
            OpCode::DATA => {
                let block_num = scan.u16()?;
                Ok(Packet::DATA {
                    block_num,
                    data: scan.payload(),
                })
            }
            OpCode::ACK => {
                let block_num = scan.u16()?;
                // an ACK is the opcode and a block number, nothing more
                if scan.remaining() != 0 {
                    return Err(PacketErr::ExcessBytes);
                }
                Ok(Packet::ACK(block_num))
            }
            OpCode::ERROR => {
                let code = ErrorCode::try_from(scan.u16()?)?;
                let msg = scan.cstr()?.to_owned();
                Ok(Packet::ERROR { code, msg })
            }
            OpCode::OACK => Ok(Packet::OACK {
                options: parse_options(scan.tokens()),
            }),
        }
    }

    /// Serializes the frame; the result is exactly the datagram to send.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match *self {
            Packet::RRQ {
                ref filename,
                mode,
                ref options,
            }
            | Packet::WRQ {
                ref filename,
                mode,
                ref options,
            } => {
                push_u16(&mut buf, self.opcode() as u16);
                push_cstr(&mut buf, filename);
                push_cstr(&mut buf, mode.token());
                for opt in options {
                    opt.append_to(&mut buf);
                }
            }
            Packet::DATA {
                block_num,
                ref data,
            } => {
                buf.reserve(data.len());
                push_u16(&mut buf, OpCode::DATA as u16);
                push_u16(&mut buf, block_num);
                buf.extend_from_slice(data);
            }
            Packet::ACK(block_num) => {
                push_u16(&mut buf, OpCode::ACK as u16);
                push_u16(&mut buf, block_num);
            }
            Packet::ERROR { code, ref msg } => {
                push_u16(&mut buf, OpCode::ERROR as u16);
                push_u16(&mut buf, code as u16);
                push_cstr(&mut buf, msg);
            }
            Packet::OACK { ref options } => {
                push_u16(&mut buf, OpCode::OACK as u16);
                for opt in options {
                    opt.append_to(&mut buf);
                }
            }
        }
        buf
    }

    /// Consumes the packet and returns its wire form.
    pub fn into_bytes(self) -> Vec<u8> {
        self.to_bytes()
    }

    fn opcode(&self) -> OpCode {
        match *self {
            Packet::RRQ { .. } => OpCode::RRQ,
            Packet::WRQ { .. } => OpCode::WRQ,
            Packet::DATA { .. } => OpCode::DATA,
            Packet::ACK(_) => OpCode::ACK,
            Packet::ERROR { .. } => OpCode::ERROR,
            Packet::OACK { .. } => OpCode::OACK,
        }
    }
}

/// Options trail the mode as `name\0value\0` pairs. An odd token count
/// discards every option; unknown names and bad values skip the pair.
fn parse_options(tokens: Vec<&str>) -> Vec<TftpOption> {
    if tokens.len() % 2 != 0 {
        return vec![];
    }
    tokens
        .chunks(2)
        .filter_map(|pair| TftpOption::parse(pair[0], pair[1]))
        .collect()
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    let mut be = [0; 2];
    BigEndian::write_u16(&mut be, value);
    buf.extend_from_slice(&be);
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::*;

    fn round_trips(packet: Packet) {
        let wire = packet.to_bytes();
        assert_eq!(Packet::read(&wire).unwrap(), packet);
    }

    #[test]
    fn frames_survive_a_round_trip() {
        round_trips(Packet::RRQ {
            filename: "disk/boot.img".into(),
            mode: TransferMode::Netascii,
            options: vec![],
        });
        round_trips(Packet::RRQ {
            filename: "disk/boot.img".into(),
            mode: TransferMode::Octet,
            options: vec![TftpOption::Blocksize(735)],
        });
        round_trips(Packet::WRQ {
            filename: "upload.txt".into(),
            mode: TransferMode::Octet,
            options: vec![
                TftpOption::Blocksize(846),
                TftpOption::TransferSize(3100),
                TftpOption::Timeout(5),
            ],
        });
        round_trips(Packet::DATA {
            block_num: 9,
            data: vec![0x5A; 512],
        });
        round_trips(Packet::ACK(65_535));
        round_trips(Packet::ERROR {
            code: ErrorCode::NoUser,
            msg: "nobody here".into(),
        });
        round_trips(Packet::OACK {
            options: vec![TftpOption::Blocksize(1234)],
        });
    }

    #[test]
    fn ack_wire_form() {
        assert_eq!(Packet::ACK(0x0102).to_bytes(), [0x00, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn data_wire_form_is_big_endian() {
        let wire = Packet::DATA {
            block_num: 0x0102,
            data: vec![0xEE],
        }
        .to_bytes();
        assert_eq!(wire, [0x00, 0x03, 0x01, 0x02, 0xEE]);
    }

    #[test]
    fn ack_must_be_exactly_four_bytes() {
        assert_matches!(Packet::read(&[0, 4, 0, 1]), Ok(Packet::ACK(1)));
        assert_eq!(Packet::read(&[0, 4, 0]), Err(PacketErr::TooShort));
        assert_eq!(Packet::read(&[0, 4, 0, 1, 9]), Err(PacketErr::ExcessBytes));
    }

    #[test]
    fn short_or_junk_frames_are_rejected() {
        assert_eq!(Packet::read(&[]), Err(PacketErr::TooShort));
        assert_eq!(Packet::read(&[0]), Err(PacketErr::TooShort));
        assert_eq!(Packet::read(&[0, 9]), Err(PacketErr::BadOpcode(9)));
        assert_eq!(Packet::read(&[0, 3, 0]), Err(PacketErr::TooShort));
        // ERROR frame missing its message terminator
        assert_eq!(Packet::read(&[0, 5, 0, 1]), Err(PacketErr::BadString));
        assert_eq!(
            Packet::read(&[0, 5, 0, 99, b'x', 0]),
            Err(PacketErr::BadErrorCode(99))
        );
    }

    #[test]
    fn empty_data_payload_is_valid() {
        assert_matches!(
            Packet::read(&[0, 3, 0, 7]),
            Ok(Packet::DATA { block_num: 7, ref data }) if data.is_empty()
        );
    }

    #[test]
    fn oack_may_carry_no_options() {
        assert_matches!(
            Packet::read(&[0, 6]),
            Ok(Packet::OACK { ref options }) if options.is_empty()
        );
    }

    #[test]
    fn request_mode_matching_ignores_case() {
        assert_matches!(
            Packet::read(b"\x00\x01abc\0OcTeT\0"),
            Ok(Packet::RRQ { mode: TransferMode::Octet, .. })
        );
        assert_matches!(
            Packet::read(b"\x00\x02abc\0NETASCII\0"),
            Ok(Packet::WRQ { mode: TransferMode::Netascii, .. })
        );
    }

    #[test]
    fn request_with_unusable_mode_is_rejected() {
        assert_eq!(
            Packet::read(b"\x00\x01abc\0sextet\0"),
            Err(PacketErr::UnknownMode)
        );
        // `mail` mode is not implemented
        assert_eq!(
            Packet::read(b"\x00\x01abc\0mail\0"),
            Err(PacketErr::UnknownMode)
        );
        assert_eq!(Packet::read(b"\x00\x01abc\0"), Err(PacketErr::BadString));
    }

    #[test]
    fn request_with_empty_filename_is_rejected() {
        assert_eq!(Packet::read(b"\x00\x01\0octet\0"), Err(PacketErr::BadString));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let wire = Packet::RRQ {
            filename: "x".repeat(520),
            mode: TransferMode::Octet,
            options: vec![],
        }
        .to_bytes();
        assert_eq!(Packet::read(&wire), Err(PacketErr::OversizedRequest));
    }

    #[test]
    fn odd_option_tokens_discard_all_options() {
        let packet = Packet::read(b"\x00\x01f\0octet\0blksize\01024\0dangling\0").unwrap();
        assert_matches!(packet, Packet::RRQ { ref options, .. } if options.is_empty());
    }

    #[test]
    fn unknown_options_are_skipped() {
        let packet = Packet::read(b"\x00\x01f\0octet\0windowsize\04\0blksize\01024\0").unwrap();
        assert_matches!(
            packet,
            Packet::RRQ { ref options, .. } if *options == vec![TftpOption::Blocksize(1024)]
        );
    }

    #[test]
    fn non_utf8_filename_is_rejected() {
        assert_eq!(
            Packet::read(&[0, 1, 0xFF, 0xFE, 0, b'o', b'c', b't', b'e', b't', 0]),
            Err(PacketErr::BadString)
        );
    }
}
