/// Recognized option extensions (RFC 2348/2349). Anything else a client
/// offers is dropped during parsing and therefore never acknowledged.
#[derive(PartialEq, Clone, Debug)]
pub enum TftpOption {
    Blocksize(u16),
    TransferSize(u64),
    Timeout(u8),
}

pub const MIN_BLOCKSIZE: u16 = 8;
pub const MAX_BLOCKSIZE: u16 = 65_464;

impl TftpOption {
    /// Builds a typed option from one wire `(name, value)` pair. Names
    /// match case-insensitively; an out-of-range value invalidates the
    /// pair rather than being clamped.
    pub fn parse(name: &str, value: &str) -> Option<Self> {
        let value: u64 = value.parse().ok()?;
        match name.to_ascii_lowercase().as_str() {
            "blksize"
                if (u64::from(MIN_BLOCKSIZE)..=u64::from(MAX_BLOCKSIZE)).contains(&value) =>
            {
                Some(TftpOption::Blocksize(value as u16))
            }
            "timeout" if (1..=255).contains(&value) => Some(TftpOption::Timeout(value as u8)),
            "tsize" => Some(TftpOption::TransferSize(value)),
            _ => None,
        }
    }

    /// The option's wire name, as this implementation emits it.
    pub fn name(&self) -> &'static str {
        match *self {
            TftpOption::Blocksize(_) => "blksize",
            TftpOption::TransferSize(_) => "tsize",
            TftpOption::Timeout(_) => "timeout",
        }
    }

    fn value(&self) -> u64 {
        match *self {
            TftpOption::Blocksize(v) => u64::from(v),
            TftpOption::TransferSize(v) => v,
            TftpOption::Timeout(v) => u64::from(v),
        }
    }

    /// Appends the `name\0value\0` token pair to a frame under construction.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.name().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.value().to_string().as_bytes());
        buf.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_case_insensitively() {
        assert_eq!(
            TftpOption::parse("blksize", "512"),
            Some(TftpOption::Blocksize(512))
        );
        assert_eq!(
            TftpOption::parse("BLKSIZE", "512"),
            Some(TftpOption::Blocksize(512))
        );
        assert_eq!(
            TftpOption::parse("tSiZe", "0"),
            Some(TftpOption::TransferSize(0))
        );
        assert_eq!(
            TftpOption::parse("Timeout", "8"),
            Some(TftpOption::Timeout(8))
        );
    }

    #[test]
    fn rejects_unknown_names_and_junk_values() {
        assert_eq!(TftpOption::parse("blocksize", "512"), None);
        assert_eq!(TftpOption::parse("windowsize", "4"), None);
        assert_eq!(TftpOption::parse("multicast", ""), None);
        assert_eq!(TftpOption::parse("blksize", "cat"), None);
        assert_eq!(TftpOption::parse("tsize", "-1"), None);
    }

    #[test]
    fn blocksize_bounds_are_enforced() {
        assert_eq!(TftpOption::parse("blksize", "7"), None);
        assert_eq!(
            TftpOption::parse("blksize", "8"),
            Some(TftpOption::Blocksize(8))
        );
        assert_eq!(
            TftpOption::parse("blksize", "65464"),
            Some(TftpOption::Blocksize(65_464))
        );
        assert_eq!(TftpOption::parse("blksize", "65465"), None);
    }

    #[test]
    fn timeout_outside_rfc_range_is_dropped() {
        assert_eq!(TftpOption::parse("timeout", "0"), None);
        assert_eq!(
            TftpOption::parse("timeout", "255"),
            Some(TftpOption::Timeout(255))
        );
        assert_eq!(TftpOption::parse("timeout", "256"), None);
    }

    #[test]
    fn wire_form_is_two_nul_terminated_tokens() {
        let mut buf = vec![];
        TftpOption::Blocksize(78).append_to(&mut buf);
        TftpOption::TransferSize(54).append_to(&mut buf);
        TftpOption::Timeout(4).append_to(&mut buf);
        assert_eq!(buf, b"blksize\078\0tsize\054\0timeout\04\0");
    }
}
