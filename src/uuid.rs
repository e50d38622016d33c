use std::fmt;
use std::str::FromStr;

/// A 16 byte identifier for disks and volumes.
///
/// Rendered in the usual hyphenated hex form. Parsing accepts the hyphenated
/// form as well as 32 plain hex digits, which is what operators tend to paste
/// into config files.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const fn nil() -> Uuid {
        Uuid([0; 16])
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Uuid {
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseUuidError;

impl fmt::Display for ParseUuidError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("invalid uuid")
    }
}

impl std::error::Error for ParseUuidError {}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Uuid, ParseUuidError> {
        let mut bytes = [0u8; 16];
        let mut nibbles = 0;

        for c in s.chars() {
            if c == '-' {
                continue;
            }

            let digit = c.to_digit(16).ok_or(ParseUuidError)? as u8;

            if nibbles >= 32 {
                return Err(ParseUuidError);
            }

            bytes[nibbles / 2] = (bytes[nibbles / 2] << 4) | digit;
            nibbles += 1;
        }

        if nibbles != 32 {
            return Err(ParseUuidError);
        }

        Ok(Uuid(bytes))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                fmt.write_str("-")?;
            }
            write!(fmt, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Uuid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let text = "00112233-4455-6677-8899-aabbccddeeff";
        let uuid: Uuid = text.parse().unwrap();
        assert_eq!(uuid.to_string(), text);
        assert_eq!(uuid.as_bytes()[0], 0x00);
        assert_eq!(uuid.as_bytes()[15], 0xff);
    }

    #[test]
    fn plain_hex() {
        let uuid: Uuid = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(uuid.as_bytes()[1], 0x01);
        assert_eq!(uuid.to_string(), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Uuid>().is_err());
        assert!("zz112233-4455-6677-8899-aabbccddeeff".parse::<Uuid>().is_err());
        assert!("00112233".parse::<Uuid>().is_err());
        assert!("00112233-4455-6677-8899-aabbccddeeff00".parse::<Uuid>().is_err());
    }
}
