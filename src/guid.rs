use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A D-Bus server GUID.
///
/// A 128-bit identifier, represented as 32 lowercase hexadecimal digits, that
/// a server generates when it starts listening and sends to every client as
/// part of the `OK` line of the authentication handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    /// Generate a D-Bus GUID that can be used with e.g.
    /// [`ConnectionBuilder::server`].
    ///
    /// As the reference implementation does, the last 32 bits encode the
    /// current time so GUIDs sort roughly by creation.
    ///
    /// [`ConnectionBuilder::server`]: struct.ConnectionBuilder.html#method.server
    pub fn generate() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|t| t.as_secs() as u32)
            .unwrap_or(0);

        let mut s = String::with_capacity(32);
        for _ in 0..3 {
            s.push_str(&format!("{:08x}", fastrand::u32(..)));
        }
        s.push_str(&format!("{:08x}", timestamp));

        Self(s)
    }

    /// The GUID as a string of 32 lowercase hexadecimal digits.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn validate(value: &str) -> Result<()> {
        if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(Error::Address(format!("invalid GUID: {}", value)))
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::validate(value)?;
        Ok(Self(value.to_lowercase()))
    }
}

impl TryFrom<String> for Guid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::validate(&value)?;
        if value.chars().any(|c| c.is_ascii_uppercase()) {
            Ok(Self(value.to_lowercase()))
        } else {
            Ok(Self(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;
    use std::str::FromStr;

    #[test]
    fn generate_is_valid() {
        let guid = Guid::generate();
        assert_eq!(guid.as_str().len(), 32);
        assert!(Guid::from_str(guid.as_str()).is_ok());
    }

    #[test]
    fn reject_malformed() {
        assert!(Guid::from_str("abc").is_err());
        assert!(Guid::from_str("g2a9b8c7d6e5f40312a9b8c7d6e5f403").is_err());
    }

    #[test]
    fn normalizes_case() {
        let guid = Guid::from_str("A2A9B8C7D6E5F40312a9b8c7d6e5f403").unwrap();
        assert_eq!(guid.as_str(), "a2a9b8c7d6e5f40312a9b8c7d6e5f403");
    }
}
