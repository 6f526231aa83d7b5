use std::fmt;

use heapless::String as BoundedString;

pub const SSID_MAX_LEN: usize = 32;
pub const PASSPHRASE_MAX_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    EmptySsid,
    SsidTooLong(usize),
    PassphraseTooLong(usize),
    ControlCharacter,
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsError::EmptySsid => write!(f, "SSID cannot be empty"),
            CredentialsError::SsidTooLong(len) => {
                write!(f, "SSID is {} bytes, max {}", len, SSID_MAX_LEN)
            }
            CredentialsError::PassphraseTooLong(len) => {
                write!(f, "passphrase is {} bytes, max {}", len, PASSPHRASE_MAX_LEN)
            }
            CredentialsError::ControlCharacter => {
                write!(f, "credentials cannot contain control characters")
            }
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Station credentials. Always replaced wholesale; the bounded buffers make
/// an oversized value unrepresentable.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    ssid: BoundedString<SSID_MAX_LEN>,
    passphrase: BoundedString<PASSPHRASE_MAX_LEN>,
}

impl NetworkCredentials {
    pub fn new(ssid: &str, passphrase: &str) -> Result<Self, CredentialsError> {
        if ssid.is_empty() {
            return Err(CredentialsError::EmptySsid);
        }
        if ssid.chars().chain(passphrase.chars()).any(char::is_control) {
            return Err(CredentialsError::ControlCharacter);
        }

        let mut bounded_ssid = BoundedString::new();
        bounded_ssid
            .push_str(ssid)
            .map_err(|_| CredentialsError::SsidTooLong(ssid.len()))?;

        let mut bounded_pass = BoundedString::new();
        bounded_pass
            .push_str(passphrase)
            .map_err(|_| CredentialsError::PassphraseTooLong(passphrase.len()))?;

        Ok(Self {
            ssid: bounded_ssid,
            passphrase: bounded_pass,
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// Open network: no passphrase configured
    pub fn is_open(&self) -> bool {
        self.passphrase.is_empty()
    }
}

// Keeps the passphrase out of logs
impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid.as_str())
            .field("passphrase", &if self.is_open() { "<empty>" } else { "<set>" })
            .finish()
    }
}
