//! Text encodings for string chunks
//!
//! Supported encodings match the Node.js names: utf8, utf16le, utf16be,
//! latin1 (binary), ascii, base64 and hex.

mod string_decoder;

pub use string_decoder::{StringDecoder, decoder_stream};

use base64::{Engine, engine::general_purpose};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors raised while converting between text and bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unknown encoding: {0}")]
    Unknown(String),

    #[error("Invalid {encoding} input: {reason}")]
    InvalidInput {
        encoding: Encoding,
        reason: String,
    },
}

/// Supported encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Latin1,
    Ascii,
    Base64,
    Hex,
}

impl FromStr for Encoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            "utf16be" | "utf-16be" => Ok(Encoding::Utf16Be),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            _ => Err(EncodingError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Encoding {
    /// Canonical Node.js name
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Utf16Le => "utf16le",
            Encoding::Utf16Be => "utf16be",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
        }
    }

    /// Convert text written in this encoding into bytes.
    ///
    /// For base64 and hex the text is the encoded form and is decoded.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        let bytes = match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Encoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Encoding::Latin1 | Encoding::Ascii => {
                text.chars().map(|c| (c as u32 & 0xFF) as u8).collect()
            }
            Encoding::Base64 => general_purpose::STANDARD
                .decode(text.trim_end_matches('\n'))
                .map_err(|e| self.invalid(e))?,
            Encoding::Hex => hex::decode(text).map_err(|e| self.invalid(e))?,
        };
        Ok(bytes)
    }

    /// Render bytes as text in this encoding
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut decoder = StringDecoder::new(*self);
        decoder.end(Some(bytes))
    }

    fn invalid(&self, reason: impl fmt::Display) -> EncodingError {
        EncodingError::InvalidInput {
            encoding: *self,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("ucs2".parse::<Encoding>().unwrap(), Encoding::Utf16Le);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!(matches!(
            "ebcdic".parse::<Encoding>(),
            Err(EncodingError::Unknown(_))
        ));
        assert_eq!(Encoding::Hex.to_string(), "hex");
    }

    #[test]
    fn test_encode() {
        assert_eq!(Encoding::Utf8.encode("hé").unwrap(), vec![0x68, 0xC3, 0xA9]);
        assert_eq!(Encoding::Utf16Le.encode("A").unwrap(), vec![0x41, 0x00]);
        assert_eq!(Encoding::Utf16Be.encode("A").unwrap(), vec![0x00, 0x41]);
        assert_eq!(Encoding::Latin1.encode("é").unwrap(), vec![0xE9]);
        assert_eq!(Encoding::Hex.encode("cafe").unwrap(), vec![0xCA, 0xFE]);
        assert_eq!(Encoding::Base64.encode("aGk=").unwrap(), b"hi".to_vec());
        assert!(Encoding::Hex.encode("xyz").is_err());
    }

    #[test]
    fn test_decode() {
        assert_eq!(Encoding::Hex.decode(&[0xCA, 0xFE]), "cafe");
        assert_eq!(Encoding::Base64.decode(b"hi"), "aGk=");
        assert_eq!(Encoding::Utf8.decode("hé".as_bytes()), "hé");
    }
}
