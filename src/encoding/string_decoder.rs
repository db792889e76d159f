//! Incremental bytes-to-text decoding
//!
//! Multi-byte sequences split across chunk boundaries are held back until the
//! rest arrives, so decoding a stream chunk by chunk yields the same text as
//! decoding it in one piece.

use super::Encoding;
use crate::config::StreamOptions;
use crate::runtime::EventLoop;
use crate::stream::{Chunk, Completion, ReadableController, Transform, Transformer};
use base64::{Engine, engine::general_purpose};

const REPLACEMENT: char = '\u{FFFD}';

/// Stateful decoder keeping incomplete sequences between writes
#[derive(Debug, Clone)]
pub struct StringDecoder {
    encoding: Encoding,
    /// Bytes of an incomplete character (or base64 group)
    pending: Vec<u8>,
}

impl StringDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Number of bytes held back waiting for the rest of a character
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Decode `bytes`, keeping an incomplete trailing sequence buffered
    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => self.write_utf8(bytes),
            Encoding::Utf16Le => self.write_utf16(bytes, u16::from_le_bytes),
            Encoding::Utf16Be => self.write_utf16(bytes, u16::from_be_bytes),
            Encoding::Base64 => self.write_base64(bytes),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => bytes.iter().map(|&b| (b & 0x7F) as char).collect(),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    /// Decode the final bytes and flush whatever is still buffered
    pub fn end(&mut self, bytes: Option<&[u8]>) -> String {
        let mut result = match bytes {
            Some(b) => self.write(b),
            None => String::new(),
        };

        if !self.pending.is_empty() {
            match self.encoding {
                Encoding::Base64 => {
                    result.push_str(&general_purpose::STANDARD.encode(&self.pending));
                }
                // Truncated character
                _ => result.push(REPLACEMENT),
            }
            self.pending.clear();
        }

        result
    }

    fn write_utf8(&mut self, bytes: &[u8]) -> String {
        let mut all = std::mem::take(&mut self.pending);
        all.extend_from_slice(bytes);

        let mut result = String::with_capacity(all.len());
        let mut i = 0;
        while i < all.len() {
            let b = all[i];
            let seq_len = match b {
                0x00..=0x7F => 1,
                0xC2..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF4 => 4,
                _ => {
                    result.push(REPLACEMENT);
                    i += 1;
                    continue;
                }
            };

            let available = (all.len() - i).min(seq_len);
            let continuation = all[i + 1..i + available]
                .iter()
                .all(|&c| (0x80..=0xBF).contains(&c));

            if !continuation {
                // Lead byte followed by something that cannot continue it
                result.push(REPLACEMENT);
                i += 1;
                continue;
            }

            if available < seq_len {
                self.pending = all[i..].to_vec();
                break;
            }

            match std::str::from_utf8(&all[i..i + seq_len]) {
                Ok(s) => result.push_str(s),
                // Overlong or surrogate encodings
                Err(_) => result.push(REPLACEMENT),
            }
            i += seq_len;
        }

        result
    }

    fn write_utf16(&mut self, bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
        let mut all = std::mem::take(&mut self.pending);
        all.extend_from_slice(bytes);

        let mut result = String::with_capacity(all.len() / 2);
        let mut i = 0;
        while i + 1 < all.len() {
            let first = unit([all[i], all[i + 1]]);

            if (0xD800..=0xDBFF).contains(&first) {
                if i + 3 >= all.len() {
                    // High surrogate waiting for its pair
                    break;
                }
                let second = unit([all[i + 2], all[i + 3]]);
                if (0xDC00..=0xDFFF).contains(&second) {
                    let code_point =
                        0x10000 + ((first as u32 - 0xD800) << 10) + (second as u32 - 0xDC00);
                    result.push(char::from_u32(code_point).unwrap_or(REPLACEMENT));
                    i += 4;
                    continue;
                }
            }

            result.push(char::from_u32(first as u32).unwrap_or(REPLACEMENT));
            i += 2;
        }

        self.pending = all[i..].to_vec();
        result
    }

    fn write_base64(&mut self, bytes: &[u8]) -> String {
        let mut all = std::mem::take(&mut self.pending);
        all.extend_from_slice(bytes);

        // 3 bytes -> 4 chars, the remainder waits for more input or `end`
        let complete = (all.len() / 3) * 3;
        let result = general_purpose::STANDARD.encode(&all[..complete]);
        self.pending = all[complete..].to_vec();
        result
    }
}

struct DecodeTransformer {
    decoder: StringDecoder,
}

impl Transformer<Vec<u8>, String> for DecodeTransformer {
    fn transform(&mut self, chunk: Chunk<Vec<u8>>, out: &ReadableController<String>, done: Completion) {
        let text = self.decoder.write(&chunk.payload);
        if !text.is_empty() {
            out.push(text);
        }
        done.complete();
    }

    fn flush(&mut self, out: &ReadableController<String>, done: Completion) {
        let text = self.decoder.end(None);
        if !text.is_empty() {
            out.push(text);
        }
        done.complete();
    }
}

/// Transform turning a byte stream into text chunks in `encoding`
pub fn decoder_stream(rt: &EventLoop, encoding: Encoding) -> Transform<Vec<u8>, String> {
    decoder_stream_with(rt, encoding, StreamOptions::default())
}

/// [`decoder_stream`] with explicit stream options
pub fn decoder_stream_with(
    rt: &EventLoop,
    encoding: Encoding,
    options: StreamOptions,
) -> Transform<Vec<u8>, String> {
    Transform::new(
        rt,
        options,
        DecodeTransformer {
            decoder: StringDecoder::new(encoding),
        },
    )
}
