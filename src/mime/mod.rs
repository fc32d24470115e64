//! Message framing.
//!
//! Builds the RFC 5322 text handed to `DATA`: a fixed header block for an
//! HTML body followed by the body bytes verbatim, plus the dot-stuffing
//! applied on the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Longest payload, in bytes, of one encoded-word: 45 bytes become 60
/// base64 characters, which keeps `=?UTF-8?B?...?=` within 75.
const ENCODED_WORD_BYTES: usize = 45;

/// Content type of every relayed body.
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=\"UTF-8\"";

/// Encoder for relayed messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeEncoder;

impl MimeEncoder {
    /// Frames a message: `From`, `To`, `Subject`, `MIME-Version` and
    /// `Content-Type` lines, a blank line, then the body unchanged.
    pub fn encode(from: &str, to: &str, subject: &str, body: &str) -> Vec<u8> {
        let mut output = Vec::with_capacity(body.len() + 256);

        Self::write_header(&mut output, "From", from);
        Self::write_header(&mut output, "To", to);
        Self::write_folded_header(&mut output, "Subject", &Self::encode_header(subject));
        Self::write_header(&mut output, "MIME-Version", "1.0");
        Self::write_header(&mut output, "Content-Type", HTML_CONTENT_TYPE);
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(body.as_bytes());

        output
    }

    /// Writes one `Name: value` line.
    fn write_header(output: &mut Vec<u8>, name: &str, value: &str) {
        output.extend_from_slice(name.as_bytes());
        output.extend_from_slice(b": ");
        output.extend_from_slice(Self::sanitize_value(value).as_bytes());
        output.extend_from_slice(b"\r\n");
    }

    /// Writes a value that is already sanitized and possibly folded.
    fn write_folded_header(output: &mut Vec<u8>, name: &str, value: &str) {
        output.extend_from_slice(name.as_bytes());
        output.extend_from_slice(b": ");
        output.extend_from_slice(value.as_bytes());
        output.extend_from_slice(b"\r\n");
    }

    /// Collapses line breaks so a value can never start a new header.
    fn sanitize_value(value: &str) -> String {
        value
            .split(['\r', '\n'])
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// RFC 2047 B-encodes values that are not plain ASCII. Long values are
    /// split on character boundaries into several encoded-words, one per
    /// folded line.
    fn encode_header(value: &str) -> String {
        let value = Self::sanitize_value(value);
        if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
            return value;
        }

        let mut words = Vec::new();
        let mut chunk = String::new();
        for c in value.chars() {
            if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
                words.push(Self::encoded_word(&chunk));
                chunk.clear();
            }
            chunk.push(c);
        }
        if !chunk.is_empty() {
            words.push(Self::encoded_word(&chunk));
        }

        words.join("\r\n ")
    }

    fn encoded_word(text: &str) -> String {
        format!("=?UTF-8?B?{}?=", BASE64.encode(text.as_bytes()))
    }

    /// Prepares a framed message for the DATA phase: dot-stuffing, CRLF at
    /// the end, then the `.` terminator line.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b".\r\n");

        output
    }
}
