
use crate::{RagError, Result};

/// Coerce an arbitrary byte string into valid UTF-8.
///
/// Tries, in order: UTF-8 BOM strip, UTF-16 LE/BE BOM transcoding (unpaired
/// surrogates rejected), plain UTF-8 validation, then strict GB18030 and GBK
/// decoding. The first attempt that yields valid UTF-8 wins.
pub fn normalize_utf8(bytes: &[u8]) -> Result<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(s) = std::str::from_utf8(rest) {
            return Ok(s.to_string());
        }
        return decode_legacy(rest);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_strict(encoding_rs::UTF_16LE, rest, "UTF-16LE");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_strict(encoding_rs::UTF_16BE, rest, "UTF-16BE");
    }
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Ok(s.to_string());
    }
    decode_legacy(bytes)
}

fn decode_strict(
    encoding: &'static encoding_rs::Encoding,
    bytes: &[u8],
    label: &str,
) -> Result<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
        .ok_or_else(|| RagError::Encoding(format!("failed to decode {label}")))
}

fn decode_legacy(bytes: &[u8]) -> Result<String> {
    for encoding in [encoding_rs::GB18030, encoding_rs::GBK] {
        if let Some(s) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return Ok(s.into_owned());
        }
    }
    Err(RagError::Encoding(
        "text is not valid UTF-8 (try saving as UTF-8/UTF-8 BOM, or GB18030/GBK)".to_string(),
    ))
}

/// Rewrite every invalid byte sequence to `?` without failing.
///
/// Used on anything that leaves the process as JSON, HTML, or prompt text and
/// did not originate as a Rust `String`.
pub fn sanitize_utf8_strict(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(e) => {
                out.push_str(&String::from_utf8_lossy(&rest[..e.valid_up_to()]));
                out.push('?');
                let after = &rest[e.valid_up_to()..];
                let skip = e.error_len().unwrap_or(after.len());
                rest = &after[skip.min(after.len())..];
                if rest.is_empty() {
                    break;
                }
            }
        }
    }
    out
}

/// Split text into lowercase ASCII word tokens plus one token per non-ASCII
/// codepoint. Single-character ASCII tokens are dropped as noise; single
/// CJK codepoints are kept.
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_ascii() {
            if ch.is_ascii_alphanumeric() {
                current.push(ch.to_ascii_lowercase());
            } else {
                flush_token(&mut current, &mut tokens);
            }
        } else {
            flush_token(&mut current, &mut tokens);
            tokens.push(ch.to_string());
        }
    }
    flush_token(&mut current, &mut tokens);

    tokens
}

fn flush_token(current: &mut String, tokens: &mut Vec<String>) {
    if current.len() > 1 {
        tokens.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Largest index `<= max_bytes` that falls on a codepoint boundary.
#[inline]
pub fn floor_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Cap a string at `max_bytes` bytes without splitting a codepoint.
#[inline]
pub fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    &s[..floor_char_boundary(s, max_bytes)]
}

/// Truncate to roughly `max_bytes` with a `...` suffix, never cutting inside
/// a multi-byte sequence.
pub fn shorten_text(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut cut = max_bytes;
    if cut > 3 {
        cut -= 3;
    }
    let mut out = truncate_on_char_boundary(s, cut).to_string();
    out.push_str("...");
    out
}
