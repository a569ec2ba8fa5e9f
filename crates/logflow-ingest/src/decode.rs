//! Byte and percent decoding for raw log lines
//!
//! Legacy servers wrote Latin-1 bytes into otherwise UTF-8 logs, and some
//! intermediaries log request targets that were percent-encoded twice. Both
//! decoders here are total: every byte sequence produces a string.

use std::borrow::Cow;

/// Decode one raw line, trying UTF-8 first and falling back to Latin-1
///
/// Trailing `\n` / `\r\n` is removed. The Latin-1 fallback maps every byte to
/// the code point of the same value, so it cannot fail.
pub fn decode_line_bytes(raw: &[u8]) -> Cow<'_, str> {
    let raw = trim_line_ending(raw);
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Decode `%XX` escapes once
///
/// Malformed escapes are kept verbatim and byte sequences that are not UTF-8
/// after decoding become U+FFFD. `+` is left alone.
pub fn percent_decode(text: &str) -> Cow<'_, str> {
    if !text.contains('%') {
        return Cow::Borrowed(text);
    }

    match urlencoding::decode_binary(text.as_bytes()) {
        Cow::Borrowed(_) => Cow::Borrowed(text),
        Cow::Owned(bytes) => match String::from_utf8(bytes) {
            Ok(decoded) => Cow::Owned(decoded),
            Err(err) => Cow::Owned(String::from_utf8_lossy(err.as_bytes()).into_owned()),
        },
    }
}

/// Apply [`percent_decode`] twice
///
/// A second pass over text without escapes is a no-op.
pub fn percent_decode_twice(text: &str) -> String {
    let once = percent_decode(text);
    percent_decode(&once).into_owned()
}
