//! Line normalization for the TCP side.
//!
//! The TCP peer speaks a newline-delimited protocol, while WebSocket frame
//! boundaries carry no such guarantee. Every payload written to the stream
//! passes through [`normalize_line`] first.

/// Ensure `payload` ends with a newline.
///
/// Payloads already ending in `\n` are returned unchanged; everything else
/// gets one `\n` appended. Binary payloads are decoded as UTF-8, with
/// invalid sequences replaced.
#[must_use]
pub fn normalize_line(payload: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(payload).into_owned();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}
