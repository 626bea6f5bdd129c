use thiserror::Error;

/// Failure to decode a percent-encoded path
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EscapeError {
    #[error("invalid escape sequence {0:?}")]
    InvalidEscape(String),

    #[error("escaped bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Decode `%XX` triples in a URL path
///
/// `+` is left alone. Every `%` must be followed by two hex digits and the
/// decoded bytes must form valid UTF-8.
pub fn path_unescape(s: &str) -> Result<String, EscapeError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(EscapeError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EscapeError::InvalidUtf8)
}

/// Decode a path from a remote listing, keeping the input if it is malformed
pub fn unescape_lossy(s: &str) -> String {
    match path_unescape(s) {
        Ok(decoded) => decoded,
        Err(_) => s.to_string(),
    }
}
