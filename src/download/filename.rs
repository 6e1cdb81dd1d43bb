//! Filename guessing and temp-file naming.
//!
//! A record keeps two guesses for the eventual file name: one derived from
//! the URL path, one from a `Content-Disposition` header. Neither is used
//! for the temp file, whose name is a hash of the URL so that a restart
//! finds the same partial file again.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Suffix of every temp file.
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Candidate names for the finished download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilenameGuesses {
    /// Last path segment of the URL.
    pub from_url: Option<String>,
    /// Name suggested by the server's `Content-Disposition` header.
    pub from_header: Option<String>,
}

impl FilenameGuesses {
    /// Returns the server's suggestion, falling back to the URL guess.
    #[must_use]
    pub fn preferred(&self) -> Option<&str> {
        self.from_header.as_deref().or(self.from_url.as_deref())
    }

    /// Records a header guess unless one was already captured.
    ///
    /// Returns true when the guess was stored.
    pub fn capture_header_guess(&mut self, guess: Option<String>) -> bool {
        if self.from_header.is_some() {
            return false;
        }
        match guess {
            Some(name) => {
                self.from_header = Some(name);
                true
            }
            None => false,
        }
    }
}

/// Deterministic temp-file name for `url`: the hex SHA-256 of the URL plus `.tmp`.
#[must_use]
pub fn temp_file_name(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("{digest:x}{TEMP_FILE_SUFFIX}")
}

/// Guesses a filename from the URL path's last segment.
///
/// Returns `None` for an empty path (`https://host/`) or a trailing slash.
#[must_use]
pub fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    let sanitized = sanitize_filename(&decoded);
    (!sanitized.trim_matches('_').is_empty()).then_some(sanitized)
}

/// Parses a `Content-Disposition` header value and returns a sanitized filename.
#[must_use]
pub fn filename_from_disposition(header: &str) -> Option<String> {
    parse_content_disposition(header)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.trim_matches('_').is_empty())
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
///
/// Parameter names match case-insensitively.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets valid for `header`
    let lowered = header.to_ascii_lowercase();

    // filename*= wins over filename= when both are present
    if let Some(pos) = lowered.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = lowered.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and control characters, and neutralizes
/// `.`/`..` so the result is always a single path segment.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
