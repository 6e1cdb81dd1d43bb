//! User-Agent string for download traffic.

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/apoklayptik/downloader";

/// Default User-Agent for probe and fetch requests (identifies the tool).
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("downloader/{version} (resumable-download-engine; +{PROJECT_UA_URL})")
}
