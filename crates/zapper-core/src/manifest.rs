//! Manifest type inference from stream URLs

use url::Url;

/// DASH manifest MIME type
pub const DASH_MIME_TYPE: &str = "application/dash+xml";

/// HLS playlist MIME type
pub const HLS_MIME_TYPE: &str = "application/x-mpegurl";

/// Manifest types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Hls,
    Dash,
}

impl ManifestType {
    /// MIME hint passed to the engine's load call
    pub fn mime_type(&self) -> &'static str {
        match self {
            ManifestType::Hls => HLS_MIME_TYPE,
            ManifestType::Dash => DASH_MIME_TYPE,
        }
    }
}

/// Detect manifest type from the URL path extension.
///
/// Unknown extensions yield `None` so the engine sniffs the content itself.
pub fn detect_manifest_type(url: &Url) -> Option<ManifestType> {
    from_path(url.path())
}

/// MIME hint for a raw stream URL string
pub fn mime_hint(stream_url: &str) -> Option<&'static str> {
    let manifest_type = match Url::parse(stream_url) {
        Ok(url) => detect_manifest_type(&url),
        Err(_) => {
            let path = stream_url.split(['?', '#']).next().unwrap_or_default();
            from_path(path)
        }
    };
    manifest_type.map(|t| t.mime_type())
}

fn from_path(path: &str) -> Option<ManifestType> {
    let path = path.to_lowercase();
    if path.ends_with(".m3u8") {
        return Some(ManifestType::Hls);
    }
    if path.ends_with(".mpd") {
        return Some(ManifestType::Dash);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_hls() {
        let url = Url::parse("https://example.com/live/master.m3u8?token=abc").unwrap();
        assert_eq!(detect_manifest_type(&url), Some(ManifestType::Hls));
    }

    #[test]
    fn test_detect_dash() {
        let url = Url::parse("https://example.com/manifest.MPD").unwrap();
        assert_eq!(detect_manifest_type(&url), Some(ManifestType::Dash));
    }

    #[test]
    fn test_unknown_extension_has_no_hint() {
        assert_eq!(mime_hint("https://example.com/live/stream"), None);
        assert_eq!(mime_hint("https://example.com/live/index.ts"), None);
    }

    #[test]
    fn test_mime_hint_for_relative_urls() {
        assert_eq!(mime_hint("/streams/a.mpd#t=10"), Some(DASH_MIME_TYPE));
        assert_eq!(mime_hint("b.m3u8?x=1"), Some(HLS_MIME_TYPE));
    }
}
