//! URL and input validation utilities

use anyhow::{anyhow, bail, Result};
use url::Url;

/// Validate URL syntax
pub fn validate_url(url: &str) -> Result<Url> {
    Url::parse(url.trim()).map_err(|e| anyhow!("Invalid URL format: {}", e))
}

/// Check that a submitted URL points at an HLS playlist on an allowed host.
///
/// `allow_insecure` permits plain `http` (local fixtures only).
pub fn validate_stream_url(url: &str, allowed_hosts: &[String], allow_insecure: bool) -> Result<Url> {
    let parsed = validate_url(url)?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        other => bail!("Unsupported URL scheme: {}", other),
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host"))?
        .to_ascii_lowercase();
    if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
        bail!("Host {} is not an allowed streaming host", host);
    }

    if !parsed.path().to_ascii_lowercase().ends_with(".m3u8") {
        bail!("URL does not reference an .m3u8 playlist");
    }

    Ok(parsed)
}

/// Strip the query string (signing tokens) from a URL before logging it
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?…", base),
        None => url.to_string(),
    }
}

/// Check if URL is an http(s) URL
pub fn is_valid_video_url(url: &str) -> bool {
    if let Ok(parsed) = Url::parse(url) {
        let scheme = parsed.scheme();
        scheme == "http" || scheme == "https"
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux_hosts() -> Vec<String> {
        vec!["stream.mux.com".to_string()]
    }

    #[test]
    fn test_accepts_signed_mux_url() {
        let url = "https://stream.mux.com/OABpWBZb02bR.m3u8?token=eyJhbGciOi";
        let parsed = validate_stream_url(url, &mux_hosts(), false).unwrap();
        assert_eq!(parsed.host_str(), Some("stream.mux.com"));
        assert!(parsed.query().unwrap().starts_with("token="));
    }

    #[test]
    fn test_rejects_foreign_host_and_scheme() {
        assert!(validate_stream_url("https://example.com/a.m3u8", &mux_hosts(), false).is_err());
        assert!(validate_stream_url("http://stream.mux.com/a.m3u8", &mux_hosts(), false).is_err());
        assert!(validate_stream_url("http://stream.mux.com/a.m3u8", &mux_hosts(), true).is_ok());
        assert!(validate_stream_url("https://stream.mux.com/a.mp4", &mux_hosts(), false).is_err());
        assert!(validate_stream_url("not a url", &mux_hosts(), false).is_err());
    }

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("https://stream.mux.com/a.m3u8?token=secret"),
            "https://stream.mux.com/a.m3u8?…"
        );
        assert_eq!(redact_query("https://h/a.ts"), "https://h/a.ts");
    }

    #[test]
    fn test_is_valid_video_url() {
        assert!(is_valid_video_url("https://stream.mux.com/x.m3u8"));
        assert!(!is_valid_video_url("ftp://example.com/x"));
    }
}
