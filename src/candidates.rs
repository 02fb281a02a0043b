//! Candidate transport URL generation.
//!
//! Pure string construction: no network access, no state. Order mirrors how reliably each
//! variant works across camera firmware, pull-stream (RTSP) first, then HTTP pull.
//! Credentials are never rendered into the URL; transports apply them through their own
//! authentication mechanism.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::endpoint::CameraEndpoint;
use crate::error::ConfigError;

/// RTSP paths observed across firmware revisions.
const PULL_STREAM_PATHS: &[&str] = &[
    "/cam/realmonitor?channel=1&subtype=0",
    "/video1",
    "/ch1/main",
    "/stream1",
];

/// HTTP MJPEG endpoints first, then single-image endpoints.
const HTTP_PULL_PATHS: &[&str] = &[
    "/videostream.cgi",
    "/mjpeg",
    "/video.mjpg",
    "/cam/realmonitor?channel=1&subtype=0",
    "/axis-cgi/mjpg/video.cgi",
    "/video",
    "/video1.mjpg",
    "/snapshot.cgi",
    "/cgi-bin/snapshot.cgi",
    "/tmpfs/auto.jpg",
    "/image.jpg",
    "/snapshot.jpg",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportScheme {
    /// Continuous pixel stream (RTSP).
    PullStream,
    /// HTTP MJPEG stream or discrete JPEG fetch.
    HttpPull,
}

impl TransportScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::PullStream => "pull-stream",
            TransportScheme::HttpPull => "http-pull",
        }
    }
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransportCandidate {
    pub scheme: TransportScheme,
    pub path_template: String,
    pub url: String,
}

impl TransportCandidate {
    pub fn new(scheme: TransportScheme, path_template: &str, url: String) -> Self {
        Self {
            scheme,
            path_template: path_template.to_string(),
            url,
        }
    }
}

/// Build the ordered candidate list for an endpoint.
///
/// Fails only if the endpoint is malformed; a validated `CameraEndpoint` always yields a
/// non-empty list.
pub fn generate_candidates(endpoint: &CameraEndpoint) -> Result<Vec<TransportCandidate>, ConfigError> {
    if endpoint.host().trim().is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    let host = endpoint.url_host();
    let rtsp_base = format!("rtsp://{}:{}", host, endpoint.rtsp_port());
    let http_base = format!("http://{}:{}", host, endpoint.port());

    let rendered = PULL_STREAM_PATHS
        .iter()
        .map(|path| (TransportScheme::PullStream, *path, format!("{rtsp_base}{path}")))
        .chain(
            HTTP_PULL_PATHS
                .iter()
                .map(|path| (TransportScheme::HttpPull, *path, format!("{http_base}{path}"))),
        );

    let mut seen = HashSet::new();
    let candidates: Vec<TransportCandidate> = rendered
        .filter(|(_, _, url)| seen.insert(url.clone()))
        .map(|(scheme, path, url)| TransportCandidate::new(scheme, path, url))
        .collect();

    if candidates.is_empty() {
        return Err(ConfigError::Invalid("no transport candidates".to_string()));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Credentials;

    fn endpoint() -> CameraEndpoint {
        CameraEndpoint::new(
            "192.168.1.108",
            Credentials::new("admin", "secret"),
            80,
            554,
            "ITC231-RF1A-IR",
        )
        .unwrap()
    }

    #[test]
    fn candidate_order_is_deterministic() {
        let first = generate_candidates(&endpoint()).unwrap();
        for _ in 0..5 {
            assert_eq!(generate_candidates(&endpoint()).unwrap(), first);
        }
    }

    #[test]
    fn pull_stream_variants_come_first() {
        let candidates = generate_candidates(&endpoint()).unwrap();
        let first_http = candidates
            .iter()
            .position(|c| c.scheme == TransportScheme::HttpPull)
            .unwrap();
        assert_eq!(first_http, PULL_STREAM_PATHS.len());
        assert!(candidates[..first_http]
            .iter()
            .all(|c| c.scheme == TransportScheme::PullStream));
        assert!(candidates[first_http..]
            .iter()
            .all(|c| c.scheme == TransportScheme::HttpPull));
        assert_eq!(
            candidates[0].url,
            "rtsp://192.168.1.108:554/cam/realmonitor?channel=1&subtype=0"
        );
        assert_eq!(candidates[first_http].url, "http://192.168.1.108:80/videostream.cgi");
    }

    #[test]
    fn urls_never_embed_credentials() {
        for candidate in generate_candidates(&endpoint()).unwrap() {
            assert!(!candidate.url.contains("admin"), "{}", candidate.url);
            assert!(!candidate.url.contains("secret"), "{}", candidate.url);
            assert!(!candidate.url.contains('@'), "{}", candidate.url);
        }
    }

    #[test]
    fn custom_ports_are_rendered() {
        let endpoint =
            CameraEndpoint::new("cam.local", Credentials::default(), 8080, 8554, "m").unwrap();
        let candidates = generate_candidates(&endpoint).unwrap();
        assert!(candidates[0].url.starts_with("rtsp://cam.local:8554/"));
        assert!(candidates
            .last()
            .unwrap()
            .url
            .starts_with("http://cam.local:8080/"));
    }

    #[test]
    fn scheme_serializes_kebab_case() {
        let json = serde_json::to_string(&TransportScheme::HttpPull).unwrap();
        assert_eq!(json, "\"http-pull\"");
    }
}
