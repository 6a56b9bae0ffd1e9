//! Result-asset extraction from vendor payloads.
//!
//! Vendors disagree about where result URLs live, so extraction walks a
//! fallback chain: the documented field first, then known alternates, then a
//! deep scan of whatever JSON came back. A candidate only counts once a
//! lightweight probe confirms it actually serves media; a 200 with an HTML
//! error page behind it must not end up in a user's library.

use async_trait::async_trait;
use tracing::debug;
use url::Url;

const MEDIA_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "gif", "mp4", "mov", "webm", "mp3", "wav", "ogg",
];

/// Existence/content check for a candidate asset URL.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// True when the URL serves binary media content.
    async fn is_media(&self, url: &str) -> bool;
}

/// HEAD-based probe over reqwest.
#[derive(Debug, Clone)]
pub struct HttpMediaProbe {
    client: reqwest::Client,
}

impl HttpMediaProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpMediaProbe {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl MediaProbe for HttpMediaProbe {
    async fn is_media(&self, url: &str) -> bool {
        let response = match self.client.head(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url, error = %e, "asset probe request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            return false;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        content_type.starts_with("image/")
            || content_type.starts_with("video/")
            || content_type.starts_with("audio/")
            || content_type.starts_with("application/octet-stream")
    }
}

/// Probe that accepts every well-formed URL. For tests and dev wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllProbe;

#[async_trait]
impl MediaProbe for AcceptAllProbe {
    async fn is_media(&self, _url: &str) -> bool {
        true
    }
}

/// Pull URL candidates out of a vendor result payload, in fallback order.
pub fn extract_candidates(result: &serde_json::Value) -> Vec<String> {
    // Primary and alternate result fields.
    for field in ["resultUrls", "outputs"] {
        if let Some(urls) = result.get(field).and_then(string_array) {
            if !urls.is_empty() {
                return urls;
            }
        }
    }

    // Bare array / bare string payloads.
    if let Some(urls) = string_array(result) {
        if !urls.is_empty() {
            return urls;
        }
    }
    if let Some(s) = result.as_str() {
        if looks_like_media_url(s) {
            return vec![s.to_string()];
        }
    }

    // Last resort: any well-formed media URL anywhere in the blob.
    let mut found = Vec::new();
    scan_urls(result, &mut found);
    found
}

/// Filter candidates through the probe, preserving order, dropping dupes.
pub async fn extract_assets(result: &serde_json::Value, probe: &dyn MediaProbe) -> Vec<String> {
    let mut assets = Vec::new();
    for candidate in extract_candidates(result) {
        if assets.contains(&candidate) {
            continue;
        }
        if probe.is_media(&candidate).await {
            assets.push(candidate);
        } else {
            debug!(url = %candidate, "candidate rejected by media probe");
        }
    }
    assets
}

fn string_array(value: &serde_json::Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect()
    })
}

fn scan_urls(value: &serde_json::Value, found: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            if looks_like_media_url(s) && !found.contains(s) {
                found.push(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                scan_urls(item, found);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                scan_urls(item, found);
            }
        }
        _ => {}
    }
}

fn looks_like_media_url(s: &str) -> bool {
    let Ok(url) = Url::parse(s) else {
        return false;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    let path = url.path().to_ascii_lowercase();
    MEDIA_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(&format!(".{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primary_field_wins_over_deep_scan() {
        let payload = json!({
            "resultUrls": ["https://cdn.example/a.png"],
            "debug": { "trace": "https://cdn.example/ignored.png" }
        });
        assert_eq!(
            extract_candidates(&payload),
            vec!["https://cdn.example/a.png"]
        );
    }

    #[test]
    fn falls_back_to_outputs_then_array_then_string() {
        let payload = json!({ "outputs": ["https://cdn.example/b.mp4"] });
        assert_eq!(
            extract_candidates(&payload),
            vec!["https://cdn.example/b.mp4"]
        );

        let payload = json!(["https://cdn.example/c.webp", "https://cdn.example/d.webp"]);
        assert_eq!(extract_candidates(&payload).len(), 2);

        let payload = json!("https://cdn.example/e.jpg");
        assert_eq!(extract_candidates(&payload), vec!["https://cdn.example/e.jpg"]);
    }

    #[test]
    fn deep_scan_finds_urls_in_free_form_blobs() {
        let payload = json!({
            "data": {
                "nested": [{ "video": "https://cdn.example/out.mp4" }],
                "note": "rendered ok"
            }
        });
        assert_eq!(
            extract_candidates(&payload),
            vec!["https://cdn.example/out.mp4"]
        );
    }

    #[test]
    fn non_media_and_malformed_urls_are_ignored() {
        let payload = json!({
            "data": ["https://example.com/error.html", "not a url", "ftp://cdn/x.png"]
        });
        assert!(extract_candidates(&payload).is_empty());
    }

    #[tokio::test]
    async fn accept_all_probe_keeps_every_candidate() {
        let payload = json!({
            "outputs": ["https://cdn.example/a.png", "https://cdn.example/b.png"]
        });
        let assets = extract_assets(&payload, &AcceptAllProbe).await;
        assert_eq!(assets.len(), 2);
    }

    struct RejectingProbe;

    #[async_trait]
    impl MediaProbe for RejectingProbe {
        async fn is_media(&self, url: &str) -> bool {
            !url.contains("dead")
        }
    }

    #[tokio::test]
    async fn probe_filters_and_dedupes() {
        let payload = json!({
            "resultUrls": [
                "https://cdn.example/a.png",
                "https://cdn.example/dead.png",
                "https://cdn.example/a.png"
            ]
        });
        let assets = extract_assets(&payload, &RejectingProbe).await;
        assert_eq!(assets, vec!["https://cdn.example/a.png"]);
    }
}
