//! Work item identity: payload normalization and fingerprinting for dedup.

use sha2::{Digest, Sha256};
use url::Url;

/// Derives the stable dedup key for a payload.
///
/// Must be deterministic; two payloads map to the same key exactly when they
/// should be treated as the same work item.
pub trait Fingerprint: Send + Sync {
    fn key(&self, payload: &str) -> String;
}

/// Fingerprint for URL payloads: normalize, then SHA-256 over the result.
#[derive(Debug, Clone, Default)]
pub struct UrlFingerprint;

impl Fingerprint for UrlFingerprint {
    fn key(&self, payload: &str) -> String {
        let normalized = normalize_url(payload);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Normalize a URL so equivalent spellings deduplicate to one key:
/// fragment stripped, query pairs sorted, scheme and host lowercased by the
/// parser. Non-URL payloads fall back to a fragment-strip + lowercase.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return match raw.find('#') {
            Some(pos) => raw[..pos].to_lowercase(),
            None => raw.to_lowercase(),
        };
    };

    url.set_fragment(None);

    if url.query().is_some() {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            let mut serializer = url.query_pairs_mut();
            serializer.clear();
            for (k, v) in &pairs {
                serializer.append_pair(k, v);
            }
            drop(serializer);
        }
    }

    url.to_string()
}

pub fn extract_host(payload: &str) -> Option<String> {
    Url::parse(payload)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_string()))
}

/// Default politeness target: the payload's host, or the payload itself for
/// non-URL payloads so they still throttle as a group.
pub fn host_target(payload: &str) -> String {
    extract_host(payload).unwrap_or_else(|| payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_stripped() {
        assert_eq!(
            normalize_url("https://test.local/page#section"),
            normalize_url("https://test.local/page")
        );
    }

    #[test]
    fn test_query_order_irrelevant() {
        assert_eq!(
            normalize_url("https://test.local/search?b=2&a=1"),
            normalize_url("https://test.local/search?a=1&b=2")
        );
    }

    #[test]
    fn test_host_case_irrelevant() {
        assert_eq!(
            normalize_url("https://Test.Local/Page"),
            normalize_url("https://test.local/Page")
        );
    }

    #[test]
    fn test_path_case_preserved() {
        assert_ne!(
            normalize_url("https://test.local/Page"),
            normalize_url("https://test.local/page")
        );
    }

    #[test]
    fn test_fingerprint_dedups_equivalent_urls() {
        let fp = UrlFingerprint;
        assert_eq!(
            fp.key("https://test.local/p?b=2&a=1#frag"),
            fp.key("https://test.local/p?a=1&b=2")
        );
        assert_ne!(
            fp.key("https://test.local/p"),
            fp.key("https://test.local/q")
        );
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://test.local/path"),
            Some("test.local".to_string())
        );
        assert_eq!(extract_host("not a url"), None);
    }

    #[test]
    fn test_host_target_fallback() {
        assert_eq!(host_target("https://test.local/a"), "test.local");
        assert_eq!(host_target("restaurant-42"), "restaurant-42");
    }
}
