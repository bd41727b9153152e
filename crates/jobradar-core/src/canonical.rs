//! URL canonicalization and the digests that give postings a stable identity.

use sha2::{Digest, Sha256};
use url::Url;

use crate::{NormalizedPosting, RawPosting};

const TRACKING_PREFIX: &str = "utm_";
const FINGERPRINT_DESCRIPTION_CHARS: usize = 200;

pub const DEFAULT_COMPANY: &str = "Unknown";
pub const DEFAULT_LOCATION: &str = "Remote";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase, drop the fragment and `utm_*` query pairs, strip trailing separators.
///
/// Applying it to its own output returns the same string. Input that does not
/// parse as an absolute URL only loses its fragment and trailing separators.
pub fn canonical_url(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let rebuilt = match Url::parse(&lowered) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(key, _)| !key.starts_with(TRACKING_PREFIX))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if kept.is_empty() {
                parsed.set_query(None);
            } else {
                parsed.query_pairs_mut().clear().extend_pairs(kept);
            }
            parsed.to_string()
        }
        Err(_) => lowered
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    rebuilt
        .trim_end_matches(|c| c == '/' || c == '?' || c == '&')
        .to_string()
}

fn norm(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

/// Content-independent identity. Prefers `source|canonical_url`; falls back to
/// descriptive fields when the posting has no usable URL.
pub fn identity_key(
    title: &str,
    company: Option<&str>,
    url: Option<&str>,
    source: &str,
    post_date: Option<&str>,
    location: Option<&str>,
) -> String {
    let source = norm(Some(source));
    let canonical = url.map(canonical_url).unwrap_or_default();
    if !canonical.is_empty() {
        return sha256_hex(format!("{source}|{canonical}").as_bytes());
    }
    let material = [
        source,
        norm(Some(title)),
        norm(company),
        norm(location),
        norm(post_date),
    ]
    .join("|");
    sha256_hex(material.as_bytes())
}

pub fn content_fingerprint(posting: &RawPosting) -> String {
    let description: String = posting
        .description
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(FINGERPRINT_DESCRIPTION_CHARS)
        .collect();
    let material = [
        norm(Some(&posting.title)),
        norm(posting.company.as_deref()),
        norm(posting.location.as_deref()),
        norm(Some(&description)),
    ]
    .join("|");
    sha256_hex(material.as_bytes())
}

/// Legacy digest kept for the indexed `content_hash` column.
pub fn content_hash(source: &str, title: &str, company: Option<&str>, canonical: Option<&str>) -> String {
    let material = [norm(Some(source)), norm(Some(title)), norm(company), norm(canonical)].join("|");
    sha256_hex(material.as_bytes())
}

/// Build the normalized form. Keys are computed from the raw values before any
/// display default is applied.
pub fn normalize(raw: &RawPosting) -> NormalizedPosting {
    let canonical = raw
        .url
        .as_deref()
        .map(canonical_url)
        .filter(|c| !c.is_empty());

    let identity = identity_key(
        &raw.title,
        raw.company.as_deref(),
        raw.url.as_deref(),
        &raw.source,
        raw.post_date.as_deref(),
        raw.location.as_deref(),
    );
    let hash = content_hash(&raw.source, &raw.title, raw.company.as_deref(), canonical.as_deref());
    let fingerprint = content_fingerprint(raw);

    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    NormalizedPosting {
        title: raw.title.trim().to_string(),
        company: non_blank(&raw.company).unwrap_or_else(|| DEFAULT_COMPANY.to_string()),
        location: non_blank(&raw.location).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        url: raw.url.clone(),
        canonical_url: canonical,
        description: non_blank(&raw.description).unwrap_or_else(|| raw.title.trim().to_string()),
        post_date: raw.post_date.clone(),
        source: raw.source.clone(),
        source_meta: raw.source_meta.clone(),
        remote: raw.remote,
        identity_key: identity,
        content_hash: hash,
        content_fingerprint: fingerprint,
        relevance_score: 0.0,
        keywords_matched: None,
    }
}
