//! URL canonicalization and crawl-scope admission.
//!
//! Every URL that enters the frontier passes through [`canonicalize`] first,
//! so the rest of the crawler only ever compares canonical forms byte for
//! byte. Admission applies the domain/path/extension policy derived from the
//! seed URL.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Two-label public suffixes that make the registrable domain three labels
/// (`example.co.uk` is one registrable, not `co.uk`).
const TWO_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.nz", "co.jp",
    "com.br", "com.mx", "co.in", "com.cn", "com.sg", "co.za", "com.ar", "co.kr",
];

/// Query parameters stripped during canonicalization unless overridden.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid", "gclid",
    "ref",
];

/// File extensions that never lead to a crawlable page.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    // Static assets
    "css", "js", "map", // Images
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "ico", "tif", "tiff", // Audio/video
    "mp3", "wav", "ogg", "mp4", "avi", "mov", "flv", "wmv", "webm", "mkv", // Documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "rtf", "csv", // Archives
    "zip", "rar", "tar", "gz", "tgz", "7z", "bz2", // Executables
    "exe", "dll", "so", "bin", "apk", "dmg", "iso", "msi", // Fonts
    "ttf", "otf", "woff", "woff2", "eot", // Other
    "swf", "dat",
];

/// Extensions that are always treated as webpages.
const WEBPAGE_EXTENSIONS: &[&str] =
    &["html", "htm", "php", "asp", "aspx", "jsp", "do", "xhtml", "shtml"];

/// A URL in canonical form. Constructed only by [`canonicalize`]; two URLs
/// are the same page iff their canonical forms are byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a [`Url`]. Canonical forms always re-parse.
    pub fn parsed(&self) -> Url {
        Url::parse(&self.0).expect("canonical URL must re-parse")
    }

    pub fn host(&self) -> String {
        self.parsed().host_str().unwrap_or_default().to_string()
    }

    pub fn path(&self) -> String {
        self.parsed().path().to_string()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Typed rejection from canonicalization or admission. Never panics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("malformed URL: {0}")]
    Malformed(String),
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    #[error("URL contains control characters")]
    ControlCharacters,
    #[error("host {0} is outside the crawl scope")]
    OutOfScope(String),
    #[error("path does not start with the required prefix")]
    PathPrefix,
    #[error("excluded file extension: .{0}")]
    Extension(String),
}

/// Resolve `raw` against `base` (when relative) and normalize it.
///
/// Rules: lowercase scheme and host, strip default ports, strip fragments,
/// strip the given tracking query parameters, collapse duplicate slashes in
/// the path, and keep a trailing slash only for the empty path.
pub fn canonicalize(
    raw: &str,
    base: Option<&Url>,
    tracking_params: &[String],
) -> Result<CanonicalUrl, AdmissionError> {
    let trimmed = raw.trim();
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(AdmissionError::ControlCharacters);
    }

    let mut parsed = match base {
        Some(b) => b
            .join(trimmed)
            .map_err(|e| AdmissionError::Malformed(e.to_string()))?,
        None => Url::parse(trimmed).map_err(|e| AdmissionError::Malformed(e.to_string()))?,
    };

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(AdmissionError::Scheme(other.to_string())),
    }
    if parsed.host_str().is_none() {
        return Err(AdmissionError::Malformed("missing host".into()));
    }

    parsed.set_fragment(None);

    // Drop tracking parameters; drop the query entirely when nothing is left.
    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !tracking_params.iter().any(|t| t == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let query = kept
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{}={}", k, v)
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            parsed.set_query(Some(&query));
        }
    }

    // Collapse duplicate slashes, then trim the trailing slash for non-root paths.
    let mut path = parsed.path().to_string();
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }
    parsed.set_path(&path);

    // The url crate already lowercases scheme/host and drops default ports.
    Ok(CanonicalUrl(parsed.to_string()))
}

/// Attach a fragment to an already-canonical URL. Used for synthetic SPA
/// routes, the one place where fragments carry navigation state and must
/// survive deduplication.
pub fn with_fragment(url: &CanonicalUrl, fragment: &str) -> CanonicalUrl {
    let mut parsed = url.parsed();
    parsed.set_fragment(Some(fragment));
    CanonicalUrl(parsed.to_string())
}

/// Return the registrable domain using a last-two-label heuristic widened
/// for common two-label public suffixes.
pub fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return host.to_string();
    }
    let last_two = labels[labels.len() - 2..].join(".");
    if TWO_LABEL_SUFFIXES.contains(&last_two.as_str()) && labels.len() >= 3 {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Domain rule derived from the seed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainScope {
    /// Stay on the seed host exactly (www-insensitive). Default.
    ExactHost(String),
    /// Any subdomain of the registrable domain.
    Subdomains(String),
    /// Restricted to one explicit host.
    Host(String),
}

/// Admission policy: domain scope, optional path prefix, extension rules.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    scope: DomainScope,
    path_prefix: Option<String>,
    allowed_extensions: HashSet<String>,
}

impl ScopePolicy {
    pub fn from_seed(
        seed: &CanonicalUrl,
        allow_subdomains: bool,
        path_prefix: Option<String>,
        allowed_extensions: &[String],
    ) -> Self {
        let host = seed.host();
        let scope = if allow_subdomains {
            DomainScope::Subdomains(registrable_domain(strip_www(&host)))
        } else {
            DomainScope::ExactHost(host)
        };
        Self {
            scope,
            path_prefix,
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn restricted_to_host(host: &str) -> Self {
        Self {
            scope: DomainScope::Host(host.to_string()),
            path_prefix: None,
            allowed_extensions: HashSet::new(),
        }
    }

    /// Decide whether a canonical URL is in scope for this crawl.
    pub fn admit(&self, url: &CanonicalUrl) -> Result<(), AdmissionError> {
        let parsed = url.parsed();
        let host = parsed.host_str().unwrap_or_default();

        let in_scope = match &self.scope {
            DomainScope::ExactHost(seed_host) => strip_www(host) == strip_www(seed_host),
            DomainScope::Subdomains(registrable) => {
                let host = strip_www(host);
                host == registrable || host.ends_with(&format!(".{}", registrable))
            }
            DomainScope::Host(only) => host == only,
        };
        if !in_scope {
            return Err(AdmissionError::OutOfScope(host.to_string()));
        }

        if let Some(prefix) = &self.path_prefix {
            let path = parsed.path();
            // The canonical form trims trailing slashes, so "/docs" must
            // still satisfy the prefix "/docs/".
            if !path.starts_with(prefix.as_str()) && prefix.trim_end_matches('/') != path {
                return Err(AdmissionError::PathPrefix);
            }
        }

        if let Some(ext) = path_extension(parsed.path()) {
            let excluded = EXCLUDED_EXTENSIONS.contains(&ext.as_str());
            let webpage =
                WEBPAGE_EXTENSIONS.contains(&ext.as_str()) || self.allowed_extensions.contains(&ext);
            if excluded && !webpage {
                return Err(AdmissionError::Extension(ext));
            }
        }

        Ok(())
    }
}

/// Extension of the last path segment, lowercased. A trailing slash or a
/// segment without a dot yields `None` (treated as webpage).
fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str) -> CanonicalUrl {
        canonicalize(raw, None, &[]).unwrap()
    }

    #[test]
    fn test_canonicalize_basics() {
        assert_eq!(canon("HTTP://Example.COM/Page").as_str(), "http://example.com/Page");
        assert_eq!(canon("http://example.com:80/a").as_str(), "http://example.com/a");
        assert_eq!(canon("https://example.com:443/a").as_str(), "https://example.com/a");
        assert_eq!(canon("http://example.com/a#frag").as_str(), "http://example.com/a");
        assert_eq!(canon("http://example.com//a///b").as_str(), "http://example.com/a/b");
        assert_eq!(canon("http://example.com/a/").as_str(), "http://example.com/a");
        assert_eq!(canon("http://example.com").as_str(), "http://example.com/");
        assert_eq!(canon("http://example.com:8080/a").as_str(), "http://example.com:8080/a");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        for raw in [
            "http://example.com//x/?b=2&a=1#f",
            "https://Example.com:443/deep/path/",
            "http://example.com",
        ] {
            let once = canon(raw);
            let twice = canonicalize(once.as_str(), None, &[]).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_canonicalize_tracking_params() {
        let tracking: Vec<String> =
            DEFAULT_TRACKING_PARAMS.iter().map(|s| s.to_string()).collect();
        let url = canonicalize(
            "http://example.com/a?utm_source=x&q=1&fbclid=abc",
            None,
            &tracking,
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://example.com/a?q=1");

        let all_stripped =
            canonicalize("http://example.com/a?utm_source=x", None, &tracking).unwrap();
        assert_eq!(all_stripped.as_str(), "http://example.com/a");
    }

    #[test]
    fn test_canonicalize_rejects() {
        assert!(matches!(
            canonicalize("ftp://example.com/a", None, &[]),
            Err(AdmissionError::Scheme(_))
        ));
        assert!(matches!(
            canonicalize("http://example.com/a\x07b", None, &[]),
            Err(AdmissionError::ControlCharacters)
        ));
        assert!(canonicalize("not a url", None, &[]).is_err());
    }

    #[test]
    fn test_canonicalize_relative() {
        let base = Url::parse("http://example.com/docs/intro").unwrap();
        assert_eq!(
            canonicalize("../api/", Some(&base), &[]).unwrap().as_str(),
            "http://example.com/api"
        );
        assert_eq!(
            canonicalize("guide.html", Some(&base), &[]).unwrap().as_str(),
            "http://example.com/docs/guide.html"
        );
    }

    #[test]
    fn test_with_fragment() {
        let base = canon("http://example.com/app");
        let synthetic = with_fragment(&base, "section-pricing");
        assert_eq!(synthetic.as_str(), "http://example.com/app#section-pricing");
        // Distinct fragments stay distinct for deduplication.
        assert_ne!(synthetic, with_fragment(&base, "section-about"));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("api.staging.example.com"), "example.com");
        assert_eq!(registrable_domain("shop.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_domain("localhost"), "localhost");
    }

    #[test]
    fn test_admit_exact_host() {
        let seed = canon("http://example.com/");
        let policy = ScopePolicy::from_seed(&seed, false, None, &[]);
        assert!(policy.admit(&canon("http://example.com/page")).is_ok());
        assert!(policy.admit(&canon("http://www.example.com/page")).is_ok());
        assert!(policy.admit(&canon("http://other.com/page")).is_err());
        assert!(policy.admit(&canon("http://sub.example.com/page")).is_err());
    }

    #[test]
    fn test_admit_subdomains() {
        let seed = canon("http://example.com/");
        let policy = ScopePolicy::from_seed(&seed, true, None, &[]);
        assert!(policy.admit(&canon("http://docs.example.com/x")).is_ok());
        assert!(policy.admit(&canon("http://example.com/x")).is_ok());
        assert!(policy.admit(&canon("http://example.org/x")).is_err());
    }

    #[test]
    fn test_admit_explicit_host() {
        let policy = ScopePolicy::restricted_to_host("docs.example.com");
        assert!(policy.admit(&canon("http://docs.example.com/x")).is_ok());
        assert!(policy.admit(&canon("http://example.com/x")).is_err());
        assert!(policy.admit(&canon("http://www.docs.example.com/x")).is_err());
    }

    #[test]
    fn test_admit_path_prefix() {
        let seed = canon("http://example.com/docs/");
        let policy = ScopePolicy::from_seed(&seed, false, Some("/docs/".into()), &[]);
        assert!(policy.admit(&canon("http://example.com/docs/x")).is_ok());
        // The seed itself canonicalizes to /docs and must stay admitted.
        assert!(policy.admit(&canon("http://example.com/docs/")).is_ok());
        assert!(policy.admit(&canon("http://example.com/blog/y")).is_err());
    }

    #[test]
    fn test_admit_extensions() {
        let seed = canon("http://example.com/");
        let policy = ScopePolicy::from_seed(&seed, false, None, &[]);
        assert!(policy.admit(&canon("http://example.com/a.pdf")).is_err());
        assert!(policy.admit(&canon("http://example.com/a.jpg")).is_err());
        assert!(policy.admit(&canon("http://example.com/a.html")).is_ok());
        assert!(policy.admit(&canon("http://example.com/about")).is_ok());
        assert!(policy.admit(&canon("http://example.com/dir/")).is_ok());

        let policy = ScopePolicy::from_seed(&seed, false, None, &["pdf".into()]);
        assert!(policy.admit(&canon("http://example.com/a.pdf")).is_ok());
    }
}
