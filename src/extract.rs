//! Link discovery from rendered HTML.
//!
//! Three passes feed the frontier: a structured `<a href>` scan, a lenient
//! regex sweep used as a safety net when the DOM parse yields few links, and
//! a scan of inline scripts for router-configuration path literals.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Below this many anchors the lenient fallback pass runs too.
pub const LENIENT_FALLBACK_THRESHOLD: usize = 5;

static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href\s*=\s*["']([^"'<>\s]+)["']"#).expect("href regex"));

/// Path-literal patterns used by common client-side routers.
static ROUTE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // React/Vue/Angular route tables
        r#"path:\s*["'`](/[^"'`]+)["'`]"#,
        // Imperative navigation calls
        r#"route\(["'`](/[^"'`]+)["'`]"#,
        r#"navigate\(["'`](/[^"'`]+)["'`]"#,
        // Router link components
        r#"to=["'`](/[^"'`]+)["'`]"#,
        // Hash-based routing
        r#"href=["'`](#/[^"'`]+)["'`]"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("route regex"))
    .collect()
});

fn is_crawlable_href(href: &str) -> bool {
    !href.is_empty()
        && !href.starts_with('#')
        && !href.starts_with("javascript:")
        && !href.starts_with("mailto:")
        && !href.starts_with("tel:")
        && !href.starts_with("data:")
        && !href.starts_with("file:")
}

/// Extract every `<a href>` from the rendered HTML, resolved against the
/// page's final URL. Duplicates are left for the frontier to reject.
pub fn extract_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("anchor selector");

    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            let href = href.trim();
            if !is_crawlable_href(href) {
                continue;
            }
            if let Ok(resolved) = base.join(href) {
                links.push(resolved.to_string());
            }
        }
    }
    links
}

/// Regex sweep over the serialized HTML. Catches hrefs the DOM parse lost to
/// malformed markup.
pub fn extract_links_lenient(html: &str, base: &Url) -> Vec<String> {
    let mut links = Vec::new();
    for capture in HREF_RE.captures_iter(html) {
        let href = capture[1].trim();
        if !is_crawlable_href(href) {
            continue;
        }
        if let Ok(resolved) = base.join(href) {
            links.push(resolved.to_string());
        }
    }
    links
}

/// Scan inline scripts for path-like string literals matching router
/// configurations and resolve them against the page origin.
pub fn extract_script_routes(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script:not([src])").expect("script selector");

    let origin = {
        let mut o = base.clone();
        o.set_path("/");
        o.set_query(None);
        o.set_fragment(None);
        o
    };

    let mut routes = Vec::new();
    for script in document.select(&selector) {
        let text: String = script.text().collect();
        if text.is_empty() {
            continue;
        }
        for re in ROUTE_RES.iter() {
            for capture in re.captures_iter(&text) {
                let path = &capture[1];
                if path.len() < 2 {
                    continue;
                }
                let path = path.strip_prefix("#").unwrap_or(path);
                if let Ok(resolved) = origin.join(path) {
                    routes.push(resolved.to_string());
                }
            }
        }
    }
    routes
}

/// Reduce clickable text to a fragment-safe slug for synthetic SPA URLs.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 48 {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://test.local/docs/intro").unwrap()
    }

    #[test]
    fn test_extract_links_resolves_relative() {
        let html = r#"<html><body>
            <a href="/about">About</a>
            <a href="guide">Guide</a>
            <a href="https://other.local/x">External</a>
        </body></html>"#;
        let links = extract_links(html, &base());
        assert_eq!(
            links,
            vec![
                "http://test.local/about",
                "http://test.local/docs/guide",
                "https://other.local/x",
            ]
        );
    }

    #[test]
    fn test_extract_links_skips_non_navigational() {
        let html = r##"<html><body>
            <a href="javascript:void(0)">JS</a>
            <a href="mailto:a@b.c">Mail</a>
            <a href="#section">Anchor</a>
            <a href="/real">Real</a>
        </body></html>"##;
        let links = extract_links(html, &base());
        assert_eq!(links, vec!["http://test.local/real"]);
    }

    #[test]
    fn test_extract_links_malformed_html() {
        let html = r#"<html><body><a href="/a">A<div><a href="/b">B<p>text"#;
        let links = extract_links(html, &base());
        assert_eq!(links, vec!["http://test.local/a", "http://test.local/b"]);
    }

    #[test]
    fn test_lenient_pass_finds_hrefs() {
        // No <a> tag at all; only an href attribute buried in broken markup.
        let html = r#"<section data-x href="/hidden/page" broken"#;
        let links = extract_links_lenient(html, &base());
        assert_eq!(links, vec!["http://test.local/hidden/page"]);
    }

    #[test]
    fn test_script_routes() {
        let html = r#"<html><head><script>
            const routes = [
                { path: '/dashboard', component: Dash },
                { path: '/settings/profile', component: Profile },
            ];
            router.navigate('/reports');
        </script></head><body></body></html>"#;
        let routes = extract_script_routes(html, &base());
        assert!(routes.contains(&"http://test.local/dashboard".to_string()));
        assert!(routes.contains(&"http://test.local/settings/profile".to_string()));
        assert!(routes.contains(&"http://test.local/reports".to_string()));
    }

    #[test]
    fn test_script_routes_ignore_external_src() {
        let html = r#"<script src="/app.js"></script>"#;
        assert!(extract_script_routes(html, &base()).is_empty());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Pricing & Plans"), "pricing-plans");
        assert_eq!(slugify("  About Us  "), "about-us");
        assert_eq!(slugify("§§§"), "");
        assert_eq!(slugify("MiXeD Case"), "mixed-case");
    }
}
