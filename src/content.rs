//! Page content processing: element filtering, keyword search with sentence
//! context, page metadata, and category derivation.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Elements with no closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Controls which page chrome is stripped before keyword search or Markdown
/// conversion.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    excluded: Vec<String>,
}

impl ContentFilter {
    pub fn new(
        include_headers: bool,
        include_menus: bool,
        include_footers: bool,
        include_sidebars: bool,
        custom_exclude_selectors: &[String],
    ) -> Self {
        let mut excluded: Vec<String> = Vec::new();
        if !include_menus {
            excluded.extend(
                [
                    "nav",
                    ".nav",
                    ".navigation",
                    ".menu",
                    ".navbar",
                    "#navbar",
                    "#nav",
                    "[role='navigation']",
                    ".main-menu",
                    ".site-menu",
                    ".top-menu",
                ]
                .map(String::from),
            );
        }
        if !include_headers {
            excluded.extend(
                ["header", ".header", "#header", ".site-header", ".page-header"].map(String::from),
            );
        }
        if !include_footers {
            excluded.extend(
                ["footer", ".footer", "#footer", ".site-footer", ".page-footer"].map(String::from),
            );
        }
        if !include_sidebars {
            excluded.extend(
                ["aside", ".sidebar", "#sidebar", ".side-menu", ".widget-area"].map(String::from),
            );
        }
        excluded.extend(custom_exclude_selectors.iter().cloned());
        Self { excluded }
    }

    /// Include everything; used when the page should pass through untouched.
    pub fn permissive() -> Self {
        Self { excluded: Vec::new() }
    }

    pub fn excluded_selectors(&self) -> &[String] {
        &self.excluded
    }

    fn excluded_node_ids(&self, document: &Html) -> HashSet<ego_tree::NodeId> {
        let mut ids = HashSet::new();
        for raw in &self.excluded {
            let Ok(selector) = Selector::parse(raw) else {
                continue;
            };
            for element in document.select(&selector) {
                ids.insert(element.id());
            }
        }
        ids
    }

    /// Text of the page with excluded subtrees removed, whitespace
    /// normalized.
    pub fn filtered_text(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let excluded = self.excluded_node_ids(&document);

        let mut out = String::new();
        collect_text(document.tree.root(), &excluded, &mut out);
        WS_RE.replace_all(&out, " ").trim().to_string()
    }

    /// The page HTML with excluded subtrees removed, for Markdown
    /// conversion. Deterministic: identical input yields identical output.
    pub fn filtered_html(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let excluded = self.excluded_node_ids(&document);

        let mut out = String::new();
        serialize_children(document.tree.root(), &excluded, &mut out);
        out
    }
}

fn collect_text(
    node: ego_tree::NodeRef<'_, Node>,
    excluded: &HashSet<ego_tree::NodeId>,
    out: &mut String,
) {
    for child in node.children() {
        if excluded.contains(&child.id()) {
            continue;
        }
        match child.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(element) => {
                // Script, style, and head text is not page content.
                if matches!(element.name(), "script" | "style" | "noscript" | "head") {
                    continue;
                }
                collect_text(child, excluded, out);
            }
            _ => collect_text(child, excluded, out),
        }
    }
}

fn serialize_children(
    node: ego_tree::NodeRef<'_, Node>,
    excluded: &HashSet<ego_tree::NodeId>,
    out: &mut String,
) {
    for child in node.children() {
        if excluded.contains(&child.id()) {
            continue;
        }
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                let name = element.name();
                out.push('<');
                out.push_str(name);
                for (attr, value) in element.attrs() {
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    out.push_str(&value.replace('"', "&quot;"));
                    out.push('"');
                }
                out.push('>');
                if !VOID_ELEMENTS.contains(&name) {
                    serialize_children(child, excluded, out);
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
            _ => serialize_children(child, excluded, out),
        }
    }
}

/// Case-insensitive whole-word matcher for one keyword.
pub fn keyword_regex(keyword: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword))).expect("keyword regex")
}

/// Split normalized text into sentences: a terminator run followed by
/// whitespace and an uppercase letter or digit starts a new sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = WS_RE.replace_all(text, " ").trim().to_string();
    let chars: Vec<char> = normalized.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '?' | '!') {
            let mut j = i + 1;
            while j < chars.len() && matches!(chars[j], '.' | '?' | '!') {
                j += 1;
            }
            if j < chars.len() && chars[j].is_whitespace() {
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                if k < chars.len() && (chars[k].is_uppercase() || chars[k].is_ascii_digit()) {
                    let sentence: String = chars[start..j].iter().collect();
                    let sentence = sentence.trim().to_string();
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                    start = k;
                    i = k;
                    continue;
                }
            }
        }
        i += 1;
    }
    let tail: String = chars[start..].iter().collect();
    let tail = tail.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// One keyword occurrence with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub keyword: String,
    /// The matching sentence alone, used for deduplication.
    pub sentence: String,
    /// The sentence plus its immediate neighbors.
    pub context: String,
}

/// Find keyword occurrences in filtered text. At most one match per
/// `(keyword, sentence)` pair; the context is the sentence containing the
/// keyword plus the immediately preceding and following sentences.
pub fn search_keywords(text: &str, keywords: &[String]) -> Vec<KeywordMatch> {
    let sentences = split_sentences(text);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut matches = Vec::new();

    for keyword in keywords {
        let re = keyword_regex(keyword);
        for (i, sentence) in sentences.iter().enumerate() {
            if !re.is_match(sentence) {
                continue;
            }
            let key = (keyword.clone(), sentence.clone());
            if !seen.insert(key) {
                continue;
            }
            let mut context = String::new();
            if i > 0 {
                context.push_str(&sentences[i - 1]);
                context.push(' ');
            }
            context.push_str(sentence);
            if i + 1 < sentences.len() {
                context.push(' ');
                context.push_str(&sentences[i + 1]);
            }
            matches.push(KeywordMatch {
                keyword: keyword.clone(),
                sentence: sentence.clone(),
                context,
            });
        }
    }
    matches
}

/// Category of a page: the first non-empty path segment, lowercased and
/// reduced to slug characters, defaulting to `index` for the root.
pub fn page_category(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()).map(str::to_string));
    let Some(segment) = segment else {
        return "index".to_string();
    };
    let slug: String = segment
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

/// Structural metadata attached to every Markdown document.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PageMeta {
    pub title: String,
    pub heading_counts: [usize; 6],
    pub link_count: usize,
    pub image_count: usize,
    pub word_count: usize,
}

pub fn page_meta(html: &str) -> PageMeta {
    let document = Html::parse_document(html);
    let select_count = |raw: &str| -> usize {
        Selector::parse(raw)
            .map(|s| document.select(&s).count())
            .unwrap_or(0)
    };

    let title = Selector::parse("title")
        .ok()
        .and_then(|s| {
            document
                .select(&s)
                .next()
                .map(|t: ElementRef| t.text().collect::<String>().trim().to_string())
        })
        .unwrap_or_default();

    let mut heading_counts = [0usize; 6];
    for (i, tag) in ["h1", "h2", "h3", "h4", "h5", "h6"].iter().enumerate() {
        heading_counts[i] = select_count(tag);
    }

    let text = ContentFilter::permissive().filtered_text(html);

    PageMeta {
        title,
        heading_counts,
        link_count: select_count("a[href]"),
        image_count: select_count("img"),
        word_count: text.split_whitespace().count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences() {
        let text = "First sentence. Second one here! Third? Yes.";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec!["First sentence.", "Second one here!", "Third?", "Yes."]
        );
    }

    #[test]
    fn test_split_sentences_no_false_split_on_lowercase() {
        let text = "Version 2.x is stable. It works.";
        let sentences = split_sentences(text);
        assert_eq!(sentences, vec!["Version 2.x is stable.", "It works."]);
    }

    #[test]
    fn test_keyword_regex_whole_words() {
        let re = keyword_regex("alpha");
        assert!(re.is_match("the alpha release"));
        assert!(re.is_match("Alpha at the start"));
        assert!(!re.is_match("alphabet soup"));
    }

    #[test]
    fn test_search_keywords_context() {
        let text = "Intro here. The alpha release shipped. Closing words.";
        let matches = search_keywords(text, &["alpha".to_string()]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].sentence, "The alpha release shipped.");
        assert_eq!(
            matches[0].context,
            "Intro here. The alpha release shipped. Closing words."
        );
    }

    #[test]
    fn test_search_keywords_dedup() {
        // Two occurrences inside one sentence collapse to a single hit per
        // sentence, so two sentences yield exactly two hits.
        let text = "The alpha release. Another sentence with alpha twice alpha.";
        let matches = search_keywords(text, &["alpha".to_string()]);
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_content_filter_removes_chrome() {
        let filter = ContentFilter::new(false, false, false, false, &[]);
        let html = r#"<html><body>
            <nav>Menu item</nav>
            <header>Site header</header>
            <p>Real content about alpha.</p>
            <footer>Footer text</footer>
        </body></html>"#;
        let text = filter.filtered_text(html);
        assert!(text.contains("Real content about alpha."));
        assert!(!text.contains("Menu item"));
        assert!(!text.contains("Site header"));
        assert!(!text.contains("Footer text"));
    }

    #[test]
    fn test_content_filter_custom_selectors() {
        let filter = ContentFilter::new(true, true, true, true, &[".ads".to_string()]);
        let html = r#"<body><div class="ads">Buy now</div><p>Keep me</p></body>"#;
        let text = filter.filtered_text(html);
        assert!(!text.contains("Buy now"));
        assert!(text.contains("Keep me"));
    }

    #[test]
    fn test_filtered_html_deterministic() {
        let filter = ContentFilter::new(false, false, false, false, &[]);
        let html = r#"<body><nav>Menu</nav><article><h1>Title</h1><p>Body</p></article></body>"#;
        let once = filter.filtered_html(html);
        let twice = filter.filtered_html(html);
        assert_eq!(once, twice);
        assert!(!once.contains("Menu"));
        assert!(once.contains("<h1>Title</h1>"));
    }

    #[test]
    fn test_page_category() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(page_category(&url("http://x.com/docs/intro")), "docs");
        assert_eq!(page_category(&url("http://x.com/")), "index");
        assert_eq!(page_category(&url("http://x.com/Blog/a")), "blog");
        assert_eq!(page_category(&url("http://x.com/release_notes")), "release_notes");
    }

    #[test]
    fn test_page_meta() {
        let html = r#"<html><head><title>My Page</title></head><body>
            <h1>One</h1><h2>Two</h2><h2>Three</h2>
            <a href="/x">link</a><img src="a.png">
            <p>four words right here</p>
        </body></html>"#;
        let meta = page_meta(html);
        assert_eq!(meta.title, "My Page");
        assert_eq!(meta.heading_counts[0], 1);
        assert_eq!(meta.heading_counts[1], 2);
        assert_eq!(meta.link_count, 1);
        assert_eq!(meta.image_count, 1);
        assert!(meta.word_count >= 4);
    }
}
