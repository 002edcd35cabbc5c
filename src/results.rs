//! Page results and the sinks that persist them.
//!
//! Workers forward results over a channel to a single sink task, so file
//! handles never cross worker boundaries. Sinks enforce the run-level
//! guarantees: no duplicate `(url, keyword, sentence)` record and at most
//! one Markdown document per canonical URL.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::content::PageMeta;
use crate::url_utils::CanonicalUrl;

/// Output of processing one page.
#[derive(Debug, Clone)]
pub enum PageResult {
    KeywordHit {
        url: CanonicalUrl,
        keyword: String,
        /// The sentence that matched, used as the dedup key.
        sentence: String,
        /// The sentence plus its neighbors.
        context: String,
    },
    MarkdownDoc {
        url: CanonicalUrl,
        category: String,
        markdown: String,
        meta: PageMeta,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumes page results and side-effects them to storage.
pub trait ResultSink: Send {
    fn emit(&mut self, result: PageResult) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Records written so far.
    fn emitted(&self) -> u64;
}

/// Pipe-delimited keyword report, one row per hit.
pub struct CsvKeywordSink {
    writer: BufWriter<File>,
    seen: HashSet<(String, String, String)>,
    emitted: u64,
}

impl CsvKeywordSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            writeln!(writer, "url|keyword|context")?;
        }
        Ok(Self {
            writer,
            seen: HashSet::new(),
            emitted: 0,
        })
    }
}

impl ResultSink for CsvKeywordSink {
    fn emit(&mut self, result: PageResult) -> Result<(), SinkError> {
        let PageResult::KeywordHit {
            url,
            keyword,
            sentence,
            context,
        } = result
        else {
            return Ok(());
        };
        let key = (url.to_string(), keyword.clone(), sentence);
        if !self.seen.insert(key) {
            return Ok(());
        }
        // The delimiter may not appear inside fields.
        let context = context.replace('|', " ");
        writeln!(self.writer, "{}|{}|{}", url, keyword, context)?;
        self.emitted += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Writes one Markdown file per page under `<root>/<domain>/<category>/`.
pub struct MarkdownTreeSink {
    root: PathBuf,
    written: HashSet<CanonicalUrl>,
    emitted: u64,
}

impl MarkdownTreeSink {
    pub fn create(root: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            written: HashSet::new(),
            emitted: 0,
        })
    }

    fn file_path(&self, url: &CanonicalUrl, category: &str) -> PathBuf {
        let domain = url.host().replace('.', "_");
        let parsed = url.parsed();
        let slug: String = parsed
            .path()
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let slug = if slug.is_empty() { "index".to_string() } else { slug };
        self.root.join(domain).join(category).join(format!("{slug}.md"))
    }
}

impl ResultSink for MarkdownTreeSink {
    fn emit(&mut self, result: PageResult) -> Result<(), SinkError> {
        let PageResult::MarkdownDoc {
            url,
            category,
            markdown,
            meta,
        } = result
        else {
            return Ok(());
        };
        if !self.written.insert(url.clone()) {
            return Ok(());
        }
        let path = self.file_path(&url, &category);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = BufWriter::new(File::create(&path)?);
        writeln!(file, "---")?;
        writeln!(file, "url: {}", url)?;
        writeln!(file, "title: {}", meta.title)?;
        writeln!(file, "category: {}", category)?;
        writeln!(file, "word_count: {}", meta.word_count)?;
        writeln!(file, "links: {}", meta.link_count)?;
        writeln!(file, "images: {}", meta.image_count)?;
        writeln!(file, "---")?;
        writeln!(file)?;
        file.write_all(markdown.as_bytes())?;
        file.flush()?;

        info!(url = %url, path = %path.display(), "markdown document written");
        self.emitted += 1;
        Ok(())
    }

    fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Discards everything; keeps the pipeline shape in tests.
#[derive(Default)]
pub struct NullSink {
    emitted: u64,
}

impl ResultSink for NullSink {
    fn emit(&mut self, _result: PageResult) -> Result<(), SinkError> {
        self.emitted += 1;
        Ok(())
    }

    fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_utils::canonicalize;
    use tempfile::TempDir;

    fn url(path: &str) -> CanonicalUrl {
        canonicalize(&format!("http://test.local{}", path), None, &[]).unwrap()
    }

    fn hit(path: &str, keyword: &str, sentence: &str) -> PageResult {
        PageResult::KeywordHit {
            url: url(path),
            keyword: keyword.to_string(),
            sentence: sentence.to_string(),
            context: format!("Before. {} After.", sentence),
        }
    }

    #[test]
    fn test_csv_sink_dedups_triples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        let mut sink = CsvKeywordSink::create(&path).unwrap();

        sink.emit(hit("/a", "alpha", "The alpha one.")).unwrap();
        sink.emit(hit("/a", "alpha", "The alpha one.")).unwrap();
        sink.emit(hit("/a", "alpha", "A different alpha.")).unwrap();
        sink.flush().unwrap();

        assert_eq!(sink.emitted(), 2);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3); // header + 2 rows
        assert!(content.starts_with("url|keyword|context"));
    }

    #[test]
    fn test_csv_sink_strips_delimiter_from_context() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        let mut sink = CsvKeywordSink::create(&path).unwrap();
        sink.emit(PageResult::KeywordHit {
            url: url("/a"),
            keyword: "k".into(),
            sentence: "s".into(),
            context: "left|right".into(),
        })
        .unwrap();
        sink.flush().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert_eq!(row.split('|').count(), 3);
    }

    #[test]
    fn test_markdown_sink_one_doc_per_url() {
        let dir = TempDir::new().unwrap();
        let mut sink = MarkdownTreeSink::create(dir.path()).unwrap();
        let doc = PageResult::MarkdownDoc {
            url: url("/docs/intro"),
            category: "docs".into(),
            markdown: "# Intro".into(),
            meta: PageMeta {
                title: "Intro".into(),
                ..Default::default()
            },
        };
        sink.emit(doc.clone()).unwrap();
        sink.emit(doc).unwrap();
        assert_eq!(sink.emitted(), 1);

        let path = dir
            .path()
            .join("test_local")
            .join("docs")
            .join("docs_intro.md");
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("title: Intro"));
        assert!(content.contains("# Intro"));
    }

    #[test]
    fn test_markdown_sink_root_page_slug() {
        let dir = TempDir::new().unwrap();
        let sink = MarkdownTreeSink::create(dir.path()).unwrap();
        let path = sink.file_path(&url("/"), "index");
        assert!(path.ends_with("test_local/index/index.md"));
    }
}
