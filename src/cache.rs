use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::model::{LabelMap, SectionLabel, TocEntry};
use crate::util::now_utc_string;

/// Per-document outline state, built lazily on first access and reused for
/// the rest of the run. Owned by the caller and passed by handle; there is
/// no ambient global state below the metadata-store boundary.
#[derive(Debug)]
pub struct DocumentOutlineCache {
    pub doc_id: String,
    pub entries: Vec<TocEntry>,
    pub labels: LabelMap,
    pub persisted: bool,
    title_index: HashMap<String, Vec<usize>>,
}

impl DocumentOutlineCache {
    pub fn build(doc_id: String, entries: Vec<TocEntry>, labels: LabelMap) -> Self {
        let mut title_index: HashMap<String, Vec<usize>> = HashMap::new();
        for entry in &entries {
            let Some(index) = entry.index else { continue };
            let normalized = normalize_title(&entry.title);
            if normalized.is_empty() {
                continue;
            }
            title_index.entry(normalized).or_default().push(index);
        }

        Self {
            doc_id,
            entries,
            labels,
            persisted: false,
            title_index,
        }
    }

    pub fn label_for(&self, index: usize) -> SectionLabel {
        self.labels
            .get(&index)
            .copied()
            .unwrap_or(SectionLabel::Other)
    }

    pub fn page_for(&self, index: usize) -> Option<i64> {
        self.entries
            .iter()
            .find(|entry| entry.index == Some(index))
            .and_then(|entry| entry.page)
    }

    pub fn lookup_title(&self, title: &str) -> &[usize] {
        self.title_index
            .get(&normalize_title(title))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Normalized form used for heading matching: lowercase, leading numeral
/// stripped, punctuation collapsed to single spaces.
pub fn normalize_title(title: &str) -> String {
    let mut words: Vec<String> = title
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|ch| ch.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect();

    if let Some(first) = words.first() {
        if first.chars().all(|ch| ch.is_ascii_digit()) {
            words.remove(0);
        }
    }

    words.join(" ")
}

/// What the metadata store holds for one document.
#[derive(Debug, Clone, Default)]
pub struct StoredToc {
    pub toc_text: String,
    pub classified: Option<String>,
    pub persisted: bool,
}

/// Seam to the metadata store. `save_classified` reports whether a write
/// actually happened (unchanged content is skipped).
pub trait MetadataStore {
    fn load(&self, doc_id: &str) -> Result<Option<StoredToc>>;
    fn save_toc(&self, doc_id: &str, toc_text: &str) -> Result<()>;
    fn save_classified(&self, doc_id: &str, classified: &str) -> Result<bool>;
    fn list_docs(&self) -> Result<Vec<(String, StoredToc)>>;
}

/// Sqlite-backed metadata store.
pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL")?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous=NORMAL")?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS docs (
                  doc_id TEXT PRIMARY KEY,
                  toc_text TEXT NOT NULL DEFAULT '',
                  toc_classified TEXT,
                  persisted INTEGER NOT NULL DEFAULT 0,
                  updated_at TEXT NOT NULL
                );
                ",
            )
            .context("failed to initialize docs table")?;
        Ok(Self { connection })
    }
}

impl MetadataStore for SqliteStore {
    fn load(&self, doc_id: &str) -> Result<Option<StoredToc>> {
        self.connection
            .query_row(
                "SELECT toc_text, toc_classified, persisted FROM docs WHERE doc_id = ?1",
                [doc_id],
                |row| {
                    Ok(StoredToc {
                        toc_text: row.get(0)?,
                        classified: row.get(1)?,
                        persisted: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load doc {doc_id}"))
    }

    fn save_toc(&self, doc_id: &str, toc_text: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO docs(doc_id, toc_text, updated_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(doc_id) DO UPDATE SET
                   toc_text=excluded.toc_text,
                   updated_at=excluded.updated_at",
                params![doc_id, toc_text, now_utc_string()],
            )
            .with_context(|| format!("failed to save toc for doc {doc_id}"))?;
        Ok(())
    }

    fn save_classified(&self, doc_id: &str, classified: &str) -> Result<bool> {
        let existing = self.load(doc_id)?;
        if existing
            .as_ref()
            .and_then(|stored| stored.classified.as_deref())
            == Some(classified)
        {
            debug!(doc_id, "classified toc unchanged, skipping write");
            return Ok(false);
        }

        self.connection
            .execute(
                "INSERT INTO docs(doc_id, toc_classified, persisted, updated_at)
                 VALUES(?1, ?2, 1, ?3)
                 ON CONFLICT(doc_id) DO UPDATE SET
                   toc_classified=excluded.toc_classified,
                   persisted=1,
                   updated_at=excluded.updated_at",
                params![doc_id, classified, now_utc_string()],
            )
            .with_context(|| format!("failed to save classified toc for doc {doc_id}"))?;
        info!(doc_id, "persisted classified toc");
        Ok(true)
    }

    fn list_docs(&self) -> Result<Vec<(String, StoredToc)>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT doc_id, toc_text, toc_classified, persisted FROM docs ORDER BY doc_id",
            )
            .context("failed to prepare doc listing")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StoredToc {
                        toc_text: row.get(1)?,
                        classified: row.get(2)?,
                        persisted: row.get::<_, i64>(3)? != 0,
                    },
                ))
            })
            .context("failed to list docs")?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.context("failed to read doc row")?);
        }
        Ok(docs)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: std::cell::RefCell<HashMap<String, StoredToc>>,
}

impl MetadataStore for MemoryStore {
    fn load(&self, doc_id: &str) -> Result<Option<StoredToc>> {
        Ok(self.docs.borrow().get(doc_id).cloned())
    }

    fn save_toc(&self, doc_id: &str, toc_text: &str) -> Result<()> {
        let mut docs = self.docs.borrow_mut();
        let stored = docs.entry(doc_id.to_string()).or_default();
        stored.toc_text = toc_text.to_string();
        Ok(())
    }

    fn save_classified(&self, doc_id: &str, classified: &str) -> Result<bool> {
        let mut docs = self.docs.borrow_mut();
        let stored = docs.entry(doc_id.to_string()).or_default();
        if stored.classified.as_deref() == Some(classified) {
            return Ok(false);
        }
        stored.classified = Some(classified.to_string());
        stored.persisted = true;
        Ok(true)
    }

    fn list_docs(&self) -> Result<Vec<(String, StoredToc)>> {
        let docs = self.docs.borrow();
        let mut listed: Vec<(String, StoredToc)> = docs
            .iter()
            .map(|(doc_id, stored)| (doc_id.clone(), stored.clone()))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(listed)
    }
}

/// A persisted classified TOC is trusted only when its line count matches
/// the stored plain TOC it was derived from; anything else is a stale cache
/// and triggers a full recompute.
pub fn classified_is_current(toc_text: &str, classified: &str) -> bool {
    let toc_lines = toc_text.lines().filter(|line| !line.trim().is_empty()).count();
    let classified_lines = classified
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();
    toc_lines == classified_lines
}
