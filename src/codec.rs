use anyhow::{Context, Result};
use regex::Regex;

use crate::model::{LabelMap, SectionLabel, TocEntry};

/// Parses and renders the single-line annotated outline format:
///
/// `[H<level>] <title> | page <page> (<roman>) [Front] {label}`
///
/// An optional leading `x ` diff marker is stripped before storage but
/// remembered for rendering. Lines that do not match the pattern are kept
/// verbatim as pass-through entries so round-tripping never drops content.
#[derive(Debug)]
pub struct TocCodec {
    line: Regex,
}

impl TocCodec {
    pub fn new() -> Result<Self> {
        Ok(Self {
            line: Regex::new(
                r"^\s*(x )?\[H(\d+)\]\s*(.*?)\s*\|\s*page\s+(\S+?)(?:\s*\(([^)]+)\))?(\s*\[Front\])?(?:\s*\{([a-z_]+)\})?\s*$",
            )
            .context("failed to compile toc line regex")?,
        })
    }

    /// Parses TOC text into entries. Parsed entries receive contiguous
    /// indices `[0, N)`; unparseable lines become pass-through entries with
    /// no index. Blank lines are skipped.
    pub fn parse(&self, text: &str) -> Vec<TocEntry> {
        self.parse_with_labels(text).0
    }

    /// Like `parse`, but also recovers any `{label}` suffixes written by a
    /// previous classified render, keyed by the recovered entry indices.
    pub fn parse_with_labels(&self, text: &str) -> (Vec<TocEntry>, LabelMap) {
        let mut entries = Vec::new();
        let mut labels = LabelMap::new();
        let mut next_index = 0_usize;

        for raw_line in text.lines() {
            if raw_line.trim().is_empty() {
                continue;
            }

            let Some(captures) = self.line.captures(raw_line) else {
                entries.push(TocEntry {
                    index: None,
                    level: 1,
                    title: raw_line.trim().to_string(),
                    page: None,
                    roman: None,
                    front: false,
                    marked: false,
                    raw: raw_line.to_string(),
                });
                continue;
            };

            let marked = captures.get(1).is_some();
            let level = captures
                .get(2)
                .and_then(|value| value.as_str().parse::<u32>().ok())
                .filter(|level| *level >= 1)
                .unwrap_or(1);
            let title = captures
                .get(3)
                .map(|value| value.as_str().trim().to_string())
                .unwrap_or_default();
            let page = captures
                .get(4)
                .and_then(|value| value.as_str().parse::<i64>().ok());
            let roman = captures
                .get(5)
                .map(|value| value.as_str().trim().to_string())
                .filter(|value| !value.is_empty());
            let front = captures.get(6).is_some();

            if let Some(label) = captures
                .get(7)
                .and_then(|value| SectionLabel::parse(value.as_str()))
            {
                labels.insert(next_index, label);
            }

            entries.push(TocEntry {
                index: Some(next_index),
                level,
                title,
                page,
                roman,
                front,
                marked,
                raw: raw_line.to_string(),
            });
            next_index += 1;
        }

        (entries, labels)
    }

    /// Renders entries back to TOC text. Indentation is re-derived from
    /// `level`; roman/front annotations are appended only when present. When
    /// `labels` is given, each indexed entry gets its label appended in
    /// `{..}` form, producing the lossless classified superset of the plain
    /// format.
    pub fn render(&self, entries: &[TocEntry], labels: Option<&LabelMap>) -> String {
        let mut lines = Vec::with_capacity(entries.len());

        for entry in entries {
            let Some(index) = entry.index else {
                lines.push(entry.raw.clone());
                continue;
            };

            let indent = "  ".repeat(entry.level.saturating_sub(1) as usize);
            let marker = if entry.marked { "x " } else { "" };
            let page = entry
                .page
                .map(|page| page.to_string())
                .unwrap_or_else(|| "?".to_string());

            let mut line = format!(
                "{indent}{marker}[H{}] {} | page {page}",
                entry.level, entry.title
            );
            if let Some(roman) = &entry.roman {
                line.push_str(&format!(" ({roman})"));
            }
            if entry.front {
                line.push_str(" [Front]");
            }
            if let Some(label) = labels.and_then(|labels| labels.get(&index)) {
                line.push_str(&format!(" {{{}}}", label.as_str()));
            }

            lines.push(line);
        }

        lines.join("\n")
    }
}
