use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::codec::TocCodec;
use crate::model::TocEntry;

/// One heading candidate from the document-layout collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutHeading {
    pub text: String,
    pub level: u32,
    #[serde(default)]
    pub page: Option<i64>,
}

/// Which producer ended up supplying the outline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlineOrigin {
    LayoutHeadings,
    PdfBookmarks,
    MarkdownHeuristic,
}

impl OutlineOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            OutlineOrigin::LayoutHeadings => "layout_headings",
            OutlineOrigin::PdfBookmarks => "pdf_bookmarks",
            OutlineOrigin::MarkdownHeuristic => "markdown_heuristic",
        }
    }
}

/// Multilingual section names recognized by the markdown fallback, one list
/// per language (en/fr/es).
const SECTION_NAME_KEYWORDS: &[&str] = &[
    "executive summary",
    "introduction",
    "background",
    "methodology",
    "findings",
    "results",
    "conclusions",
    "recommendations",
    "annex",
    "appendix",
    "résumé exécutif",
    "résumé",
    "contexte",
    "méthodologie",
    "constatations",
    "résultats",
    "conclusion",
    "recommandations",
    "annexe",
    "resumen ejecutivo",
    "introducción",
    "antecedentes",
    "metodología",
    "hallazgos",
    "resultados",
    "conclusiones",
    "recomendaciones",
    "anexo",
];

/// Chooses among the three raw-outline producers and renders the winner to
/// the codec's single-line text format.
#[derive(Debug)]
pub struct OutlineSelector {
    caption: Regex,
    numbered_heading: Regex,
    outline_item: Regex,
}

const MIN_USABLE_ENTRIES: usize = 5;
const LARGE_OUTLINE_ENTRIES: usize = 80;
const BUSY_OUTLINE_ENTRIES: usize = 40;
const CAPTION_SHARE_LIMIT: f64 = 0.20;
const QUESTION_SHARE_LIMIT: f64 = 0.30;
const UNKNOWN_PAGE_SHARE_LIMIT: f64 = 0.60;

impl OutlineSelector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            caption: Regex::new(r"(?i)^(figure|table|figura|tableau|cuadro|gráfico)\s+\d+")
                .context("failed to compile caption regex")?,
            numbered_heading: Regex::new(r"^\s*(\d+(?:\.\d+)*)[.)]?\s+(\S.{2,119})$")
                .context("failed to compile numbered heading regex")?,
            outline_item: Regex::new(r#"<item page="(\d+)">(.*?)</item>"#)
                .context("failed to compile outline item regex")?,
        })
    }

    /// Selection policy over the three producers. `layout` is the preferred
    /// source; `bookmarks` and `pages` back it up. Always returns TOC text,
    /// possibly empty when every producer came up dry.
    pub fn select(
        &self,
        codec: &TocCodec,
        layout: &[LayoutHeading],
        bookmarks: &[TocEntry],
        pages: &[String],
    ) -> (String, OutlineOrigin) {
        let layout_entries = self.layout_to_entries(layout);
        let bookmark_usable = bookmarks.len() >= MIN_USABLE_ENTRIES;

        if layout_entries.is_empty() {
            if !bookmarks.is_empty() {
                return (codec.render(bookmarks, None), OutlineOrigin::PdfBookmarks);
            }
            let fallback = self.markdown_fallback(pages);
            return (
                codec.render(&fallback, None),
                OutlineOrigin::MarkdownHeuristic,
            );
        }

        if self.is_low_quality(&layout_entries) {
            debug!(
                entries = layout_entries.len(),
                "layout outline judged low quality"
            );
            if !bookmarks.is_empty() {
                return (codec.render(bookmarks, None), OutlineOrigin::PdfBookmarks);
            }
            if self.is_minimally_usable(&layout_entries) {
                return (
                    codec.render(&layout_entries, None),
                    OutlineOrigin::LayoutHeadings,
                );
            }
            let fallback = self.markdown_fallback(pages);
            return (
                codec.render(&fallback, None),
                OutlineOrigin::MarkdownHeuristic,
            );
        }

        // Very large layout-derived TOCs tend to over-segment; prefer a
        // non-trivial bookmark outline in that case.
        if layout_entries.len() >= LARGE_OUTLINE_ENTRIES && bookmark_usable {
            return (codec.render(bookmarks, None), OutlineOrigin::PdfBookmarks);
        }

        (
            codec.render(&layout_entries, None),
            OutlineOrigin::LayoutHeadings,
        )
    }

    fn layout_to_entries(&self, layout: &[LayoutHeading]) -> Vec<TocEntry> {
        layout
            .iter()
            .enumerate()
            .map(|(index, heading)| TocEntry {
                index: Some(index),
                level: heading.level.max(1),
                title: heading.text.split_whitespace().collect::<Vec<_>>().join(" "),
                page: heading.page,
                roman: None,
                front: false,
                marked: false,
                raw: String::new(),
            })
            .filter(|entry| !entry.title.is_empty())
            .collect()
    }

    fn is_low_quality(&self, entries: &[TocEntry]) -> bool {
        if entries.len() < MIN_USABLE_ENTRIES {
            return true;
        }
        if entries.len() < BUSY_OUTLINE_ENTRIES {
            return false;
        }
        let total = entries.len() as f64;
        let captions = entries
            .iter()
            .filter(|entry| self.caption.is_match(&entry.title))
            .count() as f64;
        let questions = entries
            .iter()
            .filter(|entry| entry.title.contains('?'))
            .count() as f64;
        captions / total >= CAPTION_SHARE_LIMIT || questions / total >= QUESTION_SHARE_LIMIT
    }

    fn is_minimally_usable(&self, entries: &[TocEntry]) -> bool {
        if entries.len() < MIN_USABLE_ENTRIES {
            return false;
        }
        let unknown = entries.iter().filter(|entry| entry.page.is_none()).count() as f64;
        unknown / entries.len() as f64 <= UNKNOWN_PAGE_SHARE_LIMIT
    }

    /// Regex heuristic over raw page text: numbered headings plus standalone
    /// multilingual section-name lines.
    pub fn markdown_fallback(&self, pages: &[String]) -> Vec<TocEntry> {
        let mut entries = Vec::new();
        let mut index = 0_usize;

        for (page_index, page_text) in pages.iter().enumerate() {
            let page_number = (page_index + 1) as i64;
            for raw_line in page_text.lines() {
                let line = raw_line.trim();
                if line.is_empty() || line.len() > 120 {
                    continue;
                }

                let parsed = if let Some(captures) = self.numbered_heading.captures(line) {
                    let numeral = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                    let depth = numeral.split('.').count() as u32;
                    Some((depth.max(1), line.to_string()))
                } else if is_section_name_line(line) {
                    Some((1, line.to_string()))
                } else {
                    None
                };

                if let Some((level, title)) = parsed {
                    entries.push(TocEntry {
                        index: Some(index),
                        level,
                        title,
                        page: Some(page_number),
                        roman: None,
                        front: false,
                        marked: false,
                        raw: String::new(),
                    });
                    index += 1;
                }
            }
        }

        entries
    }

    /// Pulls the PDF bookmark outline via `pdftohtml -xml`. Nesting depth of
    /// `<outline>` elements supplies the level.
    pub fn bookmarks_from_pdf(&self, pdf_path: &Path) -> Result<Vec<TocEntry>> {
        let output = Command::new("pdftohtml")
            .arg("-xml")
            .arg("-i")
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg("1")
            .arg(pdf_path)
            .arg("-stdout")
            .output()
            .with_context(|| format!("failed to execute pdftohtml for {}", pdf_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdftohtml returned non-zero exit status for {}: {}",
                pdf_path.display(),
                stderr.trim()
            );
        }

        let xml = String::from_utf8_lossy(&output.stdout);
        let entries = self.parse_bookmark_xml(&xml);
        info!(
            bookmarks = entries.len(),
            path = %pdf_path.display(),
            "extracted pdf bookmark outline"
        );
        Ok(entries)
    }

    pub fn parse_bookmark_xml(&self, xml: &str) -> Vec<TocEntry> {
        let mut entries = Vec::new();
        let mut depth = 0_u32;
        let mut index = 0_usize;

        for line in xml.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("<outline") {
                depth += 1;
                continue;
            }
            if trimmed.starts_with("</outline") {
                depth = depth.saturating_sub(1);
                continue;
            }
            if let Some(captures) = self.outline_item.captures(trimmed) {
                let page = captures
                    .get(1)
                    .and_then(|value| value.as_str().parse::<i64>().ok());
                let title = unescape_xml_entities(
                    captures.get(2).map(|value| value.as_str()).unwrap_or(""),
                );
                if title.is_empty() {
                    continue;
                }
                entries.push(TocEntry {
                    index: Some(index),
                    level: depth.max(1),
                    title,
                    page,
                    roman: None,
                    front: false,
                    marked: false,
                    raw: String::new(),
                });
                index += 1;
            }
        }

        entries
    }
}

/// Pulls per-page text with `pdftotext`; pages come back split on form
/// feeds, trailing empty pages trimmed.
pub fn extract_pages_with_pdftotext(
    pdf_path: &Path,
    max_pages: Option<usize>,
) -> Result<Vec<String>> {
    let mut command = Command::new("pdftotext");
    command.arg("-enc").arg("UTF-8").arg("-f").arg("1");
    if let Some(max_pages) = max_pages {
        command.arg("-l").arg(max_pages.to_string());
    }
    command.arg(pdf_path).arg("-");

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftotext returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let mut pages: Vec<String> = raw
        .split('\u{000C}')
        .map(|page| page.replace('\u{0000}', ""))
        .collect();

    while let Some(last_page) = pages.last() {
        if last_page.trim().is_empty() {
            pages.pop();
            continue;
        }
        break;
    }

    Ok(pages)
}

fn is_section_name_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    let lowered = lowered.trim_end_matches([':', '.']).trim();
    SECTION_NAME_KEYWORDS
        .iter()
        .any(|keyword| lowered == *keyword || lowered.starts_with(&format!("{keyword} ")))
}

fn unescape_xml_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace('\u{00a0}', " ")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}
