use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::model::TocEntry;

/// A positioned word on a page, as supplied by the text-extraction
/// collaborator.
#[derive(Debug, Clone)]
pub struct PageWord {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PageContent {
    pub words: Vec<PageWord>,
    pub page_height: f32,
}

impl PageContent {
    /// Builds page content from plain extracted text when no layout is
    /// available. The first and last lines stand in for the header and
    /// footer zones.
    pub fn from_text(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut words = Vec::new();
        let page_height = 100.0_f32;

        if let Some(first) = lines.first() {
            for token in first.split_whitespace() {
                words.push(PageWord {
                    x0: 0.0,
                    y0: 0.0,
                    x1: 0.0,
                    y1: 1.0,
                    text: token.to_string(),
                });
            }
        }
        if lines.len() > 1 {
            if let Some(last) = lines.last() {
                for token in last.split_whitespace() {
                    words.push(PageWord {
                        x0: 0.0,
                        y0: page_height - 1.0,
                        x1: 0.0,
                        y1: page_height,
                        text: token.to_string(),
                    });
                }
            }
        }

        Self { words, page_height }
    }
}

/// Source of raw page text, zero-based page indices.
pub trait PageSource {
    fn page_count(&self) -> usize;
    fn page(&self, index: usize) -> Result<Option<PageContent>>;
}

impl PageSource for Vec<PageContent> {
    fn page_count(&self) -> usize {
        self.len()
    }

    fn page(&self, index: usize) -> Result<Option<PageContent>> {
        Ok(self.get(index).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RomanScanConfig {
    /// Pages scanned per batch before re-checking the early-stop condition.
    pub batch_size: usize,
}

impl Default for RomanScanConfig {
    fn default() -> Self {
        Self { batch_size: 20 }
    }
}

/// Outcome of a scan: per-page roman labels (1-based page numbers) and the
/// resolved front-matter boundary page, if any.
#[derive(Debug, Clone, Default)]
pub struct RomanDetection {
    pub labels: BTreeMap<i64, String>,
    pub boundary: Option<i64>,
}

impl RomanDetection {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Scans page headers/footers for roman-numeral page labels and resolves the
/// front-matter boundary from monotone runs of their decoded values.
#[derive(Debug)]
pub struct RomanDetector {
    strict_roman: Regex,
}

const HEADER_FOOTER_ZONE: f32 = 0.15;
const MAX_TOKEN_LEN: usize = 6;
const MIN_LABELED_PAGES: usize = 3;
const MIN_RUN_LEN: usize = 3;

impl RomanDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            strict_roman: Regex::new(r"^M{0,4}(CM|CD|D?C{0,3})(XC|XL|L?X{0,3})(IX|IV|V?I{0,3})$")
                .context("failed to compile roman numeral regex")?,
        })
    }

    /// Batched scan with early termination: stop once a batch without roman
    /// tokens follows a batch that had them. A separate cost cutoff gives up
    /// after two batches with no hits at all, so a document whose front pages
    /// carry plain numbers never gets scanned end to end.
    pub fn scan(&self, source: &dyn PageSource, config: RomanScanConfig) -> Result<RomanDetection> {
        let total_pages = source.page_count();
        let batch_size = config.batch_size.max(1);
        let mut labels: BTreeMap<i64, String> = BTreeMap::new();
        let mut seen_hits = false;
        let mut empty_batches = 0_usize;
        let mut start = 0_usize;

        while start < total_pages {
            let end = (start + batch_size).min(total_pages);
            let mut batch_hits = 0_usize;

            for page_index in start..end {
                let Some(content) = source.page(page_index)? else {
                    continue;
                };
                if let Some(label) = self.first_roman_token(&content) {
                    labels.insert((page_index + 1) as i64, label);
                    batch_hits += 1;
                }
            }

            if batch_hits == 0 {
                empty_batches += 1;
                if seen_hits || empty_batches >= 2 {
                    break;
                }
            } else {
                seen_hits = true;
                empty_batches = 0;
            }

            start = end;
        }

        if labels.len() < MIN_LABELED_PAGES {
            debug!(
                labeled_pages = labels.len(),
                "too few roman-labeled pages, skipping annotation"
            );
            return Ok(RomanDetection::default());
        }

        let boundary = resolve_boundary(&labels, total_pages);
        Ok(RomanDetection { labels, boundary })
    }

    /// First word on the page that qualifies as a roman-numeral page label:
    /// non-numeric, short, strict roman form, sitting in the top or bottom
    /// 15% of the page.
    fn first_roman_token(&self, content: &PageContent) -> Option<String> {
        let height = if content.page_height > 0.0 {
            content.page_height
        } else {
            return None;
        };
        let top_limit = height * HEADER_FOOTER_ZONE;
        let bottom_limit = height * (1.0 - HEADER_FOOTER_ZONE);

        for word in &content.words {
            let in_zone = word.y1 <= top_limit || word.y0 >= bottom_limit;
            if !in_zone {
                continue;
            }
            let token = word.text.trim().trim_matches(|ch: char| ch == '.' || ch == ',');
            if token.is_empty() || token.len() > MAX_TOKEN_LEN {
                continue;
            }
            if token.chars().all(|ch| ch.is_ascii_digit()) {
                continue;
            }
            let upper = token.to_uppercase();
            if !self.strict_roman.is_match(&upper) || upper.is_empty() {
                continue;
            }
            return Some(token.to_string());
        }

        None
    }
}

/// Decodes subtractive roman notation. The token must already have passed
/// the strict pattern check; malformed input yields None.
pub fn roman_to_int(token: &str) -> Option<i64> {
    fn digit(ch: char) -> Option<i64> {
        match ch {
            'I' => Some(1),
            'V' => Some(5),
            'X' => Some(10),
            'L' => Some(50),
            'C' => Some(100),
            'D' => Some(500),
            'M' => Some(1000),
            _ => None,
        }
    }

    let upper = token.to_uppercase();
    let mut total = 0_i64;
    let mut prev = 0_i64;
    for ch in upper.chars().rev() {
        let value = digit(ch)?;
        if value < prev {
            total -= value;
        } else {
            total += value;
            prev = value;
        }
    }
    if total > 0 { Some(total) } else { None }
}

/// Resolves the front-matter boundary: keep labels within the first third of
/// the document, prefer lowercase labels when a credible lowercase run
/// exists, then take the last page of the last non-decreasing run of length
/// >= 3 (a reset to 1 after a larger value starts a new run).
fn resolve_boundary(labels: &BTreeMap<i64, String>, total_pages: usize) -> Option<i64> {
    let page_cap = if total_pages > 0 {
        (total_pages as i64).div_euclid(3).max(1)
    } else {
        i64::MAX
    };

    let decoded: Vec<(i64, i64, bool)> = labels
        .iter()
        .filter(|(page, _)| **page <= page_cap)
        .filter_map(|(page, label)| {
            let lowercase = label.chars().all(|ch| ch.is_lowercase());
            roman_to_int(label).map(|value| (*page, value, lowercase))
        })
        .collect();

    let lowercase_only: Vec<(i64, i64)> = decoded
        .iter()
        .filter(|(_, _, lowercase)| *lowercase)
        .map(|(page, value, _)| (*page, *value))
        .collect();

    let candidates: Vec<(i64, i64)> = if longest_run(&lowercase_only) >= MIN_RUN_LEN {
        lowercase_only
    } else {
        decoded
            .iter()
            .map(|(page, value, _)| (*page, *value))
            .collect()
    };

    let mut boundary = None;
    let mut run_start = 0_usize;
    for index in 1..=candidates.len() {
        let broken = index == candidates.len() || {
            let (_, prev_value) = candidates[index - 1];
            let (_, value) = candidates[index];
            value < prev_value || (value == 1 && prev_value > 1)
        };
        if broken {
            if index - run_start >= MIN_RUN_LEN {
                boundary = Some(candidates[index - 1].0);
            }
            run_start = index;
        }
    }
    boundary
}

fn longest_run(pairs: &[(i64, i64)]) -> usize {
    let mut best = 0_usize;
    let mut current = 0_usize;
    let mut prev: Option<i64> = None;
    for (_, value) in pairs {
        let continues = match prev {
            Some(prev_value) => *value >= prev_value && !(*value == 1 && prev_value > 1),
            None => true,
        };
        current = if continues { current + 1 } else { 1 };
        best = best.max(current);
        prev = Some(*value);
    }
    best
}

/// Applies `(roman)` and `[Front]` annotations to entries with numeric
/// pages. A no-op when the detection found nothing.
pub fn annotate_entries(entries: &mut [TocEntry], detection: &RomanDetection) {
    if detection.is_empty() {
        return;
    }
    for entry in entries.iter_mut().filter(|entry| entry.is_parsed()) {
        let Some(page) = entry.page else {
            continue;
        };
        if let Some(label) = detection.labels.get(&page) {
            entry.roman = Some(label.clone());
        }
        if let Some(boundary) = detection.boundary {
            if page <= boundary {
                entry.front = true;
            }
        }
    }
}
