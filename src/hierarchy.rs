use anyhow::{Context, Result};
use regex::Regex;

use crate::model::TocEntry;

/// Re-levels a parsed outline so indentation reflects the document's real
/// structure. Raw outlines mix numbered ("1.2 Methodology") and unnumbered
/// ("Background") headings at inconsistent nominal levels; the stack-based
/// pass below derives a consistent level from leading numeral prefixes while
/// letting unnumbered children shift along with their numbered parents.
#[derive(Debug)]
pub struct HierarchyNormalizer {
    back_matter: Regex,
}

#[derive(Debug)]
struct LevelFrame {
    orig_level: u32,
    delta: i64,
}

impl HierarchyNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            back_matter: Regex::new(r"(?i)\b(annexe?|appendix|references|bibliography)\b")
                .context("failed to compile back-matter regex")?,
        })
    }

    /// Drops "out-of-sequence major headings": once a strictly increasing
    /// major-number sequence is established, a heading whose major number
    /// jumps ahead is noise (stray figure/table numbering misread as a
    /// heading). The sequence resumes only on an exact +1 increment; smaller
    /// majors are kept and handled by the regression rule during leveling.
    pub fn filter_out_of_sequence(&self, entries: Vec<TocEntry>) -> Vec<TocEntry> {
        let mut kept = Vec::with_capacity(entries.len());
        let mut last_major: Option<u64> = None;
        let mut in_back_matter = false;

        for entry in entries {
            if !entry.is_parsed() {
                kept.push(entry);
                continue;
            }
            if self.back_matter.is_match(&entry.title) {
                in_back_matter = true;
            }
            if in_back_matter || entry.front {
                kept.push(entry);
                continue;
            }

            let Some(major) = leading_numeral_groups(&entry.title).first().copied() else {
                kept.push(entry);
                continue;
            };

            match last_major {
                None => {
                    last_major = Some(major);
                    kept.push(entry);
                }
                Some(last) if major <= last => {
                    kept.push(entry);
                }
                Some(last) if major == last + 1 => {
                    last_major = Some(major);
                    kept.push(entry);
                }
                Some(_) => {
                    tracing::debug!(title = %entry.title, major, "dropping out-of-sequence major heading");
                }
            }
        }

        kept
    }

    /// Stack-based re-leveling. Numbered entries are promoted to
    /// `base_level + numbering_depth - 1` and push a delta frame; unnumbered
    /// entries inherit the top-of-stack delta. Front-matter entries and
    /// anything inside an annex/references subtree are never promoted, and a
    /// major-number regression (a "1." after a "3.") demotes the entry to
    /// unnumbered treatment so stray low numbers are not hoisted to the top.
    pub fn normalize(&self, mut entries: Vec<TocEntry>) -> Vec<TocEntry> {
        let base_level = entries
            .iter()
            .filter(|entry| entry.is_parsed())
            .map(|entry| entry.level)
            .min()
            .unwrap_or(1);

        let mut stack: Vec<LevelFrame> = Vec::new();
        let mut last_major: Option<u64> = None;
        let mut back_matter_level: Option<u32> = None;

        for entry in entries.iter_mut() {
            if !entry.is_parsed() {
                continue;
            }
            let orig_level = entry.level;

            while stack
                .last()
                .is_some_and(|frame| frame.orig_level >= orig_level)
            {
                stack.pop();
            }

            if let Some(level) = back_matter_level {
                if orig_level < level {
                    back_matter_level = None;
                }
            }
            if back_matter_level.is_none() && self.back_matter.is_match(&entry.title) {
                back_matter_level = Some(orig_level);
            }

            let groups = leading_numeral_groups(&entry.title);
            let depth = groups.len() as u32;
            let in_back_matter = back_matter_level.is_some();

            let mut promoted = false;
            if depth > 0 && !entry.front && !in_back_matter {
                let major = groups[0];
                let regressed = last_major.is_some_and(|last| major < last);
                if regressed {
                    tracing::debug!(title = %entry.title, major, "major regression, skipping promotion");
                } else {
                    let desired = i64::from(base_level) + i64::from(depth) - 1;
                    stack.push(LevelFrame {
                        orig_level,
                        delta: desired - i64::from(orig_level),
                    });
                    entry.level = desired.max(1) as u32;
                    last_major = Some(major);
                    promoted = true;
                }
            }

            if !promoted {
                let delta = stack.last().map(|frame| frame.delta).unwrap_or(0);
                entry.level = (i64::from(orig_level) + delta).max(1) as u32;
            }
        }

        renormalize_to_one(&mut entries);
        entries
    }
}

/// Leading dot-separated numeral groups of a title: "2.1.3 Scope" -> [2,1,3];
/// no leading numeral -> empty.
pub fn leading_numeral_groups(title: &str) -> Vec<u64> {
    let Some(token) = title.split_whitespace().next() else {
        return Vec::new();
    };
    let token = token.trim_end_matches('.');
    if token.is_empty() {
        return Vec::new();
    }

    let mut groups = Vec::new();
    for part in token.split('.') {
        if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
            return Vec::new();
        }
        match part.parse::<u64>() {
            Ok(value) => groups.push(value),
            Err(_) => return Vec::new(),
        }
    }
    groups
}

fn renormalize_to_one(entries: &mut [TocEntry]) {
    let Some(min_level) = entries
        .iter()
        .filter(|entry| entry.is_parsed())
        .map(|entry| entry.level)
        .min()
    else {
        return;
    };
    if min_level <= 1 {
        return;
    }
    for entry in entries.iter_mut().filter(|entry| entry.is_parsed()) {
        entry.level = (entry.level - (min_level - 1)).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, level: u32, title: &str) -> TocEntry {
        TocEntry {
            index: Some(index),
            level,
            title: title.to_string(),
            page: None,
            roman: None,
            front: false,
            marked: false,
            raw: String::new(),
        }
    }

    fn normalizer() -> HierarchyNormalizer {
        HierarchyNormalizer::new().unwrap()
    }

    #[test]
    fn leading_numeral_groups_counts_dot_groups() {
        assert_eq!(leading_numeral_groups("2.1.3 Scope"), vec![2, 1, 3]);
        assert_eq!(leading_numeral_groups("1. Introduction"), vec![1]);
        assert!(leading_numeral_groups("Background").is_empty());
        assert!(leading_numeral_groups("A.1 Annex item").is_empty());
    }

    #[test]
    fn numbered_siblings_and_children_level_consistently() {
        let entries = vec![
            entry(0, 1, "1. A"),
            entry(1, 2, "1.1 B"),
            entry(2, 1, "2. C"),
            entry(3, 1, "Background"),
        ];

        let normalized = normalizer().normalize(entries);
        assert_eq!(normalized[0].level, 1);
        assert_eq!(normalized[1].level, 2);
        assert_eq!(normalized[2].level, 1);
        // Unnumbered entry following "2. C" at the same original level takes
        // its parent's shifted level.
        assert_eq!(normalized[3].level, 1);
    }

    #[test]
    fn inconsistent_nominal_levels_are_flattened_by_numbering() {
        // A bookmark dump where everything arrived at nominal level 1.
        let entries = vec![
            entry(0, 1, "1 Introduction"),
            entry(1, 1, "1.1 Purpose"),
            entry(2, 1, "1.2 Scope"),
            entry(3, 1, "2 Methods"),
        ];

        let normalized = normalizer().normalize(entries);
        assert_eq!(normalized[0].level, 1);
        assert_eq!(normalized[1].level, 2);
        assert_eq!(normalized[2].level, 2);
        assert_eq!(normalized[3].level, 1);
    }

    #[test]
    fn unnumbered_children_shift_with_their_numbered_parent() {
        let entries = vec![
            entry(0, 2, "3.1 Detailed findings"),
            entry(1, 3, "Case study"),
        ];

        let normalized = normalizer().normalize(entries);
        // base_level is 2, so "3.1" promotes to level 3, delta +1; the
        // unnumbered child inherits the shift; renormalization then pulls the
        // minimum back to 1.
        assert_eq!(normalized[0].level, 1);
        assert_eq!(normalized[1].level, 2);
    }

    #[test]
    fn major_regression_is_not_hoisted() {
        let entries = vec![
            entry(0, 1, "3. Findings"),
            entry(1, 2, "1. Stray list item"),
        ];

        let normalized = normalizer().normalize(entries);
        assert_eq!(normalized[0].level, 1);
        // "1." after "3." is treated as unnumbered and keeps its parent's
        // shift instead of jumping to top level.
        assert_eq!(normalized[1].level, 2);
    }

    #[test]
    fn annex_subtree_is_never_promoted() {
        let entries = vec![
            entry(0, 1, "3. Findings"),
            entry(1, 1, "Annex A"),
            entry(2, 2, "1. Annex table"),
        ];

        let normalized = normalizer().normalize(entries);
        assert_eq!(normalized[1].level, 1);
        assert_eq!(normalized[2].level, 2);
    }

    #[test]
    fn front_entries_are_never_promoted() {
        let mut front = entry(0, 2, "1. Contents");
        front.front = true;
        let normalized = normalizer().normalize(vec![front, entry(1, 2, "1. Introduction")]);
        assert_eq!(normalized[0].level, 1);
        assert_eq!(normalized[1].level, 1);
    }

    #[test]
    fn out_of_sequence_major_is_dropped_and_sequence_resumes_on_successor() {
        let entries = vec![
            entry(0, 1, "1. A"),
            entry(1, 1, "2. B"),
            entry(2, 1, "42. Table caption"),
            entry(3, 1, "3. C"),
        ];

        let kept = normalizer().filter_out_of_sequence(entries);
        let titles: Vec<&str> = kept.iter().map(|entry| entry.title.as_str()).collect();
        assert_eq!(titles, vec!["1. A", "2. B", "3. C"]);
    }

    #[test]
    fn non_successor_resume_candidates_are_also_dropped() {
        let entries = vec![
            entry(0, 1, "1. A"),
            entry(1, 1, "2. B"),
            entry(2, 1, "42. Noise"),
            entry(3, 1, "5. More noise"),
            entry(4, 1, "3. C"),
        ];

        let kept = normalizer().filter_out_of_sequence(entries);
        let titles: Vec<&str> = kept.iter().map(|entry| entry.title.as_str()).collect();
        assert_eq!(titles, vec!["1. A", "2. B", "3. C"]);
    }

    #[test]
    fn filter_leaves_back_matter_alone() {
        let entries = vec![
            entry(0, 1, "1. A"),
            entry(1, 1, "2. B"),
            entry(2, 1, "Annex A"),
            entry(3, 2, "7. Annex figure"),
        ];

        let kept = normalizer().filter_out_of_sequence(entries);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn filter_is_composable_with_normalize() {
        let entries = vec![
            entry(0, 1, "1. A"),
            entry(1, 1, "42. Noise"),
            entry(2, 1, "2. B"),
        ];

        let normalizer = normalizer();
        let normalized = normalizer.normalize(normalizer.filter_out_of_sequence(entries));
        let titles: Vec<&str> = normalized.iter().map(|entry| entry.title.as_str()).collect();
        assert_eq!(titles, vec!["1. A", "2. B"]);
        assert!(normalized.iter().all(|entry| entry.level == 1));
    }
}
