use std::collections::BTreeMap;

use serde_json::json;

use crate::cache::DocumentOutlineCache;
use crate::model::{Chunk, SectionLabel, TagOutcome};

/// Maps a chunk onto the nearest preceding labeled outline entry. Total:
/// every code path terminates in a label, falling back to `other` when
/// neither the page-range match nor the heading match finds anything.
pub fn assign(chunk: &Chunk, cache: &DocumentOutlineCache) -> SectionLabel {
    match tag_chunk(chunk, cache) {
        TagOutcome::SingleLabel(label) => label,
        outcome @ TagOutcome::FieldUpdates(_) => outcome.label(),
    }
}

/// Like `assign`, but reports which entry matched so callers can write
/// several metadata fields at once.
pub fn tag_chunk(chunk: &Chunk, cache: &DocumentOutlineCache) -> TagOutcome {
    if let Some(index) = match_by_page(chunk, cache).or_else(|| match_by_heading(chunk, cache)) {
        let label = cache.label_for(index);
        let mut fields = BTreeMap::new();
        fields.insert(
            "section_label".to_string(),
            json!(label.as_str()),
        );
        fields.insert("section_entry_index".to_string(), json!(index));
        return TagOutcome::FieldUpdates(fields);
    }

    TagOutcome::SingleLabel(SectionLabel::Other)
}

/// Page-range floor match: the entry with the greatest page <= the chunk's
/// page; ties go to the highest original index (the nearest preceding
/// heading).
fn match_by_page(chunk: &Chunk, cache: &DocumentOutlineCache) -> Option<usize> {
    let page = chunk.page_num?;
    let mut best: Option<(i64, usize)> = None;

    for entry in &cache.entries {
        let (Some(index), Some(entry_page)) = (entry.index, entry.page) else {
            continue;
        };
        if entry_page > page {
            continue;
        }
        let candidate = (entry_page, index);
        if best.is_none_or(|current| candidate >= current) {
            best = Some(candidate);
        }
    }

    best.map(|(_, index)| index)
}

/// Breadcrumb fallback: match heading strings against the normalized-title
/// index, most specific (last) breadcrumb first. When several entries share
/// a title, prefer the one whose page is closest to but not after the
/// chunk's page.
fn match_by_heading(chunk: &Chunk, cache: &DocumentOutlineCache) -> Option<usize> {
    let headings = chunk.headings.as_ref()?;

    for heading in headings.iter().rev() {
        let candidates = cache.lookup_title(heading);
        if candidates.is_empty() {
            continue;
        }
        if candidates.len() == 1 || chunk.page_num.is_none() {
            return candidates.first().copied();
        }

        let page = chunk.page_num.unwrap_or(i64::MAX);
        let preceding = candidates
            .iter()
            .filter_map(|index| {
                let entry_page = cache.page_for(*index)?;
                (entry_page <= page).then_some((entry_page, *index))
            })
            .max();
        if let Some((_, index)) = preceding {
            return Some(index);
        }
        return candidates.first().copied();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LabelMap, TocEntry};

    fn entry(index: usize, title: &str, page: Option<i64>) -> TocEntry {
        TocEntry {
            index: Some(index),
            level: 1,
            title: title.to_string(),
            page,
            roman: None,
            front: false,
            marked: false,
            raw: String::new(),
        }
    }

    fn cache() -> DocumentOutlineCache {
        let entries = vec![
            entry(0, "Introduction", Some(1)),
            entry(1, "3. Findings", Some(5)),
            entry(2, "4. Recommendations", Some(10)),
            entry(3, "Annex A", None),
        ];
        let mut labels = LabelMap::new();
        labels.insert(0, SectionLabel::Context);
        labels.insert(1, SectionLabel::Findings);
        labels.insert(2, SectionLabel::Recommendations);
        labels.insert(3, SectionLabel::Annexes);
        DocumentOutlineCache::build("doc-1".to_string(), entries, labels)
    }

    fn chunk(page: Option<i64>, headings: Option<Vec<&str>>) -> Chunk {
        Chunk {
            page_num: page,
            headings: headings
                .map(|headings| headings.into_iter().map(str::to_string).collect()),
            section_label: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn page_floor_match_picks_nearest_preceding_entry() {
        let cache = cache();
        assert_eq!(assign(&chunk(Some(7), None), &cache), SectionLabel::Findings);
        assert_eq!(assign(&chunk(Some(1), None), &cache), SectionLabel::Context);
        assert_eq!(
            assign(&chunk(Some(99), None), &cache),
            SectionLabel::Recommendations
        );
    }

    #[test]
    fn page_tie_breaks_to_highest_index() {
        let entries = vec![
            entry(0, "3. Findings", Some(5)),
            entry(1, "3.1 Detail", Some(5)),
        ];
        let mut labels = LabelMap::new();
        labels.insert(0, SectionLabel::Findings);
        labels.insert(1, SectionLabel::Conclusions);
        let cache = DocumentOutlineCache::build("doc-2".to_string(), entries, labels);

        assert_eq!(
            assign(&chunk(Some(6), None), &cache),
            SectionLabel::Conclusions
        );
    }

    #[test]
    fn heading_fallback_used_when_page_is_missing() {
        let cache = cache();
        let result = assign(&chunk(None, Some(vec!["3. Findings"])), &cache);
        assert_eq!(result, SectionLabel::Findings);
    }

    #[test]
    fn heading_fallback_prefers_most_specific_breadcrumb() {
        let cache = cache();
        let result = assign(
            &chunk(None, Some(vec!["Introduction", "Annex A"])),
            &cache,
        );
        assert_eq!(result, SectionLabel::Annexes);
    }

    #[test]
    fn duplicate_titles_resolve_by_closest_preceding_page() {
        let entries = vec![
            entry(0, "Overview", Some(2)),
            entry(1, "Overview", Some(20)),
        ];
        let mut labels = LabelMap::new();
        labels.insert(0, SectionLabel::Context);
        labels.insert(1, SectionLabel::Findings);
        let cache = DocumentOutlineCache::build("doc-3".to_string(), entries, labels);

        let matched = match_by_heading(&chunk(Some(25), Some(vec!["Overview"])), &cache);
        assert_eq!(matched, Some(1));
        let matched = match_by_heading(&chunk(Some(3), Some(vec!["Overview"])), &cache);
        assert_eq!(matched, Some(0));
    }

    #[test]
    fn unmatched_chunk_terminates_in_other() {
        let cache = cache();
        assert_eq!(assign(&chunk(None, None), &cache), SectionLabel::Other);
        assert_eq!(
            assign(&chunk(None, Some(vec!["Nothing like this"])), &cache),
            SectionLabel::Other
        );
        // A page before every known entry page with no headings.
        assert_eq!(assign(&chunk(Some(0), None), &cache), SectionLabel::Other);
    }

    #[test]
    fn tag_chunk_reports_matched_entry_fields() {
        let cache = cache();
        let outcome = tag_chunk(&chunk(Some(7), None), &cache);
        match outcome {
            TagOutcome::FieldUpdates(fields) => {
                assert_eq!(
                    fields.get("section_label").and_then(|value| value.as_str()),
                    Some("findings")
                );
                assert_eq!(
                    fields
                        .get("section_entry_index")
                        .and_then(|value| value.as_u64()),
                    Some(1)
                );
            }
            TagOutcome::SingleLabel(_) => panic!("expected field updates"),
        }
    }
}
