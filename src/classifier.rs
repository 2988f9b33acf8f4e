use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{LlmConfig, LlmInvoker};
use crate::model::{LabelMap, SectionLabel, TocEntry};

const SYSTEM_PROMPT: &str = "You label report outline entries with one section type each. \
The closed vocabulary is: executive_summary, context, methodology, findings, conclusions, \
recommendations, annexes, other. Respond with a JSON array of objects, one per entry, \
shaped as {\"idx\": <integer>, \"label\": \"<section type>\"}. Use each entry's idx \
exactly as given. Do not invent new idx values or labels.";

const CORRECTIVE_PROMPT: &str = "Your previous reply could not be parsed. \
Return valid JSON only, no prose: a JSON array of {\"idx\", \"label\"} objects.";

/// One attempt of the per-batch retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchAttempt {
    First,
    Corrective,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    idx: i64,
    label: String,
}

/// Classifies the given entries with the remote model, splitting them into
/// contiguous batches that fit the character budget. Entries the model never
/// labels fall back to their locked label, if any; locked labels always win
/// over conflicting model output. Network and protocol failures degrade to
/// locked-labels-only for the affected batch and never reach the caller.
pub fn classify(
    title: &str,
    entries: &[TocEntry],
    locked: &LabelMap,
    invoker: &dyn LlmInvoker,
    config: &LlmConfig,
    total_pages: usize,
    retry_on_failure: bool,
) -> LabelMap {
    let indexed: Vec<&TocEntry> = entries.iter().filter(|entry| entry.is_parsed()).collect();
    if indexed.is_empty() {
        return LabelMap::new();
    }

    let budget = config.max_total_chars();
    let full_payload = render_user_prompt(title, &indexed, locked, total_pages);
    let full_chars = full_payload.len() + SYSTEM_PROMPT.len();

    let n_batches = if full_chars > budget {
        full_chars.div_ceil(budget)
    } else {
        1
    };
    let batch_len = indexed.len().div_ceil(n_batches);
    debug!(
        entries = indexed.len(),
        chars = full_chars,
        budget,
        n_batches,
        "classifier batch plan"
    );

    let mut merged = LabelMap::new();
    for batch in indexed.chunks(batch_len.max(1)) {
        let batch_labels = classify_batch(title, batch, locked, invoker, config, total_pages, retry_on_failure);
        merged.extend(batch_labels);
    }

    // Locked labels override model output; entries never classified by any
    // batch fall back to their locked label.
    for entry in &indexed {
        let Some(index) = entry.index else { continue };
        if let Some(label) = locked.get(&index) {
            merged.insert(index, *label);
        }
    }

    merged
}

fn classify_batch(
    title: &str,
    batch: &[&TocEntry],
    locked: &LabelMap,
    invoker: &dyn LlmInvoker,
    config: &LlmConfig,
    total_pages: usize,
    retry_on_failure: bool,
) -> LabelMap {
    let valid_indices: BTreeSet<usize> =
        batch.iter().filter_map(|entry| entry.index).collect();
    let user_prompt = render_user_prompt(title, batch, locked, total_pages);

    let mut attempt = BatchAttempt::First;
    loop {
        let system_prompt = match attempt {
            BatchAttempt::First => SYSTEM_PROMPT.to_string(),
            BatchAttempt::Corrective => format!("{SYSTEM_PROMPT}\n\n{CORRECTIVE_PROMPT}"),
        };

        let labels = match invoker.invoke(&system_prompt, &user_prompt) {
            Ok(raw) => validate_response(&raw, &valid_indices),
            Err(err) => {
                warn!(error = %err, "llm invocation failed");
                LabelMap::new()
            }
        };

        if !labels.is_empty() {
            return labels;
        }

        match attempt {
            BatchAttempt::First if retry_on_failure => {
                debug!("batch yielded no valid labels, retrying with corrective instruction");
                attempt = BatchAttempt::Corrective;
            }
            _ => {
                warn!(
                    batch_len = batch.len(),
                    "batch classification degraded to locked labels"
                );
                let mut degraded = LabelMap::new();
                for index in &valid_indices {
                    if let Some(label) = locked.get(index) {
                        degraded.insert(*index, *label);
                    }
                }
                return degraded;
            }
        }
    }
}

fn render_user_prompt(
    title: &str,
    batch: &[&TocEntry],
    locked: &LabelMap,
    total_pages: usize,
) -> String {
    let mut lines = Vec::with_capacity(batch.len() + 4);
    lines.push(format!("Document: {title}"));
    lines.push(format!("Total pages: {total_pages}"));
    lines.push("Outline entries (idx | level | title | page | locked hint):".to_string());

    for entry in batch {
        let Some(index) = entry.index else { continue };
        let page = entry
            .page
            .map(|page| page.to_string())
            .unwrap_or_else(|| "?".to_string());
        let hint = locked
            .get(&index)
            .map(|label| label.as_str())
            .unwrap_or("-");
        lines.push(format!(
            "{index} | {} | {} | {page} | {hint}",
            entry.level, entry.title
        ));
    }

    lines.join("\n")
}

/// Parses and validates one model response. Rejects non-list output, items
/// missing fields, labels outside the vocabulary, idx values outside this
/// batch, and duplicate idx values (first occurrence wins).
fn validate_response(raw: &str, valid_indices: &BTreeSet<usize>) -> LabelMap {
    let Some(json_slice) = extract_json_array(raw) else {
        warn!("llm response contains no json array");
        return LabelMap::new();
    };

    let items: Vec<RawLabel> = match serde_json::from_str(json_slice) {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "llm response json is not a label array");
            return LabelMap::new();
        }
    };

    let mut labels = LabelMap::new();
    for item in items {
        let Ok(index) = usize::try_from(item.idx) else {
            warn!(idx = item.idx, "rejecting negative idx");
            continue;
        };
        if !valid_indices.contains(&index) {
            warn!(idx = index, "rejecting idx outside batch");
            continue;
        }
        let Some(label) = SectionLabel::parse(&item.label) else {
            warn!(idx = index, label = %item.label, "rejecting label outside vocabulary");
            continue;
        };
        if labels.contains_key(&index) {
            warn!(idx = index, "dropping duplicate idx");
            continue;
        }
        labels.insert(index, label);
    }

    labels
}

/// Models sometimes wrap the array in prose or code fences; take the
/// outermost bracketed slice.
fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Entries eligible for the LLM pass: parsed, not already labeled.
pub fn unresolved_entries(entries: &[TocEntry], labels: &LabelMap) -> Vec<TocEntry> {
    entries
        .iter()
        .filter(|entry| {
            entry
                .index
                .is_some_and(|index| !labels.contains_key(&index))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::anyhow;

    use super::*;
    use crate::llm::LlmConfig;

    fn entry(index: usize, title: &str) -> TocEntry {
        TocEntry {
            index: Some(index),
            level: 1,
            title: title.to_string(),
            page: Some(index as i64 + 1),
            roman: None,
            front: false,
            marked: false,
            raw: String::new(),
        }
    }

    /// Fake invoker that answers every prompt by labeling each idx it sees
    /// in the user prompt, with an optional scripted prefix of canned
    /// responses played first.
    struct FakeInvoker {
        scripted: RefCell<Vec<Result<String, String>>>,
        default_label: &'static str,
        calls: RefCell<usize>,
    }

    impl FakeInvoker {
        fn echoing(label: &'static str) -> Self {
            Self {
                scripted: RefCell::new(Vec::new()),
                default_label: label,
                calls: RefCell::new(0),
            }
        }

        fn scripted(responses: Vec<Result<String, String>>) -> Self {
            Self {
                scripted: RefCell::new(responses),
                default_label: "findings",
                calls: RefCell::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.borrow()
        }
    }

    impl LlmInvoker for FakeInvoker {
        fn invoke(&self, _system: &str, user: &str) -> anyhow::Result<String> {
            *self.calls.borrow_mut() += 1;
            let mut scripted = self.scripted.borrow_mut();
            if !scripted.is_empty() {
                return match scripted.remove(0) {
                    Ok(text) => Ok(text),
                    Err(message) => Err(anyhow!(message)),
                };
            }

            let mut items = Vec::new();
            for line in user.lines() {
                let Some((first, _)) = line.split_once(" | ") else {
                    continue;
                };
                if let Ok(idx) = first.trim().parse::<i64>() {
                    items.push(format!(
                        r#"{{"idx": {idx}, "label": "{}"}}"#,
                        self.default_label
                    ));
                }
            }
            Ok(format!("[{}]", items.join(", ")))
        }
    }

    fn tiny_config() -> LlmConfig {
        LlmConfig {
            context_window: 600,
            max_output_tokens: 100,
            chars_per_token: 2,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn multi_batch_split_covers_every_index_exactly_once() {
        let entries: Vec<TocEntry> = (0..50)
            .map(|index| entry(index, &format!("Section heading number {index}")))
            .collect();
        let invoker = FakeInvoker::echoing("findings");

        let labels = classify(
            "Synthetic report",
            &entries,
            &LabelMap::new(),
            &invoker,
            &tiny_config(),
            120,
            false,
        );

        assert!(invoker.call_count() > 1, "budget must force several batches");
        let indices: Vec<usize> = labels.keys().copied().collect();
        assert_eq!(indices, (0..50).collect::<Vec<usize>>());
        assert!(labels.values().all(|label| *label == SectionLabel::Findings));
    }

    #[test]
    fn batches_reuse_original_indices_starting_above_zero() {
        // Unresolved entries often start well above index 0.
        let entries: Vec<TocEntry> = (10..14).map(|index| entry(index, "Heading")).collect();
        let invoker = FakeInvoker::echoing("context");

        let labels = classify(
            "Doc",
            &entries,
            &LabelMap::new(),
            &invoker,
            &LlmConfig::default(),
            30,
            false,
        );
        let indices: Vec<usize> = labels.keys().copied().collect();
        assert_eq!(indices, vec![10, 11, 12, 13]);
    }

    #[test]
    fn locked_label_beats_model_output() {
        let entries = vec![entry(0, "Annex A"), entry(1, "Heading")];
        let mut locked = LabelMap::new();
        locked.insert(0, SectionLabel::Annexes);
        let invoker = FakeInvoker::echoing("findings");

        let labels = classify(
            "Doc",
            &entries,
            &locked,
            &invoker,
            &LlmConfig::default(),
            30,
            false,
        );
        assert_eq!(labels.get(&0), Some(&SectionLabel::Annexes));
        assert_eq!(labels.get(&1), Some(&SectionLabel::Findings));
    }

    #[test]
    fn parse_failure_retries_once_with_corrective_prompt_then_succeeds() {
        let entries = vec![entry(0, "Heading")];
        let invoker = FakeInvoker::scripted(vec![Ok("I think this is findings!".to_string())]);

        let labels = classify(
            "Doc",
            &entries,
            &LabelMap::new(),
            &invoker,
            &LlmConfig::default(),
            30,
            true,
        );
        assert_eq!(invoker.call_count(), 2);
        assert_eq!(labels.get(&0), Some(&SectionLabel::Findings));
    }

    #[test]
    fn repeated_failure_degrades_to_locked_labels() {
        let entries = vec![entry(0, "Annex A"), entry(1, "Heading")];
        let mut locked = LabelMap::new();
        locked.insert(0, SectionLabel::Annexes);
        let invoker = FakeInvoker::scripted(vec![
            Err("connection refused".to_string()),
            Err("connection refused".to_string()),
        ]);

        let labels = classify(
            "Doc",
            &entries,
            &locked,
            &invoker,
            &LlmConfig::default(),
            30,
            true,
        );
        assert_eq!(invoker.call_count(), 2);
        assert_eq!(labels.get(&0), Some(&SectionLabel::Annexes));
        assert!(!labels.contains_key(&1));
    }

    #[test]
    fn validation_rejects_foreign_and_duplicate_indices() {
        let valid: BTreeSet<usize> = [3, 4].into_iter().collect();
        let raw = r#"Here you go:
[{"idx": 3, "label": "findings"}, {"idx": 3, "label": "context"},
 {"idx": 9, "label": "findings"}, {"idx": 4, "label": "made_up"},
 {"idx": -1, "label": "findings"}]"#;

        let labels = validate_response(raw, &valid);
        assert_eq!(labels.len(), 1);
        // First occurrence wins for the duplicate idx.
        assert_eq!(labels.get(&3), Some(&SectionLabel::Findings));
    }

    #[test]
    fn non_list_output_yields_no_labels() {
        let valid: BTreeSet<usize> = [0].into_iter().collect();
        assert!(validate_response("no json here", &valid).is_empty());
        assert!(validate_response(r#"{"idx": 0, "label": "findings"}"#, &valid).is_empty());
    }

    #[test]
    fn unresolved_entries_skips_labeled_and_passthrough() {
        let mut entries = vec![entry(0, "A"), entry(1, "B")];
        entries.push(TocEntry {
            index: None,
            level: 1,
            title: "stray".to_string(),
            page: None,
            roman: None,
            front: false,
            marked: false,
            raw: "stray".to_string(),
        });
        let mut labels = LabelMap::new();
        labels.insert(0, SectionLabel::Context);

        let unresolved = unresolved_entries(&entries, &labels);
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].index, Some(1));
    }
}
