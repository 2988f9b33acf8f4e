use std::collections::BTreeSet;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::model::{LabelMap, SectionLabel, TocEntry};

/// Index-keyed deterministic labeling: keyword locking, hierarchy
/// propagation, and a pluggable sequence-correction pass. Labels assigned by
/// keyword rules are "locked" and are never overridden by the LLM pass.
#[derive(Debug)]
pub struct DeterministicLabeler {
    keyword_rules: Vec<(Regex, SectionLabel)>,
}

/// Keyword patterns per label, multilingual (en/fr/es). Order matters: the
/// first matching rule wins, so the more specific patterns come first.
const KEYWORD_PATTERNS: &[(&str, SectionLabel)] = &[
    (
        r"executive summary|r[eé]sum[eé] ex[eé]cutif|resumen ejecutivo|summary of findings",
        SectionLabel::ExecutiveSummary,
    ),
    (
        r"recommendations?|recommandations?|recomendaci[oó]n(es)?",
        SectionLabel::Recommendations,
    ),
    (
        r"conclusions?|conclusiones",
        SectionLabel::Conclusions,
    ),
    (
        r"findings|results|constatations?|r[eé]sultats|hallazgos|resultados",
        SectionLabel::Findings,
    ),
    (
        r"methodolog(y|ies)|methods|m[eé]thodologie|metodolog[ií]a|approach",
        SectionLabel::Methodology,
    ),
    (
        r"introduction|introducci[oó]n|background|context[e]?|antecedentes|purpose|objectives?|objectifs?|objetivos?",
        SectionLabel::Context,
    ),
    (
        r"annex(e|es)?|appendi(x|ces)|anexos?|references|bibliograph(y|ie)|bibliograf[ií]a",
        SectionLabel::Annexes,
    ),
    (
        r"acknowledge?ments?|table of contents|contents|abbreviations|acronyms|list of (figures|tables)|remerciements|glossar(y|io)?",
        SectionLabel::Other,
    ),
];

impl DeterministicLabeler {
    pub fn new() -> Result<Self> {
        let mut keyword_rules = Vec::with_capacity(KEYWORD_PATTERNS.len());
        for (pattern, label) in KEYWORD_PATTERNS {
            let regex = Regex::new(&format!(r"(?i)\b(?:{pattern})\b"))
                .with_context(|| format!("failed to compile keyword pattern for {}", label.as_str()))?;
            keyword_rules.push((regex, *label));
        }
        Ok(Self { keyword_rules })
    }

    /// Keyword locking: titles matching a known section keyword get a label
    /// directly. The returned map is the locked set.
    pub fn lock_keywords(&self, entries: &[TocEntry]) -> LabelMap {
        let mut locked = LabelMap::new();
        for entry in entries {
            let Some(index) = entry.index else {
                continue;
            };
            let title = strip_leading_numeral(&entry.title);
            for (regex, label) in &self.keyword_rules {
                if regex.is_match(title) {
                    locked.insert(index, *label);
                    break;
                }
            }
        }
        debug!(locked = locked.len(), total = entries.len(), "keyword locking complete");
        locked
    }

    /// Hierarchy propagation: an unlabeled entry inherits the label of its
    /// nearest labeled ancestor (the most recent entry at a strictly lower
    /// level). Propagation stops at the document root.
    pub fn propagate_hierarchy(&self, entries: &[TocEntry], labels: &LabelMap) -> LabelMap {
        let mut result = labels.clone();
        let mut ancestors: Vec<(u32, usize)> = Vec::new();

        for entry in entries {
            let Some(index) = entry.index else {
                continue;
            };
            while ancestors
                .last()
                .is_some_and(|(level, _)| *level >= entry.level)
            {
                ancestors.pop();
            }

            if !result.contains_key(&index) {
                let inherited = ancestors
                    .iter()
                    .rev()
                    .find_map(|(_, ancestor_index)| result.get(ancestor_index).copied());
                if let Some(label) = inherited {
                    result.insert(index, label);
                }
            }

            ancestors.push((entry.level, index));
        }

        result
    }
}

fn strip_leading_numeral(title: &str) -> &str {
    let trimmed = title.trim_start();
    let Some(first) = trimmed.split_whitespace().next() else {
        return trimmed;
    };
    let numeral = first.trim_end_matches(['.', ')']);
    let is_numeral = !numeral.is_empty()
        && numeral
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()));
    if is_numeral {
        trimmed[first.len()..].trim_start()
    } else {
        trimmed
    }
}

/// Post-hoc repair rule over the fully-resolved label sequence. Rules must
/// be idempotent: applying one twice yields the same map.
pub trait SequenceRule {
    fn name(&self) -> &'static str;
    fn apply(&self, entries: &[TocEntry], labels: &LabelMap, locked: &BTreeSet<usize>) -> LabelMap;
}

/// A single `other` surrounded on both sides by the same label is absorbed
/// into that label.
pub struct IsolatedOtherAbsorption;

impl SequenceRule for IsolatedOtherAbsorption {
    fn name(&self) -> &'static str {
        "isolated_other_absorption"
    }

    fn apply(&self, entries: &[TocEntry], labels: &LabelMap, locked: &BTreeSet<usize>) -> LabelMap {
        let indexed: Vec<usize> = entries.iter().filter_map(|entry| entry.index).collect();
        let mut result = labels.clone();

        for window in indexed.windows(3) {
            let [prev, current, next] = [window[0], window[1], window[2]];
            if locked.contains(&current) {
                continue;
            }
            let (Some(prev_label), Some(current_label), Some(next_label)) = (
                labels.get(&prev).copied(),
                labels.get(&current).copied(),
                labels.get(&next).copied(),
            ) else {
                continue;
            };
            if current_label == SectionLabel::Other
                && prev_label == next_label
                && prev_label != SectionLabel::Other
            {
                result.insert(current, prev_label);
            }
        }

        result
    }
}

/// Front-matter entries before the first body label default to `other`
/// unless a keyword rule already locked them.
pub struct LeadingFrontMatterRule;

impl SequenceRule for LeadingFrontMatterRule {
    fn name(&self) -> &'static str {
        "leading_front_matter"
    }

    fn apply(&self, entries: &[TocEntry], labels: &LabelMap, locked: &BTreeSet<usize>) -> LabelMap {
        let mut result = labels.clone();
        for entry in entries {
            let Some(index) = entry.index else {
                continue;
            };
            if !entry.front {
                break;
            }
            if !locked.contains(&index) && !labels.contains_key(&index) {
                result.insert(index, SectionLabel::Other);
            }
        }
        result
    }
}

pub fn default_sequence_rules() -> Vec<Box<dyn SequenceRule>> {
    vec![Box::new(IsolatedOtherAbsorption), Box::new(LeadingFrontMatterRule)]
}

/// Runs every rule once, in order. Each rule is idempotent, so the whole
/// pass is too.
pub fn correct_sequence(
    entries: &[TocEntry],
    labels: &LabelMap,
    locked: &BTreeSet<usize>,
    rules: &[Box<dyn SequenceRule>],
) -> LabelMap {
    let mut current = labels.clone();
    for rule in rules {
        let revised = rule.apply(entries, &current, locked);
        if revised != current {
            debug!(rule = rule.name(), "sequence rule revised labels");
        }
        current = revised;
    }
    current
}
