use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::cache::{MetadataStore, SqliteStore, StoredToc};
use crate::cli::StatusArgs;
use crate::pipeline::OutlinePipeline;

#[derive(Debug, Serialize)]
struct DocStatus {
    doc_id: String,
    entries: usize,
    labeled: usize,
    persisted: bool,
    labels: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    db_path: String,
    doc_count: usize,
    docs: Vec<DocStatus>,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("toctag_index.sqlite"));
    let store = SqliteStore::open(&db_path)?;
    let pipeline = OutlinePipeline::new()?;

    let listed = store.list_docs()?;
    let docs: Vec<DocStatus> = listed
        .into_iter()
        .filter(|(doc_id, _)| {
            args.doc_id
                .as_ref()
                .is_none_or(|wanted| wanted == doc_id)
        })
        .map(|(doc_id, stored)| doc_status(&pipeline, doc_id, stored))
        .collect();

    let report = StatusReport {
        db_path: db_path.display().to_string(),
        doc_count: docs.len(),
        docs,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn doc_status(pipeline: &OutlinePipeline, doc_id: String, stored: StoredToc) -> DocStatus {
    let text = stored
        .classified
        .as_deref()
        .unwrap_or(stored.toc_text.as_str());
    let (entries, labels) = pipeline.codec().parse_with_labels(text);

    let mut histogram: BTreeMap<String, usize> = BTreeMap::new();
    for label in labels.values() {
        *histogram.entry(label.as_str().to_string()).or_insert(0) += 1;
    }

    DocStatus {
        doc_id,
        entries: entries.len(),
        labeled: labels.len(),
        persisted: stored.persisted,
        labels: histogram,
    }
}
