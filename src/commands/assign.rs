use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::assign::tag_chunk;
use crate::cache::SqliteStore;
use crate::cli::AssignArgs;
use crate::model::{Chunk, TagOutcome};
use crate::pipeline::OutlinePipeline;

pub fn run(args: AssignArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("toctag_index.sqlite"));
    let store = SqliteStore::open(&db_path)?;

    let pipeline = OutlinePipeline::new()?;
    let Some(cache) = pipeline.load_cache(&store, &args.doc_id)? else {
        bail!(
            "document {} has no stored outline; run classify first",
            args.doc_id
        );
    };
    if !cache.persisted {
        warn!(doc_id = %args.doc_id, "outline is unclassified, labels will be deterministic only");
    }

    let reader: Box<dyn BufRead> = if args.chunks_path == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.chunks_path)
            .with_context(|| format!("failed to open {}", args.chunks_path))?;
        Box::new(BufReader::new(file))
    };

    let mut writer: Box<dyn Write> = match &args.output_path {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let mut histogram: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut chunk_count = 0_usize;
    let mut skipped = 0_usize;

    for (line_number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read chunk line")?;
        if line.trim().is_empty() {
            continue;
        }

        let mut chunk: Chunk = match serde_json::from_str(&line) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(line = line_number + 1, error = %err, "skipping malformed chunk record");
                skipped += 1;
                continue;
            }
        };

        let outcome = tag_chunk(&chunk, &cache);
        let label = outcome.label();
        chunk.section_label = Some(label.as_str().to_string());
        if let TagOutcome::FieldUpdates(fields) = outcome {
            for (key, value) in fields {
                if key != "section_label" {
                    chunk.extra.insert(key, value);
                }
            }
        }

        serde_json::to_writer(&mut writer, &chunk).context("failed to serialize chunk")?;
        writer.write_all(b"\n").context("failed to write chunk")?;

        *histogram.entry(label.as_str()).or_insert(0) += 1;
        chunk_count += 1;
    }
    writer.flush().context("failed to flush output")?;

    info!(
        doc_id = %args.doc_id,
        chunks = chunk_count,
        skipped,
        histogram = ?histogram,
        "assign completed"
    );
    Ok(())
}
