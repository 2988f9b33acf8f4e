use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cache::SqliteStore;
use crate::cli::ClassifyArgs;
use crate::llm::{LlmConfig, LlmInvoker, UreqInvoker};
use crate::outline::{LayoutHeading, OutlineSelector, extract_pages_with_pdftotext};
use crate::pipeline::OutlinePipeline;
use crate::roman::PageContent;
use crate::util::{doc_id_for_file, ensure_directory};

pub fn run(args: ClassifyArgs) -> Result<()> {
    ensure_directory(&args.cache_root)?;
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("toctag_index.sqlite"));
    let store = SqliteStore::open(&db_path)?;

    let pipeline = OutlinePipeline::new()?;
    let selector = OutlineSelector::new()?;

    let doc_id = resolve_doc_id(&args)?;
    let title = args
        .title
        .clone()
        .or_else(|| {
            args.pdf_path
                .as_ref()
                .or(args.toc_path.as_ref())
                .and_then(|path| path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| doc_id.clone());

    let pages: Vec<String> = match &args.pdf_path {
        Some(pdf_path) => extract_pages_with_pdftotext(pdf_path, args.max_pages)?,
        None => Vec::new(),
    };

    let toc_text = resolve_toc_text(&args, &selector, &pipeline, &pages)?;
    if toc_text.trim().is_empty() {
        bail!("no outline could be produced for document {doc_id}");
    }

    let llm_config = llm_config_from_args(&args);
    let invoker = build_invoker(&args, &llm_config)?;

    let page_contents: Vec<PageContent> = pages
        .iter()
        .map(|text| PageContent::from_text(text))
        .collect();
    let page_source: Option<&dyn crate::roman::PageSource> =
        (!page_contents.is_empty()).then_some(&page_contents as &dyn crate::roman::PageSource);

    let (cache, stats) = pipeline.classify_document(
        &store,
        &doc_id,
        &title,
        &toc_text,
        page_source,
        invoker.as_deref(),
        &llm_config,
        args.retry_on_failure,
    )?;

    info!(
        doc_id = %doc_id,
        entries = stats.entries,
        locked = stats.locked,
        propagated = stats.propagated,
        llm_labeled = stats.llm_labeled,
        from_cache = stats.from_cache,
        persisted_now = stats.persisted_now,
        "classify completed"
    );

    println!(
        "{}",
        pipeline.codec().render(&cache.entries, Some(&cache.labels))
    );
    Ok(())
}

fn resolve_doc_id(args: &ClassifyArgs) -> Result<String> {
    if let Some(doc_id) = &args.doc_id {
        return Ok(doc_id.clone());
    }
    let source = args
        .pdf_path
        .as_deref()
        .or(args.toc_path.as_deref())
        .or(args.headings_path.as_deref());
    match source {
        Some(path) => doc_id_for_file(path),
        None => bail!("either --doc-id or an input file is required"),
    }
}

fn resolve_toc_text(
    args: &ClassifyArgs,
    selector: &OutlineSelector,
    pipeline: &OutlinePipeline,
    pages: &[String],
) -> Result<String> {
    if let Some(toc_path) = &args.toc_path {
        return fs::read_to_string(toc_path)
            .with_context(|| format!("failed to read {}", toc_path.display()));
    }

    let layout = match &args.headings_path {
        Some(path) => read_layout_headings(path)?,
        None => Vec::new(),
    };

    let bookmarks = match &args.pdf_path {
        Some(pdf_path) => match selector.bookmarks_from_pdf(pdf_path) {
            Ok(bookmarks) => bookmarks,
            Err(err) => {
                warn!(error = %err, "bookmark extraction failed, continuing without");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let (toc_text, origin) = selector.select(pipeline.codec(), &layout, &bookmarks, pages);
    info!(origin = origin.as_str(), "selected outline source");
    Ok(toc_text)
}

fn read_layout_headings(path: &Path) -> Result<Vec<LayoutHeading>> {
    let raw =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse layout headings from {}", path.display()))
}

fn llm_config_from_args(args: &ClassifyArgs) -> LlmConfig {
    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("TOCTAG_API_KEY").ok())
        .unwrap_or_default();
    LlmConfig {
        endpoint: args.llm_endpoint.clone(),
        api_key,
        model: args.llm_model.clone(),
        context_window: args.context_window,
        max_output_tokens: args.max_output_tokens,
        chars_per_token: args.chars_per_token,
        timeout_secs: args.llm_timeout_secs,
    }
}

fn build_invoker(
    args: &ClassifyArgs,
    config: &LlmConfig,
) -> Result<Option<Box<dyn LlmInvoker>>> {
    if args.no_llm {
        return Ok(None);
    }
    if config.api_key.is_empty() {
        warn!("no api key configured, skipping llm classification");
        return Ok(None);
    }
    let invoker = UreqInvoker::new(config.clone())?;
    Ok(Some(Box::new(invoker)))
}
