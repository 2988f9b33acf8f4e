use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "toctag",
    version,
    about = "Report outline normalization and section labeling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Classify(ClassifyArgs),
    Assign(AssignArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClassifyArgs {
    #[arg(long, default_value = ".cache/toctag")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Stable document identifier; derived from the input file hash when
    /// omitted.
    #[arg(long)]
    pub doc_id: Option<String>,

    /// Document title passed to the classifier prompt.
    #[arg(long)]
    pub title: Option<String>,

    /// Pre-made TOC text in the annotated line format.
    #[arg(long)]
    pub toc_path: Option<PathBuf>,

    /// Source PDF; supplies the bookmark outline, raw page text for roman
    /// detection, and the markdown fallback.
    #[arg(long)]
    pub pdf_path: Option<PathBuf>,

    /// Layout-engine heading stream as a JSON array of {text, level, page}.
    #[arg(long)]
    pub headings_path: Option<PathBuf>,

    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Skip the LLM pass entirely; deterministic labels only.
    #[arg(long, default_value_t = false)]
    pub no_llm: bool,

    /// Retry a batch once with a corrective instruction when the model's
    /// output cannot be parsed. Pass `--retry-on-failure false` to degrade
    /// straight to keyword-locked labels.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub retry_on_failure: bool,

    #[arg(long, default_value = "https://api.anthropic.com/v1/messages")]
    pub llm_endpoint: String,

    #[arg(long, default_value = "claude-3-5-haiku-latest")]
    pub llm_model: String,

    /// API key; falls back to the TOCTAG_API_KEY environment variable.
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long, default_value_t = 100_000)]
    pub context_window: usize,

    #[arg(long, default_value_t = 4_096)]
    pub max_output_tokens: usize,

    #[arg(long, default_value_t = 2)]
    pub chars_per_token: usize,

    #[arg(long, default_value_t = 60)]
    pub llm_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct AssignArgs {
    #[arg(long, default_value = ".cache/toctag")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub doc_id: String,

    /// Chunk records as JSON Lines ({page_num, headings, ...}); "-" reads
    /// stdin.
    #[arg(long, default_value = "-")]
    pub chunks_path: String,

    /// Output path for labeled chunks; stdout when omitted.
    #[arg(long)]
    pub output_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/toctag")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub doc_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_on_failure_defaults_on_and_can_be_disabled() {
        let cli = Cli::try_parse_from(["toctag", "classify"]).unwrap();
        let Commands::Classify(args) = cli.command else {
            panic!("expected classify subcommand");
        };
        assert!(args.retry_on_failure);

        let cli = Cli::try_parse_from(["toctag", "classify", "--retry-on-failure", "false"]).unwrap();
        let Commands::Classify(args) = cli.command else {
            panic!("expected classify subcommand");
        };
        assert!(!args.retry_on_failure);
    }
}
