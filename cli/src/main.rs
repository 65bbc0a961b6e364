//! `biodedup`: deduplicate the corpora described by a TOML configuration.
//!
//! Usage: biodedup --config dedup.toml [--corpus NAME]... [--threshold F]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use biodedup_core::{
    CorpusSelection, CsvCorpusSource, DedupConfig, DedupPipeline, EmbeddingCache, EmbeddingConfig,
    RunReport,
};
use biodedup_embeddings::OpenAIProvider;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Remove near-duplicate records within and across text corpora
#[derive(Parser, Debug)]
#[command(name = "biodedup")]
#[command(
    about = "Remove near-duplicate records within and across text corpora",
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "dedup.toml")]
    config: PathBuf,

    /// Corpus to process; repeat for several. Defaults to every configured corpus
    #[arg(long = "corpus", value_name = "NAME")]
    corpora: Vec<String>,

    /// Cosine similarity above which records are near-duplicates, in (0, 1]
    #[arg(long)]
    threshold: Option<f32>,

    /// Embedding cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory for deduplicated corpora
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// List configured corpora and their cache entries, then exit
    #[arg(long)]
    list: bool,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides.
    fn load_config(&self) -> anyhow::Result<DedupConfig> {
        let mut config = DedupConfig::from_toml_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(threshold) = self.threshold {
            config = config.with_threshold(threshold);
        }
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn selection(&self) -> CorpusSelection {
        if self.corpora.is_empty() {
            CorpusSelection::All
        } else {
            CorpusSelection::Named(self.corpora.clone())
        }
    }
}

fn provider(config: &EmbeddingConfig) -> OpenAIProvider {
    let provider = OpenAIProvider::new()
        .with_base_url(&config.base_url)
        .with_model(&config.model);
    match &config.api_key_env {
        Some(var) => provider.with_api_key_env(var),
        None => provider.without_api_key(),
    }
}

/// Print every configured corpus with the cache keys it has entries for.
async fn list(config: &DedupConfig) -> anyhow::Result<()> {
    let cache = EmbeddingCache::new(&config.cache_dir).await?;
    for corpus in &config.corpora {
        let mut cached = Vec::new();
        for (role, _) in corpus.text.fields() {
            let key = role.cache_key(&corpus.name);
            if cache.contains(&key).await? {
                cached.push(key);
            }
        }
        let cached = if cached.is_empty() {
            "-".to_string()
        } else {
            cached.join(", ")
        };
        println!("{:<32} {cached}", corpus.name);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for summary in report.succeeded() {
        println!(
            "{:<32} kept {:>8} of {:>8}  (-{} cached, -{} within, -{} across)  {}",
            summary.name,
            summary.kept(),
            summary.input_records,
            summary.cache_dropped,
            summary.within_dropped,
            summary.across_dropped,
            summary.output_path.display()
        );
    }
    for (name, failure) in report.failed() {
        println!("{name:<32} FAILED  {failure}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    if cli.list {
        return list(&config).await;
    }

    info!(
        "Starting biodedup v{} with {} configured corpora",
        env!("CARGO_PKG_VERSION"),
        config.corpora.len()
    );

    let source = Arc::new(CsvCorpusSource::from_config(&config));
    let provider = Arc::new(provider(&config.embedding));
    let pipeline = DedupPipeline::new(config, source, provider).await?;
    let report = pipeline.run(&cli.selection()).await?;

    print_report(&report);
    if report.all_failed() {
        bail!("all {} selected corpora failed", report.len());
    }
    Ok(())
}
