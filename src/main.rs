use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use inbox_sweep::config::{LlmConfig, PipelineConfig};
use inbox_sweep::error::PipelineError;
use inbox_sweep::llm::create_provider;
use inbox_sweep::pipeline::{
    BatchStats, Categorization, CategorizationResult, Categorizer, Category, CategoryCatalog,
    EmailRecord, SenderReputationCache,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    results: &'a [CategorizationResult],
    stats: &'a BatchStats,
    summary: Vec<SummaryRow>,
    /// Set when the run degraded past the point of being useful.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct SummaryRow {
    category: Category,
    count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(user_id)) = (args.next(), args.next()) else {
        eprintln!("Usage: inbox-sweep <records.json> <user-id>");
        std::process::exit(2);
    };

    let llm_config = LlmConfig::from_env().context("LLM configuration")?;
    let config = PipelineConfig::from_env().context("pipeline configuration")?;

    eprintln!("📬 Inbox Sweep v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);

    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {path}"))?;
    let records: Vec<EmailRecord> =
        serde_json::from_str(&raw).with_context(|| format!("parsing records from {path}"))?;
    eprintln!("   Records: {}\n", records.len());

    let catalog = Arc::new(CategoryCatalog::default());
    let categorizer = Categorizer::new(
        create_provider(&llm_config).context("creating LLM provider")?,
        Arc::new(SenderReputationCache::new()),
        catalog.clone(),
        config,
    );

    let (categorization, failure) = match categorizer.categorize(&records, &user_id).await {
        Ok(categorization) => (categorization, None),
        Err(PipelineError::Unavailable { reason, partial }) => (*partial, Some(reason)),
    };

    print_report(&categorization, &catalog, failure.clone())?;

    if let Some(reason) = failure {
        anyhow::bail!("categorization unavailable: {reason}");
    }
    Ok(())
}

fn print_report(
    categorization: &Categorization,
    catalog: &CategoryCatalog,
    error: Option<String>,
) -> anyhow::Result<()> {
    let report = Report {
        results: &categorization.results,
        stats: &categorization.stats,
        summary: categorization
            .summary(catalog)
            .into_iter()
            .map(|(category, count)| SummaryRow { category, count })
            .collect(),
        error,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
