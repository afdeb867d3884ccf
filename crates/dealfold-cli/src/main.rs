use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dealfold_core::{OpportunityRecord, Priority, Stage};
use dealfold_engine::{ConsolidatorConfig, OpportunityConsolidator};
use dealfold_storage::{OpportunityFilter, OpportunityStore, Pagination};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dealfold-cli")]
#[command(about = "Dealfold command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert a JSON array of records into the configured store.
    Upsert {
        #[arg(long)]
        input: PathBuf,
    },
    /// List stored records with optional filters.
    List {
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Correlate and consolidate stored records, writing
    /// composite-opportunities.json and opportunity-clusters.json.
    Consolidate {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        min_score: Option<f64>,
    },
    /// Store-level counts and distinct vendors/customers.
    Stats,
}

#[derive(Debug, Serialize)]
struct ConsolidationRunSummary {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    records: usize,
    clusters: usize,
    composites: usize,
    conflicted_composites: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = OpportunityStore::from_env().await?;

    match cli.command {
        Commands::Upsert { input } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let records: Vec<OpportunityRecord> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", input.display()))?;
            let result = store.upsert(records).await?;
            println!(
                "upsert complete: created={} updated={} errors={}",
                result.created,
                result.updated,
                result.errors.len()
            );
            for error in &result.errors {
                eprintln!(
                    "  {:?} {}: {}",
                    error.code,
                    error.id.as_deref().unwrap_or("-"),
                    error.message
                );
            }
        }
        Commands::List {
            vendor,
            customer,
            stage,
            priority,
            search,
            limit,
            offset,
        } => {
            let filter = OpportunityFilter {
                vendor,
                customer,
                stage: stage.as_deref().map(Stage::parse),
                priority: priority.as_deref().map(Priority::parse),
                search_text: search,
                ..Default::default()
            };
            let page = store.find(&filter, Pagination { limit, offset }).await?;
            for record in &page.data {
                println!(
                    "{}  {:<14} {:<7} {}",
                    record.id, record.stage, record.priority, record.name
                );
            }
            println!(
                "{} of {} (offset {})",
                page.data.len(),
                page.total,
                page.offset
            );
        }
        Commands::Consolidate { out_dir, min_score } => {
            let started_at = Utc::now();
            let run_id = Uuid::new_v4();
            let records = store.get_all().await?;

            let config = match min_score {
                Some(min_score) => ConsolidatorConfig { min_score },
                None => ConsolidatorConfig::default(),
            };
            let consolidator = OpportunityConsolidator::new(config);
            let clusters = consolidator.correlate(&records);
            let composites = consolidator.consolidate(&records);

            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("creating {}", out_dir.display()))?;
            let composites_path = out_dir.join("composite-opportunities.json");
            std::fs::write(
                &composites_path,
                serde_json::to_vec_pretty(&composites).context("serializing composites")?,
            )
            .with_context(|| format!("writing {}", composites_path.display()))?;
            let clusters_path = out_dir.join("opportunity-clusters.json");
            std::fs::write(
                &clusters_path,
                serde_json::to_vec_pretty(&clusters).context("serializing clusters")?,
            )
            .with_context(|| format!("writing {}", clusters_path.display()))?;

            let summary = ConsolidationRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                records: records.len(),
                clusters: clusters.len(),
                composites: composites.len(),
                conflicted_composites: composites
                    .iter()
                    .filter(|c| !c.conflicts.is_empty())
                    .count(),
            };
            let summary_path = out_dir.join("consolidation-run.json");
            std::fs::write(
                &summary_path,
                serde_json::to_vec_pretty(&summary).context("serializing run summary")?,
            )
            .with_context(|| format!("writing {}", summary_path.display()))?;

            println!(
                "consolidate complete: run_id={} records={} clusters={} composites={} out={}",
                summary.run_id,
                summary.records,
                summary.clusters,
                summary.composites,
                out_dir.display()
            );
        }
        Commands::Stats => {
            let total = store.count(None).await?;
            let vendors = store.distinct_vendors().await?;
            let customers = store.distinct_customers().await?;
            if let Some(path) = store.data_path() {
                println!("data file: {}", path.display());
            }
            println!(
                "records={} vendors={} customers={}",
                total,
                vendors.len(),
                customers.len()
            );
            for vendor in &vendors {
                println!("  vendor: {vendor}");
            }
            for customer in &customers {
                println!("  customer: {customer}");
            }
        }
    }

    store.close().await?;
    Ok(())
}
