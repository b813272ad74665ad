use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxy_lab::{logging, Args, BatchReport, EnvConfig, Lab, ProxyRecord};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Proxy delay, speed and IP purity tester
#[derive(Parser)]
#[command(name = "proxy-lab")]
#[command(about = "Proxy delay, speed and IP purity tester with cached results and cron refresh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one batch and print the processed node list
    Check {
        /// Request body: {conf, proxies, platform} or {conf, args}
        input: PathBuf,
        /// Write the node list here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run one batch, then keep cron jobs running until Ctrl-C
    Watch {
        /// Request body: {conf, proxies, platform} or {conf, args}
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = EnvConfig::from_env();
    logging::init_logging(&env);

    let lab = Lab::new(env).await.context("failed to start")?;

    match cli.command {
        Commands::Check { input, output } => {
            let (records, mut report) = run_batch(&lab, &input).await?;
            // results of this run land in the cache for the next batch
            for summary in report.join_refreshes().await {
                info!(
                    total = summary.total,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "refresh finished"
                );
            }
            let json = serde_json::to_string_pretty(&records)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("Saved {} nodes to {:?}", records.len(), path);
                }
                None => println!("{json}"),
            }
        }
        Commands::Watch { input } => {
            let (records, _report) = run_batch(&lab, &input).await?;
            eprintln!("Processed {} nodes, watching for cron runs (Ctrl-C to stop)", records.len());
            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
        }
    }

    lab.shutdown().await?;
    Ok(())
}

async fn run_batch(lab: &Lab, input: &Path) -> Result<(Vec<ProxyRecord>, BatchReport)> {
    let body = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let args = Args::from_json(&body)?;
    eprintln!("Loaded {} proxies for {}", args.proxies.len(), args.conf.id);

    let (records, report) = lab.run(&args).await;
    for err in &report.errors {
        eprintln!("  {err}");
    }
    eprintln!(
        "Results: {} nodes, {} errors, {} refreshes started",
        records.len(),
        report.errors.len(),
        report.refreshes.len()
    );

    if lab.env().output_nodes_json {
        let path = lab.env().data_dir.join("proxy-lab.json");
        match serde_json::to_vec_pretty(&records) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to dump nodes");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode nodes"),
        }
    }
    Ok((records, report))
}
