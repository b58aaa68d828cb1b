use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gitfund::config::Settings;
use gitfund::store::PgStore;
use gitfund::taxid::TaxIdOutcome;
use gitfund::util::db::Db;
use gitfund::util::env as env_util;
use gitfund::Platform;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gf", version, about = "GitFund admin CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Cmd {
    /// Re-sync every backer not touched within the staleness window
    Sweep,
    /// Sync one backer now and print what is still out of sync
    Sync {
        #[arg(long)]
        backer: i64,
    },
    /// Print slot occupancy and funding progress
    Totals,
    /// Apply pending SQL migrations
    Migrate {
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,
    },
    /// Check a VAT id against the tax authority
    CheckTaxId { id: String },
}

async fn platform(settings: Settings) -> Result<Platform<PgStore>> {
    let db = Db::connect(&env_util::db_url()?, settings.db_max_connections).await?;
    Platform::production(settings, db)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    gitfund::telemetry::init_tracing("warn,gitfund=info")?;
    let cli = Cli::parse();
    let settings = Settings::from_env().context("loading settings")?;

    match cli.cmd {
        Cmd::Sweep => {
            let report = platform(settings).await?.run_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Cmd::Sync { backer } => {
            let errors = platform(settings).await?.force_sync(backer).await?;
            if errors.is_empty() {
                println!("backer {backer} is in sync");
            } else {
                for e in &errors {
                    println!("backer {backer}: {e}");
                }
                std::process::exit(1);
            }
        }
        Cmd::Totals => {
            let summary = platform(settings).await?.totals().await?;
            println!("{}", serde_json::to_string_pretty(&*summary)?);
        }
        Cmd::Migrate { dir } => {
            let db = Db::connect(&env_util::db_url()?, 1).await?;
            let applied = db.run_migrations(&dir).await?;
            if applied.is_empty() {
                println!("no pending migrations in {}", dir.display());
            } else {
                println!("applied migrations: {applied:?}");
            }
        }
        Cmd::CheckTaxId { id } => {
            match platform(settings).await?.check_tax_id(&id).await {
                TaxIdOutcome::Valid(detail) => {
                    println!("valid");
                    for (k, v) in detail {
                        println!("  {k}: {v}");
                    }
                }
                TaxIdOutcome::Invalid => println!("invalid"),
                TaxIdOutcome::Unavailable(reason) => {
                    eprintln!("tax authority unavailable: {reason}");
                    std::process::exit(2);
                }
            }
        }
    }
    Ok(())
}
