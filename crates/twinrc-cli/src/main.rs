use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use twinrc_storage::{PgSensorStore, SensorStore};
use twinrc_web::{build_state, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "twinrc-cli")]
#[command(about = "Recovery Companion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a wearable CSV export for a patient.
    Ingest {
        file: PathBuf,
        /// Target patient profile; a demo profile is created when omitted.
        #[arg(long)]
        patient_id: Option<i64>,
    },
    /// Serve the HTTP API.
    Serve,
    /// Apply schema migrations to the configured database.
    Migrate,
    /// Create demo patient profiles.
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Ingest { file, patient_id } => {
            let state = build_state(&config).await?;
            let patient_id = match patient_id {
                Some(id) => id,
                None => {
                    let id = state
                        .store
                        .create_patient_profile(serde_json::json!({}), "")
                        .await?;
                    eprintln!("no --patient-id given; created profile {id}");
                    id
                }
            };
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report = state.pipeline.ingest(&raw, patient_id).await?;
            println!(
                "ingest complete: patient={} parsed={} persisted={}",
                patient_id, report.parsed_rows, report.persisted_rows
            );
            println!("{}", serde_json::to_string_pretty(&report.features)?);
        }
        Commands::Serve => twinrc_web::serve_from_env().await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .context("DATABASE_URL must be set for migrate")?;
            let store = PgSensorStore::connect(&url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Seed => {
            let state = build_state(&config).await?;
            for (demographics, history) in [
                (serde_json::json!({"age": 45, "sex": "M"}), "Post-orthopedic surgery"),
                (serde_json::json!({"age": 62, "sex": "F"}), "Hip replacement rehab"),
            ] {
                let id = state
                    .store
                    .create_patient_profile(demographics, history)
                    .await?;
                println!("created patient profile {id}");
            }
        }
    }

    Ok(())
}
