// SPDX-License-Identifier: MIT

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;

use chartflow_rs::chartflow::{flaky_pipeline, AppConfig, StateLoader};
use chartflow_rs::engine::migration::{migrate_state, upgrade_to_current};
use chartflow_rs::engine::session::Session;
use chartflow_rs::engine::snapshot::{create_state_snapshot, verify_state_snapshot};
use chartflow_rs::engine::state::{validate_payload, WorkflowState, CURRENT_SCHEMA_VERSION};
use chartflow_rs::engine::store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a stored state against the current schema
    Validate {
        /// State file (.json, .yaml or .yml)
        file: PathBuf,
    },
    /// Upgrade a stored state to a newer schema version
    Migrate {
        file: PathBuf,

        /// Target schema version
        #[arg(short, long, default_value_t = CURRENT_SCHEMA_VERSION)]
        to: u32,
    },
    /// Upgrade, validate and checksum a stored state
    Snapshot { file: PathBuf },
    /// Check a snapshot against its checksum
    Verify { file: PathBuf },
    /// Print the JSON Schema of the current state
    Schema,
    /// Run the built-in pipeline on a question
    Demo {
        /// A user question; repeat to run several sessions concurrently
        #[arg(short, long, required = true)]
        question: Vec<String>,

        #[arg(long, default_value = "warehouse")]
        datasource: String,

        #[arg(long, default_value = "orders")]
        table: String,

        /// Fail the first N intent classifications with a timeout
        #[arg(long, default_value_t = 0)]
        flaky: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let loader = StateLoader::new();

    match args.command {
        Commands::Validate { file } => {
            let payload = loader.load_payload(&file)?;
            let result = validate_payload(&payload);
            if !result.is_valid() {
                for violation in result.violations() {
                    eprintln!("  {}", violation);
                }
                bail!(
                    "{} is not a valid schema version {} state ({} violation(s))",
                    file.display(),
                    CURRENT_SCHEMA_VERSION,
                    result.violations().len()
                );
            }
            println!("{}: valid", file.display());
        }
        Commands::Migrate { file, to } => {
            let payload = loader.load_payload(&file)?;
            let from = payload.schema_version();
            let migrated = migrate_state(payload, to)
                .with_context(|| format!("migrating {}", file.display()))?;
            log::info!("Migrated {} from version {} to {}", file.display(), from, to);
            println!("{}", serde_json::to_string_pretty(&migrated.into_value())?);
        }
        Commands::Snapshot { file } => {
            let payload = loader.load_payload(&file)?;
            let state = upgrade_to_current(payload)?;
            let snapshot = create_state_snapshot(state)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Verify { file } => {
            let snapshot = loader.load_snapshot(&file)?;
            if !verify_state_snapshot(&snapshot) {
                bail!(
                    "checksum mismatch for session {} in {}",
                    snapshot.session_id(),
                    file.display()
                );
            }
            println!("{}: checksum {} ok", file.display(), snapshot.checksum);
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(WorkflowState);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Demo {
            question,
            datasource,
            table,
            flaky,
        } => {
            let config = AppConfig::load(args.config.as_deref())?;

            let store: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
                Some(dir) => {
                    log::info!("Writing checkpoints to {}", dir.display());
                    Arc::new(FileCheckpointStore::new(dir))
                }
                None => Arc::new(InMemoryCheckpointStore::new()),
            };

            // Sessions share the store only; each gets its own nodes
            let sessions: Vec<(Session, WorkflowState)> = question
                .into_iter()
                .map(|q| {
                    let pipeline = flaky_pipeline(&config, &datasource, &table, flaky);
                    let session = Session::builder().nodes(pipeline).store(store.clone()).build();
                    (session, WorkflowState::new_session().with_user_message(q))
                })
                .collect();
            let runs = sessions
                .iter()
                .map(|(session, initial)| session.run(initial.clone()));
            let reports = futures::future::join_all(runs).await;

            let mut failed = 0;
            for report in reports {
                let report = report?;
                println!("Session {}: {:?}", report.session_id, report.status);
                for record in report.audit.records() {
                    println!(
                        "  {} attempt {}: {}{}",
                        record.node_name,
                        record.attempt_number,
                        record.status,
                        record
                            .error_detail
                            .as_deref()
                            .map(|d| format!(" ({})", d))
                            .unwrap_or_default()
                    );
                }
                println!("{}", serde_json::to_string_pretty(&report.checkpoint)?);
                if let Some(e) = &report.error {
                    log::error!("Session {} did not complete: {}", report.session_id, e);
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{} session(s) did not complete", failed);
            }
        }
    }

    Ok(())
}
