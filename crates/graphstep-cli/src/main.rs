//! GraphStep command line interface.
//!
//! Pushes STEP assemblies into a graph database, pulls them back out, and
//! edits the stored tree in place.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use graphstep_core::sync::estimate::format_duration;
use graphstep_core::{Config, DbConfig, Position, ProductHierarchy, Quaternion, StepCodec, SyncEngine};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphstep")]
#[command(author, version, about = "Sync STEP assemblies with a graph database", long_about = None)]
struct Cli {
    /// Database connection as JSON: {"host", "database", "user": {"name", "password"}}
    #[arg(long, global = true, conflicts_with = "db_file")]
    db: Option<String>,

    /// Database connection file (.json, .yaml or .yml)
    #[arg(long, global = true)]
    db_file: Option<PathBuf>,

    /// Tunables file; defaults to ./graphstep.toml or the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format for hierarchies
    #[arg(long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Indented tree
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a STEP file, replacing the stored assembly
    Push {
        /// STEP file to upload
        file: PathBuf,
    },
    /// Write the stored assembly to a STEP file
    Pull {
        /// Output STEP file
        output: PathBuf,
    },
    /// Mount a part (or a whole file) below an assembly path
    AddPart {
        /// STEP file containing the part
        file: PathBuf,
        /// Target assembly path, e.g. "Root/Sub"
        #[arg(long, default_value = "")]
        assembly: String,
        /// Part name or path inside the file; the whole file when omitted
        #[arg(long, default_value = "")]
        part: String,
    },
    /// Set the translation of a stored node
    MovePart {
        /// Node path, e.g. "Root/Sub/Bolt"
        part: String,
        /// New position as "x,y,z"
        #[arg(allow_hyphen_values = true)]
        position: Position,
    },
    /// Rotate a stored node by a quaternion
    RotatePart {
        /// Node path, e.g. "Root/Sub/Bolt"
        part: String,
        /// Rotation as "x,y,z,w"
        #[arg(allow_hyphen_values = true)]
        quaternion: Quaternion,
    },
    /// Delete a stored node with everything below it
    DeletePart {
        /// Node path, e.g. "Root/Sub/Bolt"
        part: String,
    },
    /// Copy a stored node (and its subtree) below an assembly
    DuplicatePart {
        /// Node path to copy
        part: String,
        /// Target assembly path; next to the original when omitted
        #[arg(long, default_value = "")]
        assembly: String,
    },
    /// Print the stored product hierarchy
    Hierarchy,
    /// Delete everything in the database
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Estimate the upload time of a STEP file
    EstimateUpload {
        file: PathBuf,
    },
    /// Estimate the download time of the stored assembly
    EstimateDownload,
    /// Parse a STEP file offline and print its hierarchy
    Inspect {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match &cli.command {
        Commands::Inspect { file } => {
            let doc = StepCodec::parse_file(file).wrap_err_with(|| format!("Failed to parse {}", file.display()))?;
            print_hierarchy(&ProductHierarchy::from_document(&doc), cli.format)?;
            for warning in &doc.warnings {
                eprintln!("warning: {warning}");
            }
            return Ok(());
        }
        Commands::EstimateUpload { file } => {
            let engine = SyncEngine::neo4j(config);
            let seconds = engine.estimate_duration_upload(file).await?;
            println!("Estimated upload time: {}", format_duration(seconds));
            return Ok(());
        }
        _ => {}
    }

    let db = db_config(&cli)?;
    debug!(host = %db.host, database = %db.database, "Resolved database");
    let engine = SyncEngine::neo4j(config);

    match cli.command {
        Commands::Push { file } => {
            let written = spinner(format!("Pushing {}", file.display()), engine.push_file(&file, &db)).await?;
            println!("Pushed {} ({} records) to '{}'", file.display(), written, db.database);
        }
        Commands::Pull { output } => {
            let nodes = spinner(format!("Pulling '{}'", db.database), engine.pull_file(&output, &db)).await?;
            println!("Wrote {} ({} nodes)", output.display(), nodes);
        }
        Commands::AddPart { file, assembly, part } => {
            let written = spinner(
                format!("Adding {}", file.display()),
                engine.add_part(&file, &assembly, &part, &db),
            )
            .await?;
            println!("Added {} records", written);
        }
        Commands::MovePart { part, position } => {
            let placement = spinner(format!("Moving {part}"), engine.move_part(&part, position, &db)).await?;
            let t = placement.translation();
            println!("{part} now at ({}, {}, {})", t.x, t.y, t.z);
        }
        Commands::RotatePart { part, quaternion } => {
            let placement = spinner(format!("Rotating {part}"), engine.rotate_part(&part, quaternion, &db)).await?;
            let r = placement.rotation();
            println!("{part} rotation now ({}, {}, {}, {})", r.x, r.y, r.z, r.w);
        }
        Commands::DeletePart { part } => {
            let deleted = spinner(format!("Deleting {part}"), engine.delete_part(&part, &db)).await?;
            println!("Deleted {part} ({deleted} nodes)");
        }
        Commands::DuplicatePart { part, assembly } => {
            let key = spinner(format!("Duplicating {part}"), engine.duplicate_part(&part, &assembly, &db)).await?;
            println!("Duplicated {part} as {key}");
        }
        Commands::Hierarchy => {
            let hierarchy = spinner("Fetching hierarchy".to_string(), engine.get_product_hierarchy(&db)).await?;
            print_hierarchy(&hierarchy, cli.format)?;
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear '{}' without --yes", db.database);
            }
            let deleted = spinner(format!("Clearing '{}'", db.database), engine.clear_database(&db)).await?;
            println!("Deleted {} nodes from '{}'", deleted, db.database);
        }
        Commands::EstimateDownload => {
            let seconds = spinner("Counting records".to_string(), engine.estimate_duration_download(&db)).await?;
            println!("Estimated download time: {}", format_duration(seconds));
        }
        Commands::Inspect { .. } | Commands::EstimateUpload { .. } => {}
    }

    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { "graphstep=debug" } else { "graphstep=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Resolve `--db`, `--db-file` or `GRAPHSTEP_DB`, in that order.
fn db_config(cli: &Cli) -> Result<DbConfig> {
    if let Some(json) = &cli.db {
        return DbConfig::from_json(json).wrap_err("Invalid --db");
    }
    if let Some(path) = &cli.db_file {
        return DbConfig::from_file(path).wrap_err_with(|| format!("Invalid --db-file {}", path.display()));
    }
    match DbConfig::from_env() {
        Some(db) => db.wrap_err("Invalid GRAPHSTEP_DB"),
        None => Err(eyre!("No database given; pass --db, --db-file or set GRAPHSTEP_DB")),
    }
}

/// Run `operation` behind a terminal spinner.
async fn spinner<T, E>(message: String, operation: impl Future<Output = Result<T, E>>) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")?);
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    let result = operation.await;
    bar.finish_and_clear();
    Ok(result?)
}

fn print_hierarchy(hierarchy: &ProductHierarchy, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", hierarchy.render()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(hierarchy)?),
    }
    Ok(())
}
