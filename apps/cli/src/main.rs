use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use tessera::services::bundle::{BundlePlan, BundleProcessor, BundleRequestOptions, PreferReturn};
use tessera::{logging, AppState, Config};
use tessera_models::OperationOutcome;

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Process FHIR batch and transaction bundles against an in-memory store",
    version,
    arg_required_else_help = true
)]
struct Cli {
    /// Log level for diagnostics on stderr (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a bundle and print the response bundle.
    Process {
        /// Path to a Bundle JSON file (or "-" for stdin).
        bundle: PathBuf,
        /// Bundles processed first to populate the store. Repeatable.
        #[arg(long)]
        seed: Vec<PathBuf>,
        /// Return preference: minimal, representation or operationoutcome.
        #[arg(long, default_value = "representation")]
        prefer: String,
        /// Service base used for response fullUrls.
        #[arg(long)]
        base_url: Option<String>,
        /// Disable payload offloading for created resources.
        #[arg(long, action = ArgAction::SetTrue)]
        no_offload: bool,
        /// Output file path (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Pretty-print JSON output.
        #[arg(short, long, action = ArgAction::SetTrue)]
        pretty: bool,
    },

    /// Show the order in which a bundle's entries would be processed.
    Plan {
        /// Path to a Bundle JSON file (or "-" for stdin).
        bundle: PathBuf,
        /// Pretty-print JSON output.
        #[arg(short, long, action = ArgAction::SetTrue)]
        pretty: bool,
    },

    /// Print the CLI version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_simple_logging(&cli.log_level);

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Plan { bundle, pretty } => {
            let json = read_json(&bundle)?;
            let plan = BundlePlan::from_value(&json).context("Failed to plan bundle")?;
            write_output(&serde_json::to_value(plan)?, None, pretty)?;
        }
        Commands::Process {
            bundle,
            seed,
            prefer,
            base_url,
            no_offload,
            output,
            pretty,
        } => {
            let prefer_return = PreferReturn::parse(&prefer).with_context(|| {
                format!(
                    "Unknown --prefer '{}'; expected minimal, representation or operationoutcome",
                    prefer
                )
            })?;

            let mut config = Config::default();
            config.bundle.payload.offload_enabled = !no_offload;
            let state = AppState::new(config);
            let options = BundleRequestOptions {
                prefer_return,
                base_url,
            };

            for path in &seed {
                let json = read_json(path)?;
                BundleProcessor::from_state(&state)
                    .process(json, &BundleRequestOptions::default())
                    .await
                    .with_context(|| format!("Seed bundle '{}' failed", path.display()))?;
                tracing::info!(seed = %path.display(), "Seed bundle applied");
            }

            let json = read_json(&bundle)?;
            match BundleProcessor::from_state(&state).process(json, &options).await {
                Ok(response) => write_output(&response, output.as_deref(), pretty)?,
                Err(err) => {
                    let outcome = OperationOutcome::new(err.issues()).to_value()?;
                    write_output(&outcome, output.as_deref(), pretty)?;
                    anyhow::bail!("Bundle rejected ({}): {}", err.status(), err);
                }
            }
        }
    }

    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    if path.to_string_lossy() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read JSON bundle from stdin")?;
        return serde_json::from_str(&buf).context("stdin bundle is not valid JSON");
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bundle file '{}'", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Bundle file is not valid JSON: {}", path.display()))
}

fn write_output(value: &Value, output: Option<&Path>, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };

    match output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("Failed to write output file '{}'", path.display())),
        None => {
            println!("{}", rendered);
            Ok(())
        }
    }
}
