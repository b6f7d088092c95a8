use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use fsg_context::PackageRef;
use fsg_snapshot::config::{parse_cache_mode, resolve_package_ref};
use fsg_snapshot::{EngineConfig, Orchestrator};

#[derive(Parser)]
#[command(
    name = "fsg",
    about = "Command line interface for the FHIR snapshot derivation engine",
    version,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot-related commands.
    Snap {
        #[command(subcommand)]
        command: SnapCommands,
    },
}

#[derive(Subcommand)]
enum SnapCommands {
    /// Derive (or read cached) the snapshot for a profile identifier.
    Gen {
        /// Canonical URL, id, or name of the StructureDefinition to snapshot.
        identifier: String,
        /// Restrict resolution to a single package (format id#version or id@version).
        #[arg(long)]
        package: Option<String>,
        /// Packages making up the resolution context. Repeatable.
        #[arg(long = "context", value_name = "NAME#VERSION")]
        context: Vec<String>,
        /// Directory holding installed packages and the snapshot cache.
        #[arg(long = "cache-path", default_value = "./.fsg-cache")]
        cache_path: PathBuf,
        /// Cache mode: lazy, ensure, rebuild, or none.
        #[arg(long = "cache-mode", default_value = "lazy")]
        cache_mode: String,
        /// FHIR version (e.g. 4.0.1, R4, R4B, R5).
        #[arg(long = "fhir-version", default_value = "4.0.1")]
        fhir_version: String,
        /// Output file path (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Pretty-print JSON output.
        #[arg(short, long)]
        pretty: bool,
    },

    /// Pre-generate and cache snapshots for every profile in the context.
    Precache {
        /// Packages making up the resolution context. Repeatable.
        #[arg(long = "context", value_name = "NAME#VERSION")]
        context: Vec<String>,
        /// Directory holding installed packages and the snapshot cache.
        #[arg(long = "cache-path", default_value = "./.fsg-cache")]
        cache_path: PathBuf,
        /// Cache mode: ensure or rebuild (lazy/none do no pre-work).
        #[arg(long = "cache-mode", default_value = "ensure")]
        cache_mode: String,
        /// FHIR version (e.g. 4.0.1, R4, R4B, R5).
        #[arg(long = "fhir-version", default_value = "4.0.1")]
        fhir_version: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Snap {
            command:
                SnapCommands::Gen {
                    identifier,
                    package,
                    context,
                    cache_path,
                    cache_mode,
                    fhir_version,
                    output,
                    pretty,
                },
        } => {
            run_snap_gen(&identifier, package.as_deref(), &context, &cache_path, &cache_mode, &fhir_version, output.as_deref(), pretty).await?;
        }
        Commands::Snap {
            command:
                SnapCommands::Precache {
                    context,
                    cache_path,
                    cache_mode,
                    fhir_version,
                },
        } => {
            run_precache(&context, &cache_path, &cache_mode, &fhir_version).await?;
        }
    }

    Ok(())
}

async fn run_snap_gen(
    identifier: &str,
    package: Option<&str>,
    context: &[String],
    cache_path: &Path,
    cache_mode: &str,
    fhir_version: &str,
    output: Option<&Path>,
    pretty: bool,
) -> Result<()> {
    let cfg = build_config(context, cache_path, cache_mode, fhir_version)?;
    let orchestrator = Orchestrator::from_config(cfg)?;

    let package_filter = match package {
        Some(p) => {
            let reference = parse_package_ref(p)?;
            Some(resolve_package_ref(&reference, cache_path).with_context(|| format!("failed to resolve package '{p}'"))?)
        }
        None => None,
    };

    let snapshot = orchestrator
        .get_snapshot(identifier, package_filter.as_ref())
        .await
        .with_context(|| format!("failed to derive snapshot for '{identifier}'"))?;

    write_json_output(&snapshot, output, pretty)?;
    Ok(())
}

async fn run_precache(context: &[String], cache_path: &Path, cache_mode: &str, fhir_version: &str) -> Result<()> {
    let cfg = build_config(context, cache_path, cache_mode, fhir_version)?;
    let orchestrator = Orchestrator::from_config(cfg)?;
    let context_packages = orchestrator.context_packages().to_vec();

    let errors = orchestrator.precache(&context_packages).await;

    if errors.is_empty() {
        println!("precache complete for {} package(s)", context_packages.len());
    } else {
        eprintln!("precache finished with {} failure(s):", errors.len());
        for (file, err) in &errors {
            eprintln!("  {file}: {err}");
        }
    }
    Ok(())
}

/// Assembles the one `EngineConfig` every caller-facing command builds from
/// its raw flags (spec §6): `apps/cli` is the sole place config comes
/// together from the outside world.
fn build_config(context: &[String], cache_path: &Path, cache_mode: &str, fhir_version: &str) -> Result<EngineConfig> {
    let context_refs = context.iter().map(|s| parse_package_ref(s)).collect::<Result<Vec<PackageRef>>>()?;
    Ok(EngineConfig::new(context_refs, cache_path.to_path_buf())
        .with_fhir_version(fhir_version)
        .with_cache_mode(parse_cache_mode(cache_mode)?))
}

fn parse_package_ref(s: &str) -> Result<PackageRef> {
    s.parse().with_context(|| format!("invalid package reference '{s}'"))
}

fn write_json_output(value: &Value, output: Option<&Path>, pretty: bool) -> Result<()> {
    if let Some(output_path) = output {
        let content = if pretty { serde_json::to_string_pretty(value)? } else { serde_json::to_string(value)? };
        fs::write(output_path, content).with_context(|| format!("failed to write to {output_path:?}"))?;
        eprintln!("wrote output to {output_path:?}");
    } else if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
