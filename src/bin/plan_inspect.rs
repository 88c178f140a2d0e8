//! Binary entry point for the plan inspection CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use docplan::algebra::Statement;
use docplan::catalog::{CatalogDescription, InMemoryCatalog};
use docplan::config::PlannerConfig;
use docplan::error::PlanErrorWithCode;
use docplan::expr::parse_select;
use docplan::plan::{Operator, Prepared};
use docplan::Builder;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "plan-inspect",
    version,
    about = "Explain, verify, encode and decode query plans",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "TOML",
        help = "Planner configuration file ([planner] table)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the operator tree of an encoded plan or prepared envelope.
    Explain {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, help = "Hide string literals")]
        redact: bool,
    },
    /// Re-resolve a plan against a catalog description.
    Verify {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "TOML", help = "Catalog description")]
        catalog: PathBuf,
    },
    /// Print the portable encoded-plan string of a plan.
    Encode {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Unpack an encoded-plan string into its JSON envelope.
    Decode {
        #[arg(value_name = "ENCODED_FILE")]
        file: PathBuf,
    },
    /// Build a prepared envelope from SELECT text.
    Plan {
        #[arg(value_name = "QUERY_FILE")]
        file: PathBuf,
        #[arg(long, value_name = "TOML", help = "Catalog description")]
        catalog: PathBuf,
        #[arg(long, default_value = "", help = "Prepared name")]
        name: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            match err.downcast_ref::<docplan::PlanError>() {
                Some(plan_err) => eprintln!("error: {}", PlanErrorWithCode(plan_err)),
                None => eprintln!("error: {err}"),
            }
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when a verification ran and failed.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PlannerConfig::load(path)?,
        None => PlannerConfig::default(),
    };
    debug!(?config, "plan_inspect.config");

    match cli.command {
        Command::Explain { file, redact } => {
            let prepared = load_prepared(&file)?;
            match cli.format {
                OutputFormat::Text => print!("{}", prepared.operator.explain().render(redact)),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&prepared.encode_for_explain())?)
                }
            }
        }
        Command::Verify { file, catalog } => {
            let mut prepared = load_prepared(&file)?;
            let catalog = load_catalog(&catalog)?;
            let ok = prepared.verify(&catalog);
            match cli.format {
                OutputFormat::Text => println!("{}", if ok { "ok" } else { "stale" }),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "verified": ok, "keyspaces": prepared.keyspaces() })
                ),
            }
            return Ok(ok);
        }
        Command::Encode { file } => {
            let mut prepared = load_prepared(&file)?;
            println!("{}", prepared.compute_encoded_plan()?);
        }
        Command::Decode { file } => {
            let encoded = fs::read_to_string(&file)?;
            let prepared = Prepared::decode_encoded(&encoded)?;
            println!("{}", serde_json::to_string_pretty(&prepared.encode())?);
        }
        Command::Plan {
            file,
            catalog,
            name,
        } => {
            let text = fs::read_to_string(&file)?;
            let select = parse_select(text.trim())?;
            let builder = Builder::new(config, Arc::new(load_catalog(&catalog)?));
            let prepared = builder
                .prepare(&Statement::Select(select), text.trim())?
                .with_name(name);
            match cli.format {
                OutputFormat::Text => print!("{}", prepared.operator.explain().render(false)),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&prepared.encode())?)
                }
            }
        }
    }
    Ok(true)
}

/// Accepts either a prepared envelope or a bare encoded operator.
fn load_prepared(path: &Path) -> Result<Prepared, Box<dyn Error>> {
    let body: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let prepared = if body.get("operator").is_some() {
        Prepared::decode(&body)?
    } else {
        Prepared::new(Operator::decode(&body)?, Value::Null)
    };
    Ok(prepared)
}

fn load_catalog(path: &Path) -> Result<InMemoryCatalog, Box<dyn Error>> {
    let description = CatalogDescription::from_toml_str(&fs::read_to_string(path)?)?;
    Ok(InMemoryCatalog::from_description(&description)?)
}
