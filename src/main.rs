//! Pipewright CLI Entry Point
//!
//! Provides the command-line interface for executing manifests.
//!
//! # Usage
//!
//! ```bash
//! # Execute a manifest
//! pipewright pipeline.yaml
//!
//! # Pass the workspace identifier the environment builder receives
//! pipewright pipeline.yaml --workspace build
//!
//! # Debug logging
//! pipewright pipeline.yaml --verbose
//! ```
//!
//! The process exits non-zero when any pipeline in the result sequence
//! failed.

use std::env;
use std::process::ExitCode;

use log::{error, info};

use pipewright::execution::Engine;
use pipewright::tools::Registry;
use pipewright::{APP_NAME, VERSION};

/// Workspace identifier used when none is specified.
const DEFAULT_WORKSPACE: &str = "default";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    manifest_path: Option<String>,
    workspace: String,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_path: None,
            workspace: DEFAULT_WORKSPACE.to_string(),
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Declarative Pipeline Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: pipewright [OPTIONS] <MANIFEST_FILE>");
    println!();
    println!("Arguments:");
    println!("  <MANIFEST_FILE>    Path to the manifest YAML file");
    println!();
    println!("Options:");
    println!("  --workspace ID     Workspace identifier passed to environment builders");
    println!("                     (default: {})", DEFAULT_WORKSPACE);
    println!("  --verbose          Enable debug logging");
    println!("  --help             Show this help message");
    println!("  --version          Show version information");
    println!();
    println!("Examples:");
    println!("  pipewright pipeline.yaml");
    println!("  pipewright pipeline.yaml --workspace build");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--workspace" => {
                i += 1;
                if i >= args.len() {
                    return Err("--workspace requires an identifier argument".to_string());
                }
                config.workspace = args[i].clone();
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.manifest_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.manifest_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Main application entry point.
async fn run() -> Result<Vec<bool>, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let manifest_path = config.manifest_path.ok_or_else(|| {
        print_usage();
        "No manifest file specified".to_string()
    })?;

    info!("Manifest: {}", manifest_path);
    info!("Workspace: {}", config.workspace);

    // Execute the manifest
    let engine = Engine::new(Registry::with_builtins());
    let results = engine
        .execute(&config.workspace, &manifest_path)
        .await
        .map_err(|e| {
            error!("Failed to execute manifest: {}", e);
            e
        })?;

    // Print summary
    println!();
    println!(
        "{}/{} pipelines succeeded",
        results.iter().filter(|ok| **ok).count(),
        results.len()
    );

    Ok(results)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(results) if results.iter().all(|ok| *ok) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
