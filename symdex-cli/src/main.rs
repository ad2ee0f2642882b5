//! Symdex CLI - index Python trees and jump to symbol definitions

use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use symdex_client::{
    index_database, index_file, module_completions, IndexSummary, WorkerCommand, WorkerProxy,
};
use symdex_core::config::expand_vars;
use symdex_core::{Config, SymdexError};
use tracing_subscriber::EnvFilter;

const WORKER_NAME: &str = "symdex-worker";

#[derive(Parser)]
#[command(name = "symdex")]
#[command(about = "Incremental Python symbol index", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(long, global = true, env = "SYMDEX_CONFIG", default_value = "symdex.toml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Worker binary (overrides the config)
    #[arg(long, global = true, env = "SYMDEX_WORKER")]
    worker: Option<PathBuf>,

    /// Debug logging, including the worker's
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default symdex.toml
    Init,

    /// Sweep every configured database
    Index {
        /// Delete each store and re-extract everything
        #[arg(long)]
        rebuild: bool,
    },

    /// Update one file in the databases that cover it
    File {
        path: PathBuf,
    },

    /// Find definitions of SYMBOL or NAMESPACE.SYMBOL
    Find {
        symbol: String,
    },

    /// Module-level names defined by PACKAGE
    Members {
        package: String,
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Complete the next segment of a dotted module path
    Packages {
        #[arg(default_value = "")]
        prefix: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Commands::Init => cmd_init(&cli.config),
        Commands::Index { rebuild } => cmd_index(&cli, *rebuild),
        Commands::File { path } => cmd_file(&cli, path),
        Commands::Find { symbol } => cmd_find(&cli, symbol),
        Commands::Members { package, prefix } => cmd_members(&cli, package, prefix),
        Commands::Packages { prefix } => cmd_packages(&cli, prefix),
    };

    if let Err(e) = result {
        if cli.json {
            let error_json = serde_json::json!({ "code": e.kind(), "message": e.to_string() });
            eprintln!("{}", error_json);
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("SYMDEX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> symdex_core::Result<Config> {
    Config::load(&cli.config).map_err(|e| match e {
        SymdexError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => SymdexError::ConfigParse(
            format!("{} not found (run `symdex init`)", cli.config.display()),
        ),
        other => other,
    })
}

/// Worker binary: --worker, then the config, then next to this executable, then PATH
fn worker_program(cli: &Cli, config: &Config) -> PathBuf {
    if let Some(program) = &cli.worker {
        return program.clone();
    }
    if let Some(program) = &config.worker.program {
        return PathBuf::from(expand_vars(program));
    }
    let sibling = std::env::current_exe().ok().and_then(|exe| {
        let candidate = exe
            .parent()?
            .join(format!("{}{}", WORKER_NAME, std::env::consts::EXE_SUFFIX));
        candidate.is_file().then_some(candidate)
    });
    sibling.unwrap_or_else(|| PathBuf::from(WORKER_NAME))
}

fn make_proxy(cli: &Cli, config: &Config) -> WorkerProxy {
    let program = worker_program(cli, config);
    tracing::debug!(program = %program.display(), "using worker");
    let mut command = WorkerCommand::new(program);
    if cli.verbose {
        command = command.env("SYMDEX_LOG", "debug");
    }
    WorkerProxy::with_command(command)
}

fn print_json<T: Serialize>(value: &T) -> symdex_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(path: &Path) -> symdex_core::Result<()> {
    use colored::Colorize;

    Config::init(path)?;
    println!("{} {}", "Created".green(), path.display());
    Ok(())
}

fn cmd_index(cli: &Cli, rebuild: bool) -> symdex_core::Result<()> {
    use colored::Colorize;

    let config = load_config(cli)?;
    let databases = config.ordered_databases();
    // One worker per database; a connection failure in one stops the others cleanly
    let cancel = AtomicBool::new(false);

    let results: Vec<symdex_core::Result<IndexSummary>> = databases
        .par_iter()
        .map(|database| {
            let mut proxy = make_proxy(cli, &config);
            let result = index_database(&mut proxy, &config, database, rebuild, &cancel);
            if matches!(&result, Err(e) if e.is_connection_fatal()) {
                cancel.store(true, Ordering::Relaxed);
            }
            result
        })
        .collect();

    let mut summaries = Vec::new();
    let mut first_error = None;
    for (database, result) in databases.iter().zip(results) {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                if !cli.json {
                    eprintln!("{} {}: {}", "Failed".red(), database.store_path().display(), e);
                }
                first_error.get_or_insert(e);
            }
        }
    }

    if cli.json {
        print_json(&summaries)?;
    } else {
        for summary in &summaries {
            println!("{}", summary.database.display().to_string().bold());
            println!(
                "  {}: {}  {}: {}  {}: {}  {}: {}",
                "Indexed".green(),
                summary.indexed,
                "Unchanged".blue(),
                summary.unchanged,
                "Failed".yellow(),
                summary.failed,
                "Removed".blue(),
                summary.removed
            );
            if summary.skipped {
                println!("  {}", "no roots, sweep skipped".dimmed());
            }
            if summary.cancelled {
                println!("  {}", "cancelled".yellow());
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn cmd_file(cli: &Cli, path: &Path) -> symdex_core::Result<()> {
    use colored::Colorize;

    let config = load_config(cli)?;
    let mut proxy = make_proxy(cli, &config);
    let updated = index_file(&mut proxy, &config, path)?;

    if cli.json {
        print_json(&updated)?;
    } else if updated.is_empty() {
        println!("{} no database covers {}", "Skipped".yellow(), path.display());
    } else {
        for store in &updated {
            println!("{} {}", "Updated".green(), store.display());
        }
    }
    Ok(())
}

fn cmd_find(cli: &Cli, symbol: &str) -> symdex_core::Result<()> {
    use colored::Colorize;

    let config = load_config(cli)?;
    let mut proxy = make_proxy(cli, &config);
    proxy.set_databases(&config.database_paths())?;
    let occurrences = proxy.query_occurrences(symbol)?;

    if cli.json {
        return print_json(&occurrences);
    }
    for occurrence in &occurrences {
        println!(
            "{} {}",
            occurrence.location(),
            occurrence.qualified_name().cyan()
        );
    }
    if occurrences.is_empty() {
        eprintln!("{}", format!("no definitions of {}", symbol).dimmed());
    }
    Ok(())
}

fn cmd_members(cli: &Cli, package: &str, prefix: &str) -> symdex_core::Result<()> {
    let config = load_config(cli)?;
    let mut proxy = make_proxy(cli, &config);
    proxy.set_databases(&config.database_paths())?;
    let members = proxy.query_members(package, prefix)?;
    print_names(cli, &members)
}

fn cmd_packages(cli: &Cli, prefix: &str) -> symdex_core::Result<()> {
    let config = load_config(cli)?;
    let mut proxy = make_proxy(cli, &config);
    proxy.set_databases(&config.database_paths())?;
    let segments = module_completions(&mut proxy, prefix)?;
    print_names(cli, &segments)
}

fn print_names(cli: &Cli, names: &[String]) -> symdex_core::Result<()> {
    if cli.json {
        return print_json(&names);
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
