//! og compiler driver
//!
//! Reads a syntax tree in JSON form, checks it and writes the postfix
//! listing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use ogc::frontend::ast::Ast;
use ogc::{CodegenConfig, Compilation};

/// og compiler core
#[derive(Parser, Debug)]
#[command(name = "ogc")]
#[command(version = "0.1.0")]
#[command(about = "og compiler - type checking, frame layout and postfix code generation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input syntax tree (.json)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output file (stdout when omitted)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Name of the program entry function
    #[arg(long, default_value = "og")]
    entry: String,

    /// Print every function's frame layout as JSON
    #[arg(long)]
    emit_frames: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a syntax tree for errors
    Check {
        /// Input syntax tree
        input: PathBuf,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Some(Commands::Check { input }) => check_file(input),
        None => match &cli.input {
            Some(input) => compile_file(input, &cli),
            None => {
                eprintln!("Error: No input file specified");
                eprintln!("Usage: ogc <FILE> or ogc check <FILE>");
                process::exit(1);
            }
        },
    };

    if let Err(e) = result {
        match e.downcast_ref::<ogc::Error>() {
            Some(err) if err.is_internal() => {
                eprintln!("{}", err);
                process::abort();
            }
            Some(err) => eprintln!("{}", err.diagnostic()),
            None => eprintln!("Error: {:#}", e),
        }
        process::exit(1);
    }
}

fn load(input: &Path) -> Result<Ast> {
    let text = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    Ok(Ast::from_json(&text)?)
}

/// Compile a syntax tree into a postfix listing
fn compile_file(input: &Path, cli: &Cli) -> Result<()> {
    let ast = load(input)?;
    let config = CodegenConfig {
        entry_point: cli.entry.clone(),
        ..CodegenConfig::default()
    };
    let Compilation { listing, frames } = ogc::compile(&ast, &config)?;

    match &cli.output {
        Some(path) => {
            fs::write(path, listing.render()).with_context(|| format!("writing {}", path.display()))?
        }
        None => print!("{}", listing.render()),
    }

    if cli.emit_frames {
        let dump = serde_json::to_string_pretty(&frames).context("serializing frame layouts")?;
        // keep stdout a clean listing when it carries one
        if cli.output.is_some() {
            println!("{}", dump);
        } else {
            eprintln!("{}", dump);
        }
    }
    Ok(())
}

/// Check a syntax tree for errors without generating code
fn check_file(input: &Path) -> Result<()> {
    let ast = load(input)?;
    ogc::check(&ast)?;
    println!("No errors found");
    Ok(())
}
