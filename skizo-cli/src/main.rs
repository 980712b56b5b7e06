use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skizo_compiler::{compile_units, CompileOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skizo")]
#[command(version = "0.2.0")]
#[command(about = "Skizo language toolchain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and type-check a Skizo source file
    Check {
        /// Input .skizo file
        #[arg(value_name = "INPUT")]
        input: PathBuf,
    },

    /// Compile a Skizo source file to a C translation unit
    Build {
        /// Input .skizo file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output C file (stdout when omitted)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Enable stack traces
        #[arg(long)]
        stack_traces: bool,

        /// Enable method profiling
        #[arg(long)]
        profiling: bool,

        /// Disable explicit null checks
        #[arg(long)]
        no_null_checks: bool,
    },

    /// Dump the parsed AST as JSON
    Ast {
        /// Input .skizo file
        #[arg(value_name = "INPUT")]
        input: PathBuf,
    },
}

fn parse_file(input: &PathBuf) -> Result<skizo_ast::Unit> {
    let source = std::fs::read_to_string(input)
        .with_context(|| format!("cannot read {}", input.display()))?;
    let module = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "main".to_string());
    let unit = skizo_parser::Parser::new(&module, &source)?
        .parse_unit()
        .with_context(|| format!("parse failed for {}", input.display()))?;
    Ok(unit)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { input } => {
            let unit = parse_file(&input)?;
            compile_units(&[unit], &CompileOptions::default())?;
            println!("ok");
        }
        Commands::Build {
            input,
            output,
            stack_traces,
            profiling,
            no_null_checks,
        } => {
            let unit = parse_file(&input)?;
            let options = CompileOptions {
                stack_trace_enabled: stack_traces,
                profiling_enabled: profiling,
                explicit_null_check: !no_null_checks,
                ..CompileOptions::default()
            };
            let compilation = compile_units(&[unit], &options)?;
            log::info!(
                "{} classes, {} string literal(s)",
                compilation.metadata.class_count(),
                compilation.string_literals.len()
            );
            match output {
                Some(path) => std::fs::write(&path, compilation.c_source)
                    .with_context(|| format!("cannot write {}", path.display()))?,
                None => print!("{}", compilation.c_source),
            }
        }
        Commands::Ast { input } => {
            let unit = parse_file(&input)?;
            println!("{}", serde_json::to_string_pretty(&unit)?);
        }
    }
    Ok(())
}
