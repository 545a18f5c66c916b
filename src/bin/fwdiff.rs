//! Forward-mode differentiation driver.
//!
//! Reads a textual IR module, differentiates one function and prints the
//! resulting module followed by any diagnostics.

use clap::Parser;
use fwdiff::core::{DiagnosticSink, TranscribeOptions};
use fwdiff::ir::parse_module;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fwdiff")]
#[command(about = "Emit the forward-mode derivative of a function in a textual IR module")]
#[command(version)]
struct Cli {
    /// Input IR file (use '-' for stdin)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Label (without '%') or name hint of the function to differentiate
    #[arg(short, long)]
    func: String,

    /// Prefix for name hints of differential values
    #[arg(long, default_value = "s_diff_")]
    diff_prefix: String,

    /// Prefix for the name hint of the derivative function
    #[arg(long, default_value = "s_fwd_")]
    func_prefix: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn read_input(path: &PathBuf) -> io::Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        fs::read_to_string(path)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let source = read_input(&cli.input)?;
    let mut parsed = parse_module(&source)?;
    let label = cli.func.trim_start_matches('%');
    let Some(func) = parsed.get(label).or_else(|| parsed.module.find_named(label)) else {
        eprintln!("Error: no function named '{}'", cli.func);
        std::process::exit(2);
    };

    let options = TranscribeOptions {
        diff_name_prefix: cli.diff_prefix,
        func_name_prefix: cli.func_prefix,
    };
    let mut sink = DiagnosticSink::new();
    let result = fwdiff::differentiate(&mut parsed.module, func, &options, &mut sink);

    print!("{}", parsed.module);
    for diagnostic in sink.diagnostics() {
        eprintln!("{diagnostic}");
    }

    match result {
        Ok((_, Some(derivative))) => {
            log::info!("derivative of {func} is {derivative}");
            Ok(())
        }
        Ok((_, None)) => {
            eprintln!("note: {} is not differentiable; module left unchanged", cli.func);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
