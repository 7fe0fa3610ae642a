use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use fang_core::compiler::{CompileOptions, SourceFile, compile_module};
use fang_core::logger;

/// Ahead-of-time compiler for the fang language targeting ARM64
/// Mach-O assembly.
#[derive(Parser, Debug)]
#[command(name = "fangc", version, about)]
struct Args {
    /// Source file of the root module.
    input: PathBuf,

    /// Output assembly path.
    output: Option<PathBuf>,

    /// Additional source files, compiled as modules named after their
    /// file stems.
    #[arg(long = "module", value_name = "FILE")]
    modules: Vec<PathBuf>,

    /// Target platform key.
    #[arg(long, default_value = "apple_arm64")]
    platform: String,

    /// Log the type and symbol table reports after resolution.
    #[arg(long)]
    report: bool,

    /// Print how long the compilation took.
    #[arg(long)]
    time: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.report {
        logger::init_logger_debug();
    } else {
        logger::init_logger();
    }
    let started = Instant::now();

    let mut sources = Vec::new();
    for path in std::iter::once(&args.input).chain(args.modules.iter()) {
        match fs::read_to_string(path) {
            Ok(source) => sources.push(SourceFile::new(
                path.display().to_string(),
                source,
            )),
            Err(error) => {
                eprintln!("Could not read '{}': {error}", path.display());
                println!("Fail");
                return ExitCode::from(1);
            }
        }
    }

    let options = CompileOptions {
        platform: args.platform,
        report: args.report,
    };
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from("file.S"));

    let compiled = match compile_module(sources, options) {
        Ok(compiled) => compiled,
        Err(error) => {
            eprintln!("{error}");
            println!("Fail");
            return ExitCode::from(1);
        }
    };

    if let Err(error) = fs::write(&output, &compiled.assembly) {
        eprintln!("Could not write '{}': {error}", output.display());
        // Never leave a partial file behind.
        let _ = fs::remove_file(&output);
        println!("Fail");
        return ExitCode::from(1);
    }

    if args.time {
        println!(
            "Completed in {:.3} milliseconds.",
            started.elapsed().as_secs_f64() * 1000.0
        );
    }
    println!("OK");
    ExitCode::SUCCESS
}
