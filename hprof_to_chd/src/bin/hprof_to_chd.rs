//! Convert an HPROF heap dump to the compact CHD format.
//!
//! The conversion is lossy: string bodies become hashes, primitive
//! instance field values are dropped, and thread/stack-trace serial
//! numbers are not carried over. The reference graph, class shapes and
//! GC roots survive.
//!
//! # Usage
//!
//! ```bash
//! hprof_to_chd dump.hprof dump.chd
//! hprof_to_chd            # reads in.hprof, writes out.chd
//! ```

use clap::Parser;
use hprof_to_chd::crunch;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "hprof_to_chd")]
#[command(about = "Convert an HPROF heap dump to the compact CHD format")]
#[command(version)]
struct Args {
    /// Input heap dump
    #[arg(default_value = "in.hprof")]
    input: PathBuf,

    /// Output CHD file
    #[arg(default_value = "out.chd")]
    output: PathBuf,
}

fn run(args: &Args) -> hprof_to_chd::Result<()> {
    eprintln!(
        "Crunching {} -> {}",
        args.input.display(),
        args.output.display()
    );
    let stats = crunch::crunch(&args.input, &args.output)?;
    eprintln!(
        "  {} load classes, {} class shapes",
        stats.load_classes, stats.class_shapes
    );
    eprintln!(
        "  {} roots, {} instances, {} object arrays, {} primitive arrays",
        stats.roots, stats.instances, stats.object_arrays, stats.primitive_arrays
    );
    eprintln!("  {} references kept", stats.references);
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
