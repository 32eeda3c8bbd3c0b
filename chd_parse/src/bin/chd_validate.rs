use chd_parse::ChdFile;
use std::env;
use std::fs::File;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <file.chd>", args[0]);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    match ChdFile::parse(file) {
        Ok(chd) => {
            println!("Valid CHD file: {}", path);
            println!("  Format version: {}", chd.version);
            println!("  Load classes: {}", chd.load_classes.len());
            println!("  Class shapes: {}", chd.classes.len());
            println!("  Roots: {}", chd.roots.len());
            println!("  Instances: {}", chd.instances.len());
            println!("  Object arrays: {}", chd.object_arrays.len());
            println!("  Primitive arrays: {}", chd.primitive_arrays.len());
            println!("  References: {}", chd.reference_count());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid CHD file '{}': {}", path, e);
            ExitCode::FAILURE
        }
    }
}
