//! Assembly to image compiler CLI.
//!
//! Reads Ngaro assembly source and writes the binary memory image.
//!
//! # Usage
//! ```text
//! ngasm <input.rx> [-o FILE] [--bits 32|64]
//! ```
//!
//! Without `-o`, the output lands next to the input with an `.img`
//! extension. `--bits` selects the on-disk cell width; the default is the
//! compiled cell width.

use std::env;
use std::fs;
use std::path::Path;
use std::process;

use ngaro::{assemble, Image};

fn print_usage(program: &str) {
    eprintln!("Usage: {} <input.rx> [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o FILE       Output image path (default: <input>.img)");
    eprintln!("  --bits N      On-disk cell width, 32 or 64 (default: native)");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut bits: usize = 0;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("-o" | "--output") => {
                i += 1;
                if i >= args.len() {
                    eprintln!("{} requires an argument", k);
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
            }
            "--bits" => {
                i += 1;
                let v = args.get(i).and_then(|s| s.parse::<usize>().ok());
                match v {
                    Some(32) | Some(64) => bits = v.unwrap_or(0),
                    _ => {
                        eprintln!("--bits: expected 32 or 64");
                        process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
        i += 1;
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or_else(|| Path::new("."));
        parent
            .join(format!("{}.img", stem))
            .to_string_lossy()
            .into_owned()
    });

    let source = match fs::read_to_string(input_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", input_path, e);
            process::exit(1);
        }
    };

    let cells = match assemble(input_path, &source) {
        Ok(cells) => cells,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let count = cells.len();
    if let Err(e) = Image::new(cells).save(output_path.as_ref(), bits, false) {
        eprintln!("{}", e);
        process::exit(1);
    }
    println!("{}: {} cells", output_path, count);
}
