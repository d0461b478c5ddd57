//! The `retro` binary: load an Ngaro memory image and run it against
//! standard input and output.
//!
//! Raw-terminal toggling and VT100 emulation are the terminal's business;
//! `-raw` only tells the VM to treat its streams as a terminal (Ctrl-D
//! ends input, backspaces erase).

use std::env;
use std::fs::File;
use std::io;
use std::process;

use ngaro::{Image, Instance, VmConfig, VmError};

struct Flags {
    image: String,
    out: Option<String>,
    with: Vec<String>,
    shrink: bool,
    size: usize,
    raw: bool,
    debug: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            image: "retroImage".to_string(),
            out: None,
            with: Vec::new(),
            shrink: true,
            size: 100_000,
            raw: true,
            debug: false,
        }
    }
}

fn usage(program: &str) {
    eprintln!("Usage: {} [options]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -image FILE   Load image from FILE (default: retroImage)");
    eprintln!("  -o FILE       Save image to FILE (default: the -image path)");
    eprintln!("  -with FILE    Add FILE to the input stack (repeatable)");
    eprintln!("  -shrink BOOL  When saving, don't save unused cells (default: true)");
    eprintln!("  -size INT     Minimum image size in cells (default: 100000)");
    eprintln!("  -raw BOOL     Treat the console as a raw terminal (default: true)");
    eprintln!("  -debug BOOL   Dump PC and stacks on error (default: false)");
}

fn parse_bool(flag: &str, v: &str) -> Result<bool, String> {
    match v {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("{}: expected true or false, got {}", flag, other)),
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("{} requires an argument", flag))
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-image" => flags.image = next_value(args, &mut i, flag)?.to_string(),
            "-o" => flags.out = Some(next_value(args, &mut i, flag)?.to_string()),
            "-with" => flags.with.push(next_value(args, &mut i, flag)?.to_string()),
            "-shrink" => flags.shrink = parse_bool(flag, next_value(args, &mut i, flag)?)?,
            "-size" => {
                flags.size = next_value(args, &mut i, flag)?
                    .parse()
                    .map_err(|_| "-size: expected an integer".to_string())?
            }
            "-raw" => flags.raw = parse_bool(flag, next_value(args, &mut i, flag)?)?,
            "-debug" => flags.debug = parse_bool(flag, next_value(args, &mut i, flag)?)?,
            other => return Err(format!("unknown flag {}", other)),
        }
        i += 1;
    }
    Ok(flags)
}

fn dump_state(i: &Instance) {
    let pc = i.pc();
    if pc >= 0 && (pc as usize) < i.image.len() {
        eprintln!(
            "PC: {} ({}), Stack: {:?}, Addr: {:?}",
            pc,
            i.image[pc as usize],
            i.data(),
            i.address()
        );
    } else {
        eprintln!("PC: {}, Stack: {:?}, Addr: {:?}", pc, i.data(), i.address());
    }
}

fn run(flags: &Flags) -> Result<(), String> {
    let (image, _cells) = Image::load(flags.image.as_ref(), flags.size, 0)
        .map_err(|e| e.to_string())?;
    let out = flags.out.clone().unwrap_or_else(|| flags.image.clone());

    let config = VmConfig {
        shrink: flags.shrink,
        tty: flags.raw,
        ..VmConfig::default()
    };
    let mut i = Instance::new(image, &out, config);
    i.set_output(io::stdout());
    i.push_input(io::stdin());
    for path in &flags.with {
        let f = File::open(path).map_err(|e| format!("{}: {}", path, e))?;
        i.push_input(f);
    }

    match i.run() {
        Ok(_) => Ok(()),
        Err(VmError::EndOfInput) => Ok(()),
        Err(e) => {
            if flags.debug {
                eprintln!();
                dump_state(&i);
            }
            Err(e.to_string())
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage(&args[0]);
        return;
    }
    let flags = match parse_flags(&args[1..]) {
        Ok(f) => f,
        Err(msg) => {
            eprintln!("{}", msg);
            usage(&args[0]);
            process::exit(1);
        }
    };
    if let Err(msg) = run(&flags) {
        eprintln!("{}", msg);
        process::exit(1);
    }
}
