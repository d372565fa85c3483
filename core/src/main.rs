// objc-lift - Objective-C metadata dump
//
// Loads a Mach-O binary, recovers its Objective-C metadata and reports what a
// host would be told about it.
//
// Usage:
//   objc-lift App.app/App
//   objc-lift --arch x86_64 -vv --annotations libFoo.dylib

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use objc_lift::annotate::RecordingSink;
use objc_lift::{BinaryImage, MachOImage, Registry, SessionId};

#[derive(Parser, Debug)]
#[command(name = "objc-lift")]
#[command(about = "Objective-C metadata recovery for Mach-O binaries")]
#[command(version)]
struct Args {
    /// Input Mach-O binary (thin or fat)
    binary: PathBuf,

    /// Slice to load from a fat binary (aarch64, x86_64, armv7, x86)
    #[arg(long)]
    arch: Option<String>,

    /// Verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print every annotation applied to the binary
    #[arg(long)]
    annotations: bool,
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn describe(image: &dyn BinaryImage, address: u64) -> String {
    match image.symbol_name_at(address) {
        Some(name) => format!("{:#x} {}", address, name),
        None => format!("{:#x}", address),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    // Load Mach-O binary
    let data = std::fs::read(&args.binary)
        .with_context(|| format!("Failed to read {}", args.binary.display()))?;
    let image = MachOImage::parse(&data, args.arch.as_deref()).context("Failed to parse Mach-O")?;
    println!("{}: {}", args.binary.display(), image.architecture());

    // Recover metadata
    let registry = Registry::new();
    let session = SessionId(0);
    let mut sink = RecordingSink::new();
    let info = if args.annotations {
        registry.annotated_analysis_info(session, &image, &mut sink)
    } else {
        registry.analysis_info(session, &image)
    };
    print!("{}", info.dump());

    // Dispatch entry points
    let resolver = registry.resolver(session, &image);
    println!("Dispatch ({:?}):", resolver.readiness());
    for address in resolver.message_send_functions() {
        println!("  msgSend  {}", describe(&image, address));
    }
    for address in resolver.arc_functions() {
        println!("  ARC      {}", describe(&image, address));
    }
    if !image.architecture().supports_rewriting() {
        println!("  call sites on {} are not rewritten", image.architecture());
    }

    if args.annotations {
        println!("Annotations:");
        for annotation in &sink.annotations {
            println!("  {}", annotation);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["objc-lift", "-vv", "--annotations", "App"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.annotations);
        assert_eq!(args.binary, PathBuf::from("App"));

        // no rewriting flags on the dump tool
        assert!(Args::try_parse_from(["objc-lift", "--no-arc-cleanup", "App"]).is_err());
    }
}
