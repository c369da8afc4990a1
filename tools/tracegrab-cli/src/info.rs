//! Info command - validate a trace and print what it contains

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use tracegrab_core::trace::tracer_version_string;
use tracegrab_core::{TraceReader, Verbosity};

/// Arguments for the info command
#[derive(Args)]
pub struct InfoArgs {
    /// Trace file to inspect
    pub trace: PathBuf,

    /// Print the full metadata document
    #[arg(long)]
    pub metadata: bool,
}

/// Execute the info command
pub fn execute(args: InfoArgs) -> Result<()> {
    crate::init_logging(Verbosity::Warnings);

    let mut reader = TraceReader::open(&args.trace)
        .with_context(|| format!("Failed to open trace: {}", args.trace.display()))?;
    let header = reader.header().clone();

    println!("Trace: {}", args.trace.display());
    println!("  File version:    {}", header.trace_file_version);
    println!("  Tracer version:  {}", tracer_version_string(header.tracer_version));
    println!("  Pointer size:    {} bit", header.ptr_size as u32 * 8);
    println!("  Endianness:      {}", header.endianness);
    println!("  Compression:     {:?}", header.compress_type);
    println!("  Flags:           {:?}", header.bit_flags);
    println!("  Size:            {} bytes", reader.len());
    println!("  Tracers:         {:?}", header.tracer_ids);
    for (i, gpu) in header.gpu_info.iter().enumerate() {
        println!(
            "  GPU {}:           vendor {:#x}, device {:#x}, driver {:#x}",
            i,
            gpu.vendor_id(),
            gpu.device_id(),
            gpu.gpu_drv_vers
        );
    }

    match reader.validate() {
        Ok(()) => println!("  Replayable:      yes"),
        Err(e) => println!("  Replayable:      no ({e})"),
    }

    match reader.read_metadata().context("Failed to read trace metadata")? {
        Some(metadata) => {
            let options = metadata.option_strings();
            println!();
            println!("Replay options from metadata: {}", options.len());
            for (name, value) in &options {
                println!("  {name} = {value}");
            }
            if args.metadata {
                println!();
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }
        }
        None => println!("No metadata"),
    }

    match reader.read_portability_table() {
        Ok(Some(table)) => println!("Portability table: {} packets", table.offsets.len()),
        Ok(None) => println!("No portability table"),
        Err(e) => println!("Portability table unreadable: {e}"),
    }

    Ok(())
}
