//! `dg-view`: load a datagrind trace and report on it.
//!
//! The interactive plot lives in the GUI front-end; this binary covers
//! the loading pipeline (filtering, heap attribution, page compaction)
//! and exposes the nearest-access query for scripted use.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use datagrind::viewer::{load, LoadOptions, LoadSummary, NearestQuery, TraceData};

#[derive(Parser, Debug)]
#[command(
    name = "dg-view",
    version,
    about = "Inspect a datagrind memory-access trace"
)]
struct Args {
    /// Keep accesses only while one of these events is active
    /// (comma-separated labels).
    #[arg(long, value_name = "LIST")]
    events: Option<String>,

    /// Keep accesses only inside one of these tracked ranges
    /// (comma-separated labels).
    #[arg(long, value_name = "LIST")]
    ranges: Option<String>,

    /// Keep accesses only inside live heap blocks.
    #[arg(long)]
    malloc_only: bool,

    /// Print the load summary as JSON.
    #[arg(long)]
    json: bool,

    /// Nearest-access query: compact address, iseq, and the anisotropy
    /// ratio (pixels per byte over pixels per instruction).
    #[arg(long, value_name = "ADDR,ISEQ,RATIO")]
    query: Option<String>,

    /// Trace file written by the datagrind tool.
    trace_file: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let query = match args.query.as_deref().map(parse_query).transpose() {
        Ok(query) => query,
        Err(err) => {
            eprintln!("dg-view: {err}");
            return ExitCode::from(2);
        }
    };

    match run(&args, query) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dg-view: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args, query: Option<NearestQuery>) -> anyhow::Result<()> {
    let options = LoadOptions {
        events: split_comma(args.events.as_deref().unwrap_or("")),
        ranges: split_comma(args.ranges.as_deref().unwrap_or("")),
        malloc_only: args.malloc_only,
    };

    let file = File::open(&args.trace_file)
        .with_context(|| format!("could not open `{}`", args.trace_file.display()))?;
    let data = load(BufReader::new(file), &options)
        .with_context(|| format!("could not load `{}`", args.trace_file.display()))?;

    let summary = data.summary();
    if summary.retained_accesses == 0 {
        eprintln!("No accesses match the criteria.");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if let Some(query) = query {
        run_query(&data, query);
    }
    Ok(())
}

fn print_summary(summary: &LoadSummary) {
    println!(
        "{} records ({} skipped), {} definitions, {} contexts",
        summary.records, summary.skipped_records, summary.definitions, summary.contexts
    );
    println!(
        "{} instructions, {} accesses observed, {} retained ({} bytes) in {} runs",
        summary.total_instructions,
        summary.total_accesses,
        summary.retained_accesses,
        summary.access_bytes,
        summary.retained_runs
    );
    println!(
        "{} heap blocks ({} live at exit), {} pages touched, {} code objects",
        summary.heap_blocks, summary.live_heap_blocks, summary.pages, summary.code_objects
    );
}

fn run_query(data: &TraceData, query: NearestQuery) {
    let Some(hit) = data.nearest_access(query) else {
        println!("no accesses to query");
        return;
    };
    let access = hit.access;
    println!(
        "{:#x} ({} {} bytes) at iseq {}: {}",
        access.addr,
        access.dir,
        access.size,
        access.iseq,
        data.debug_info.resolve(access.instr_addr)
    );
    if let Some(block) = access.block {
        let block = data.store.heap_block(block);
        let label = block.label.as_deref().unwrap_or("heap block");
        println!(
            "  in {} {:#x} (size {:#x}), offset {:#x}",
            label,
            block.base,
            block.size,
            access.addr - block.base
        );
    }
    for frame in &hit.stack {
        println!("  {}", data.debug_info.resolve(*frame));
    }
}

/// Split on commas. Empty parts are preserved (they simply never match a
/// label), but an empty string yields nothing at all.
fn split_comma(s: &str) -> BTreeSet<String> {
    if s.is_empty() {
        return BTreeSet::new();
    }
    s.split(',').map(str::to_owned).collect()
}

fn parse_query(s: &str) -> Result<NearestQuery, String> {
    let parts: Vec<&str> = s.split(',').collect();
    let [addr, iseq, ratio] = parts.as_slice() else {
        return Err(format!("expected ADDR,ISEQ,RATIO, got `{s}`"));
    };
    let compact_addr = parse_word(addr).map_err(|e| format!("bad query address: {e}"))?;
    let iseq = iseq
        .parse::<u64>()
        .map_err(|e| format!("bad query iseq: {e}"))?;
    let addr_scale = ratio
        .parse::<f64>()
        .map_err(|e| format!("bad query ratio: {e}"))?;
    Ok(NearestQuery {
        compact_addr,
        iseq,
        addr_scale,
    })
}

fn parse_word(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
