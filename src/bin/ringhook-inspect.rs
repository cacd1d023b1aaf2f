//! Read-only diagnostic CLI: attaches to an existing ring-buffer
//! mapping and dumps header fields, free-map occupancy, and per-ring
//! state. Not part of the core library's programmatic interface.

use std::path::PathBuf;

use clap::Parser;
use ringhook::{Mapping, MonitorView};

#[derive(Parser)]
#[command(name = "ringhook-inspect")]
#[command(about = "Dump the state of a ringhook shared-memory mapping", long_about = None)]
struct Cli {
    /// Path to the backing file of an existing mapping.
    path: PathBuf,

    /// Also print the most recent call-stack snapshot for each in-use ring.
    #[arg(long)]
    snapshots: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mapping = match Mapping::attach(&cli.path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to attach to {:?}: {e}", cli.path);
            std::process::exit(1);
        }
    };

    let monitor = MonitorView::new(mapping.clone());

    println!("mapping: {:?}", mapping.path());
    println!("max_buffers: {}", monitor.max_buffers());
    println!("single: {}", monitor.single());

    let rings = monitor.rings();
    let in_use = rings.iter().filter(|r| !r.free).count();
    println!("rings in use: {in_use}/{}", rings.len());

    println!();
    println!("{:>4}  {:>4}  {:>8}  {:>8}  {:>6}  {:>6}  {:>6}", "idx", "free", "pid", "tid", "depth", "trace", "signal");
    for ring in &rings {
        println!(
            "{:>4}  {:>4}  {:>8}  {:>8}  {:>6}  {:>6}  {:>6}",
            ring.index,
            if ring.free { "yes" } else { "no" },
            ring.pid,
            ring.tid,
            ring.depth,
            ring.trace,
            ring.signal,
        );
    }

    if cli.snapshots {
        println!();
        for ring in rings.iter().filter(|r| !r.free) {
            println!("ring {} snapshot:", ring.index);
            for slot in monitor.ring_snapshot(ring.index) {
                println!("  line {:<6} t={:<12} {}", slot.linenumber, slot.timestamp, slot.subroutine);
            }
        }
    }

    let global = monitor.read_global();
    if !global.is_empty() {
        println!();
        println!("global buffer ({} bytes): {}", global.len(), String::from_utf8_lossy(&global));
    }
}
