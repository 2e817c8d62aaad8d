//! shmq-xchg: bounded producer/consumer exchange over a shared-memory
//! queue.
//!
//! Opens (or creates) a queue segment by name and runs one side of the
//! exchange. Start both sides against the same name, in either order:
//!
//! ```bash
//! shmq-xchg --producer --count 1000000 &
//! shmq-xchg --consumer --count 1000000 --unlink
//! ```
//!
//! Each message is 64 bytes: eight u64 lanes, all carrying the sequence
//! number. The consumer asserts every lane, so any loss, duplication, or
//! reordering aborts the run.

use std::time::Instant;

use clap::Parser;
use shm_queue::{Segment, ShmQueue};

/// One fixed-width record.
type Message = [u64; 8];

#[derive(Parser, Debug)]
#[command(name = "shmq-xchg")]
#[command(about = "Bounded producer/consumer exchange over a shared-memory queue")]
struct Args {
    /// Run as the producing side.
    #[arg(long, conflicts_with = "consumer")]
    producer: bool,

    /// Run as the consuming side.
    #[arg(long)]
    consumer: bool,

    /// Segment name in the shared-memory namespace.
    #[arg(long, default_value = "/shmq-xchg")]
    name: String,

    /// Number of messages to exchange.
    #[arg(long, default_value_t = 1_000_000)]
    count: u64,

    /// Remove the segment name once the exchange completes.
    #[arg(long)]
    unlink: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.producer == args.consumer {
        eprintln!("specify exactly one of --producer / --consumer");
        std::process::exit(2);
    }

    let mut seg = Segment::open(&args.name).expect("failed to open segment");

    let start = Instant::now();
    if args.producer {
        produce(&mut seg, args.count);
    } else {
        consume(&mut seg, args.count);
    }
    let elapsed = start.elapsed();
    tracing::info!(
        count = args.count,
        elapsed_ms = elapsed.as_millis() as u64,
        msgs_per_sec = (args.count as f64 / elapsed.as_secs_f64()) as u64,
        "exchange complete"
    );

    if args.unlink {
        seg.unlink().expect("failed to unlink segment");
    }
}

fn produce(seg: &mut Segment, count: u64) {
    tracing::info!(count, "producer starting");
    let mut queue: ShmQueue<'_, Message> = ShmQueue::new(seg).expect("failed to attach queue");
    for seq in 0..count {
        queue.push([seq; 8]);
        if seq % 1_000_000 == 0 {
            tracing::info!(seq, "producing");
        }
    }
}

fn consume(seg: &mut Segment, count: u64) {
    tracing::info!(count, "consumer starting");
    let mut queue: ShmQueue<'_, Message> = ShmQueue::new(seg).expect("failed to attach queue");
    for seq in 0..count {
        let msg = loop {
            match queue.pop() {
                Some(m) => break m,
                None => core::hint::spin_loop(),
            }
        };
        for lane in msg {
            assert_eq!(lane, seq, "lost, duplicated, or reordered record");
        }
        if seq % 1_000_000 == 0 {
            tracing::info!(seq, "consuming");
        }
    }
}
