use std::sync::Arc;

use clap::Parser;
use log::info;
use parking_lot::Mutex;

use schicht::{Heap, HeapCreateInfo, Oid, Value};

/// Synthetic workload driver: one independent layered heap per worker
/// thread, churning objects through freeze and compaction cycles.
#[derive(Debug, Clone, Parser)]
#[command(name = "schicht")]
struct Cli {
    /// Arena size in bytes, per heap
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    heap_size: usize,

    /// Evaluation stack capacity in slots
    #[arg(long, default_value_t = 4096)]
    stack_slots: usize,

    /// Call-frame list capacity
    #[arg(long, default_value_t = 512)]
    frames: usize,

    /// Worker threads, each owning an independent heap
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Generation cycles per worker
    #[arg(long, default_value_t = 4)]
    cycles: usize,

    /// Selectors defined per cycle
    #[arg(long, default_value_t = 32)]
    churn: usize,
}

#[derive(Debug)]
struct WorkerReport {
    thread: usize,
    selectors: usize,
    checksum: i64,
    live_remaining: usize,
}

fn run_worker(thread: usize, cli: &Cli) -> WorkerReport {
    let mut heap = Heap::new(HeapCreateInfo {
        size: cli.heap_size,
        stack_slots: Some(cli.stack_slots),
        frame_count: Some(cli.frames),
        live_region_size: None,
    });

    let class = heap.new_class("Churn").expect("class");
    let mut selectors = 0usize;

    for cycle in 0..cli.cycles {
        heap.enter_frame(Oid::from_raw(1), 0);
        for i in 0..cli.churn {
            let selector = format!("sel_{cycle}_{i}");
            let value = Value::from_i64((cycle * cli.churn + i) as i64);
            heap.class_define(class, &selector, value).expect("define");
            heap.push(value);
            selectors += 1;
        }
        heap.global_set(&format!("cycle_{cycle}"), Value::from_i64(cycle as i64))
            .expect("global");
        for _ in 0..cli.churn {
            heap.pop();
        }
        heap.leave_frame();
        heap.freeze().expect("freeze");
    }
    heap.compact().expect("compact");

    let mut checksum = 0i64;
    for cycle in 0..cli.cycles {
        for i in 0..cli.churn {
            let selector = format!("sel_{cycle}_{i}");
            checksum += heap
                .class_lookup(class, &selector)
                .expect("selector survives compaction")
                .as_i64();
        }
    }

    WorkerReport {
        thread,
        selectors,
        checksum,
        live_remaining: heap.live_remaining(),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let reports: Arc<Mutex<Vec<WorkerReport>>> =
        Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for thread in 0..cli.threads {
        let cli = cli.clone();
        let reports = reports.clone();
        handles.push(std::thread::spawn(move || {
            let report = run_worker(thread, &cli);
            reports.lock().push(report);
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let mut reports = reports.lock();
    reports.sort_by_key(|report| report.thread);
    for report in reports.iter() {
        info!(
            "worker {}: {} selectors, checksum {}, {} bytes left in the live region",
            report.thread,
            report.selectors,
            report.checksum,
            report.live_remaining
        );
    }
    let expected: i64 = (0..(cli.cycles * cli.churn) as i64).sum();
    assert!(
        reports.iter().all(|report| report.checksum == expected),
        "every worker must read back the values it defined"
    );
    info!(
        "{} workers × {} cycles completed, checksum {}",
        cli.threads, cli.cycles, expected
    );
}
