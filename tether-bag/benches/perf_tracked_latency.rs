//! Cycle-accurate cursor-dereference latency under concurrent
//! maintenance pressure.
//!
//! One thread hammers `Tracked::lock` on a pinned element while
//! another churns the rest of the bag (erase + re-emplace), so the
//! measured path includes contended chunk-lock acquisition and the
//! occasional retarget.
//!
//! Run with:
//!   cargo build --release --bench perf_tracked_latency
//!   taskset -c 0,2 ./target/release/deps/perf_tracked_latency-*

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use hdrhistogram::Histogram;

use tether_bag::{ChunkedBag, default_capacity};

const CAP: usize = default_capacity::<u64>();
const WARMUP: usize = 10_000;
const SAMPLES: usize = 500_000;

#[inline(always)]
fn rdtscp() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let mut aux: u32 = 0;
        std::arch::x86_64::__rdtscp(&mut aux)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::Instant;
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

fn print_stats(name: &str, hist: &Histogram<u64>) {
    println!("{}", name);
    println!("  min:  {:>6} cycles", hist.min());
    println!("  p50:  {:>6} cycles", hist.value_at_quantile(0.50));
    println!("  p99:  {:>6} cycles", hist.value_at_quantile(0.99));
    println!("  p999: {:>6} cycles", hist.value_at_quantile(0.999));
    println!("  max:  {:>6} cycles", hist.max());
    println!("  avg:  {:>6.0} cycles", hist.mean());
}

fn main() {
    let bag: Arc<ChunkedBag<u64, CAP>> = Arc::new(ChunkedBag::new());

    for i in 0..50_000u64 {
        bag.emplace(i);
    }
    let cursor = bag.emplace(u64::MAX).into_tracked();

    let stop = Arc::new(AtomicBool::new(false));

    // Churn thread: keep maintenance busy.
    let churner = {
        let bag = Arc::clone(&bag);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                bag.iterate(|entry| {
                    if *entry.get() % 7 == 0 {
                        bag.erase(&entry);
                    }
                });
                for i in 0..50_000u64 {
                    if i % 7 == 0 {
                        bag.emplace(i);
                    }
                }
            }
        })
    };

    let mut uncontended = Histogram::<u64>::new(3).unwrap();
    let mut contended = Histogram::<u64>::new(3).unwrap();

    for i in 0..WARMUP + SAMPLES {
        let start = rdtscp();
        let access = cursor.lock().expect("pinned element never erased");
        let value = *access.get();
        drop(access);
        let end = rdtscp();

        assert_eq!(value, u64::MAX);
        if i >= WARMUP {
            let _ = contended.record(end.wrapping_sub(start));
        }
    }

    stop.store(true, Ordering::Relaxed);
    churner.join().unwrap();

    for i in 0..WARMUP + SAMPLES {
        let start = rdtscp();
        let access = cursor.lock().expect("pinned element never erased");
        let value = *access.get();
        drop(access);
        let end = rdtscp();

        assert_eq!(value, u64::MAX);
        if i >= WARMUP {
            let _ = uncontended.record(end.wrapping_sub(start));
        }
    }

    println!(
        "tracked cursor lock latency ({} samples)",
        contended.len()
    );
    println!("--------------------------------------------");
    print_stats("contended (churn running)", &contended);
    print_stats("uncontended (quiescent)", &uncontended);
}
