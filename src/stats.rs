//! Statistics collection and reporting.
//!
//! Counters for the event mix, per-thread CPU/latency accounting, and
//! per-bucket aggregates. `report()` produces a serde-serializable summary;
//! `print_summary()` renders the human tables.

use serde::Serialize;

use crate::scheduler::Scheduler;
use crate::thread::Thread;
use crate::types::{Bucket, TimeUs, NUM_BUCKETS};

/// Per-thread statistics.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    pub tid: u32,
    pub name: String,
    pub thread_group: String,
    pub bucket: usize,
    pub total_cpu_us: u64,
    pub total_wait_us: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    /// Runnable-to-dispatch latency samples.
    pub latencies: Vec<u64>,
}

impl ThreadStats {
    pub fn avg_latency_us(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64
    }

    pub fn max_latency_us(&self) -> u64 {
        self.latencies.iter().copied().max().unwrap_or(0)
    }

    pub fn p99_latency_us(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// Per-bucket aggregate statistics.
#[derive(Debug, Default, Clone)]
pub struct BucketStats {
    pub thread_count: u32,
    pub total_cpu_us: u64,
    pub total_latency_us: u64,
    pub latency_samples: u64,
    pub max_latency_us: u64,
}

/// Collects simulation-wide counters and per-thread accounting.
#[derive(Debug)]
pub struct StatsCollector {
    pub thread_stats: Vec<ThreadStats>,
    pub bucket_stats: [BucketStats; NUM_BUCKETS],
    pub processor_count: u32,
    pub simulation_duration: TimeUs,

    pub wakeup_count: u64,
    pub block_count: u64,
    pub quantum_expire_count: u64,
    pub tick_count: u64,
    pub context_switch_count: u64,
    pub preemption_count: u64,
    pub rt_deadline_misses: u64,
}

impl StatsCollector {
    pub fn new(processor_count: u32) -> Self {
        StatsCollector {
            thread_stats: Vec::new(),
            bucket_stats: std::array::from_fn(|_| BucketStats::default()),
            processor_count,
            simulation_duration: 0,
            wakeup_count: 0,
            block_count: 0,
            quantum_expire_count: 0,
            tick_count: 0,
            context_switch_count: 0,
            preemption_count: 0,
            rt_deadline_misses: 0,
        }
    }

    /// Register a thread at creation. Threads register in tid order so the
    /// stats vector is tid-indexed.
    pub fn register_thread(&mut self, thread: &Thread, sched: &Scheduler) {
        assert_eq!(
            thread.tid.0 as usize,
            self.thread_stats.len(),
            "threads must register in tid order"
        );
        self.thread_stats.push(ThreadStats {
            tid: thread.tid.0,
            name: thread.name.clone(),
            thread_group: sched.groups[thread.group.0 as usize].name.clone(),
            bucket: thread.bucket.index(),
            ..Default::default()
        });
        self.bucket_stats[thread.bucket.index()].thread_count += 1;
    }

    /// Record a dispatch latency sample.
    pub fn record_dispatch(&mut self, thread: &Thread, timestamp: TimeUs) {
        if thread.last_made_runnable_time == 0 {
            return;
        }
        let latency = timestamp - thread.last_made_runnable_time;
        let ts = &mut self.thread_stats[thread.tid.0 as usize];
        ts.latencies.push(latency);
        let bs = &mut self.bucket_stats[thread.bucket.index()];
        bs.total_latency_us += latency;
        bs.latency_samples += 1;
        bs.max_latency_us = bs.max_latency_us.max(latency);
    }

    /// Copy final per-thread totals out of the scheduler.
    pub fn finalize(&mut self, sched: &Scheduler, duration: TimeUs) {
        self.simulation_duration = duration;
        for thread in &sched.threads {
            let ts = &mut self.thread_stats[thread.tid.0 as usize];
            ts.total_cpu_us = thread.total_cpu_us;
            ts.total_wait_us = thread.total_wait_us;
            ts.context_switches = thread.context_switches;
            ts.preemptions = thread.preemption_count;
            self.bucket_stats[thread.bucket.index()].total_cpu_us += thread.total_cpu_us;
        }
    }

    /// Serializable summary of the run.
    pub fn report(&self) -> SimReport {
        let total_capacity = self.simulation_duration * self.processor_count as u64;
        let buckets = (0..NUM_BUCKETS)
            .filter(|&b| self.bucket_stats[b].thread_count > 0)
            .map(|b| {
                let bs = &self.bucket_stats[b];
                let mut all: Vec<u64> = self
                    .thread_stats
                    .iter()
                    .filter(|t| t.bucket == b)
                    .flat_map(|t| t.latencies.iter().copied())
                    .collect();
                all.sort_unstable();
                let p99 = if all.is_empty() {
                    0
                } else {
                    all[((all.len() as f64 * 0.99) as usize).min(all.len() - 1)]
                };
                BucketReport {
                    bucket: Bucket::from_index(b).name(),
                    threads: bs.thread_count,
                    total_cpu_us: bs.total_cpu_us,
                    cpu_pct: if total_capacity > 0 {
                        bs.total_cpu_us as f64 / total_capacity as f64 * 100.0
                    } else {
                        0.0
                    },
                    avg_latency_us: if bs.latency_samples > 0 {
                        bs.total_latency_us as f64 / bs.latency_samples as f64
                    } else {
                        0.0
                    },
                    max_latency_us: bs.max_latency_us,
                    p99_latency_us: p99,
                }
            })
            .collect();

        let threads = self
            .thread_stats
            .iter()
            .map(|t| ThreadReport {
                tid: t.tid,
                name: t.name.clone(),
                thread_group: t.thread_group.clone(),
                bucket: Bucket::from_index(t.bucket).name(),
                total_cpu_us: t.total_cpu_us,
                avg_latency_us: t.avg_latency_us(),
                max_latency_us: t.max_latency_us(),
                context_switches: t.context_switches,
                preemptions: t.preemptions,
            })
            .collect();

        SimReport {
            duration_us: self.simulation_duration,
            cpus: self.processor_count,
            wakeups: self.wakeup_count,
            blocks: self.block_count,
            quantum_expires: self.quantum_expire_count,
            sched_ticks: self.tick_count,
            context_switches: self.context_switch_count,
            preemptions: self.preemption_count,
            rt_deadline_misses: self.rt_deadline_misses,
            buckets,
            threads,
        }
    }

    /// Print the human-readable summary tables.
    pub fn print_summary(&self) {
        let report = self.report();

        println!("{}", "=".repeat(80));
        println!("Clutch Scheduler Simulation Results");
        println!("{}", "=".repeat(80));
        println!(
            "Duration: {:.1}ms | CPUs: {} | Context Switches: {} | Sched Ticks: {} | RT Misses: {}",
            report.duration_us as f64 / 1000.0,
            report.cpus,
            report.context_switches,
            report.sched_ticks,
            report.rt_deadline_misses,
        );
        println!();

        println!("Per-Bucket Summary:");
        println!(
            "  {:<8} {:>7} {:>10} {:>6} {:>11} {:>11} {:>11}",
            "Bucket", "Threads", "CPU(us)", "CPU%", "AvgLat(us)", "MaxLat(us)", "P99Lat(us)"
        );
        println!("  {}", "-".repeat(72));
        for b in &report.buckets {
            println!(
                "  {:<8} {:>7} {:>10} {:>5.1}% {:>11.0} {:>11} {:>11}",
                b.bucket,
                b.threads,
                b.total_cpu_us,
                b.cpu_pct,
                b.avg_latency_us,
                b.max_latency_us,
                b.p99_latency_us
            );
        }
        println!();

        println!("Per-Thread Detail:");
        println!(
            "  {:<20} {:<12} {:<6} {:>10} {:>8} {:>8} {:>5} {:>7}",
            "Name", "TG", "Bucket", "CPU(us)", "AvgLat", "MaxLat", "CSw", "Preempt"
        );
        println!("  {}", "-".repeat(82));
        let mut threads: Vec<&ThreadReport> = report.threads.iter().collect();
        threads.sort_by_key(|t| std::cmp::Reverse(t.total_cpu_us));
        for t in threads {
            println!(
                "  {:<20} {:<12} {:<6} {:>10} {:>8.0} {:>8} {:>5} {:>7}",
                t.name,
                t.thread_group,
                t.bucket,
                t.total_cpu_us,
                t.avg_latency_us,
                t.max_latency_us,
                t.context_switches,
                t.preemptions
            );
        }
        println!("{}", "=".repeat(80));
    }
}

/// Serializable run summary.
#[derive(Debug, Serialize)]
pub struct SimReport {
    pub duration_us: TimeUs,
    pub cpus: u32,
    pub wakeups: u64,
    pub blocks: u64,
    pub quantum_expires: u64,
    pub sched_ticks: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub rt_deadline_misses: u64,
    pub buckets: Vec<BucketReport>,
    pub threads: Vec<ThreadReport>,
}

#[derive(Debug, Serialize)]
pub struct BucketReport {
    pub bucket: &'static str,
    pub threads: u32,
    pub total_cpu_us: u64,
    pub cpu_pct: f64,
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
    pub p99_latency_us: u64,
}

#[derive(Debug, Serialize)]
pub struct ThreadReport {
    pub tid: u32,
    pub name: String,
    pub thread_group: String,
    pub bucket: &'static str,
    pub total_cpu_us: u64,
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
    pub context_switches: u64,
    pub preemptions: u64,
}
