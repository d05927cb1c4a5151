//! Process gauges backed by `sysinfo`.
//!
//! Registered through the ordinary gauge interface; nothing in the
//! aggregation path depends on them.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::aggregator::Aggregator;

pub const RESIDENT_BYTES: &str = "sys.ResidentBytes";
pub const VIRTUAL_BYTES: &str = "sys.VirtualBytes";
pub const NUM_THREADS: &str = "sys.NumThreads";

/// Names registered by [`register_runtime_gauges`].
pub const RUNTIME_GAUGES: [&str; 3] = [RESIDENT_BYTES, VIRTUAL_BYTES, NUM_THREADS];

struct ProcessProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessProbe {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve current pid, runtime gauges report NaN");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Refreshes the process entry and reads one value from it.
    fn read(&self, f: impl Fn(&sysinfo::Process) -> Option<f64>) -> f64 {
        let Some(pid) = self.pid else {
            return f64::NAN;
        };
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(pid).and_then(f).unwrap_or(f64::NAN)
    }
}

/// Registers resident memory, virtual memory and thread count gauges.
pub fn register_runtime_gauges(aggregator: &Aggregator) {
    let probe = Arc::new(ProcessProbe::new());

    let p = Arc::clone(&probe);
    aggregator.register_gauge(RESIDENT_BYTES, move || {
        p.read(|process| Some(process.memory() as f64))
    });

    let p = Arc::clone(&probe);
    aggregator.register_gauge(VIRTUAL_BYTES, move || {
        p.read(|process| Some(process.virtual_memory() as f64))
    });

    // thread listing is only available on Linux
    aggregator.register_gauge(NUM_THREADS, move || {
        probe.read(|process| process.tasks().map(|tasks| tasks.len() as f64))
    });
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_registers_all_runtime_gauges() {
        let agg = Aggregator::new();
        register_runtime_gauges(&agg);
        assert_eq!(agg.gauge_count(), RUNTIME_GAUGES.len());

        let raw = agg.collect_interval(Utc::now());
        for name in RUNTIME_GAUGES {
            assert!(raw.gauges.contains_key(name), "missing gauge {}", name);
        }
    }
}
