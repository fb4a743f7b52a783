//! Pull-mode front end: a background thread that reads the sensor on a
//! fixed cadence and hands each reading to ingest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};

use crate::PidLoop;

// Consecutive read failures tolerated before escalating to error level.
const FAILURE_REPORT_AFTER: u32 = 5;

pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Sleep one period, read the input channel under the loop's deadline,
    /// ingest. Read failures skip the tick; the poller never dies on them.
    pub fn spawn(pid_loop: Arc<Mutex<PidLoop>>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut consecutive_failures: u32 = 0;
            loop {
                thread::sleep(period);
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let mut guard = match pid_loop.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match guard.poll_input() {
                    Ok(reading) => {
                        consecutive_failures = 0;
                        guard.ingest(&reading);
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!("sensor poll failed: {err}");
                        if consecutive_failures > FAILURE_REPORT_AFTER {
                            error!("{consecutive_failures} consecutive sensor poll failures");
                        }
                    }
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Joins within one period plus the I/O deadline.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoopConfig, PidLoop};
    use bus::{BusError, Reading, Transport};
    use controller::PidConfig;
    use std::sync::atomic::AtomicU64;

    // Sensor with a fixed value and a live clock; heater/status accept
    // everything.
    struct Rig {
        reads: AtomicU64,
    }

    impl Transport for Rig {
        fn get(&self, channel: &str) -> Result<Reading, BusError> {
            match channel {
                "cryo_temperature" => {
                    self.reads.fetch_add(1, Ordering::Relaxed);
                    Ok(Reading::new()
                        .with_num("value", 99.5)
                        .with_text("timestamp", chrono::Utc::now().to_rfc3339()))
                }
                _ => Ok(Reading::new().with_num("value", 1.0)),
            }
        }

        fn set(&self, _channel: &str, value: f64) -> Result<Reading, BusError> {
            Ok(Reading::new().with_num("value", value))
        }
    }

    #[test]
    fn poller_reads_on_cadence_and_stops_cleanly() {
        let rig = Arc::new(Rig {
            reads: AtomicU64::new(0),
        });
        let cfg = LoopConfig {
            setpoint: 100.0,
            minimum_elapsed_time: 0.0,
            io_timeout: Duration::from_millis(200),
            max_settle_wait: Duration::from_millis(0),
            settle_poll: Duration::from_millis(1),
            ..Default::default()
        };
        let mut pl = PidLoop::new(cfg, PidConfig::default(), Arc::clone(&rig) as _).unwrap();
        pl.activate().unwrap();
        let shared = Arc::new(Mutex::new(pl));

        let poller = Poller::spawn(Arc::clone(&shared), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(120));
        poller.stop();

        let reads = rig.reads.load(Ordering::Relaxed);
        assert!(reads >= 3, "expected several polls, saw {reads}");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(rig.reads.load(Ordering::Relaxed), reads, "poller kept running");
    }
}
