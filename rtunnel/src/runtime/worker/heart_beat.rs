use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api::runtime::WorkerId;
use crate::utils::thread::{sleep_while, spawn};

/// Report liveness of a worker every `interval` until `running` turns false.
pub(crate) fn start_heartbeat<F>(
    worker_id: WorkerId,
    interval: Duration,
    running: Arc<AtomicBool>,
    beat: F,
) -> anyhow::Result<JoinHandle<()>>
where
    F: Fn() -> anyhow::Result<()> + Send + 'static,
{
    spawn(format!("Heartbeat-{}", worker_id.0).as_str(), move || {
        info!("heartbeat loop of {} starting...", worker_id);
        let mut failures = 0u64;
        while running.load(Ordering::Relaxed) {
            match beat() {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("heartbeat of {} failed {} times. {}", worker_id, failures, e);
                }
            }
            sleep_while(interval, || running.load(Ordering::Relaxed));
        }
        info!("heartbeat loop of {} stopped", worker_id);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::api::runtime::WorkerId;
    use crate::runtime::worker::heart_beat::start_heartbeat;

    #[test]
    pub fn heartbeat_until_stopped_test() {
        let beats = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let counter = beats.clone();
        let handle = start_heartbeat(
            WorkerId(1),
            Duration::from_millis(10),
            running.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        let n = beats.load(Ordering::SeqCst);
        assert!(n >= 2, "only {} beats", n);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(beats.load(Ordering::SeqCst), n);
    }
}
