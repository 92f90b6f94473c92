use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::utils::panic::panic_message;

pub fn spawn<F, T>(name: &str, f: F) -> anyhow::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| anyhow!("failed to spawn thread {}. {}", name, e))
}

/// Join a thread, reporting its panic instead of passing it on. Returns `false` on panic.
pub fn join_thread(handle: JoinHandle<()>) -> bool {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    match handle.join() {
        Ok(()) => true,
        Err(e) => {
            error!("thread {} panicked. {}", name, panic_message(&e));
            false
        }
    }
}

/// Join the threads that already ended and keep the others.
pub fn reap_finished(threads: &mut Vec<JoinHandle<()>>) {
    let (done, alive): (Vec<_>, Vec<_>) = std::mem::take(threads)
        .into_iter()
        .partition(|t| t.is_finished());
    *threads = alive;
    for thread in done {
        join_thread(thread);
    }
}

pub fn async_runtime(thread_name: &'static str) -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(move || {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("A-{}-{}", thread_name, id)
        })
        .build()
        .map_err(|e| anyhow!("failed to build runtime {}. {}", thread_name, e))
}

/// Sleep in short steps so that a stop flag is observed promptly.
pub fn sleep_while<F>(total: Duration, mut running: F)
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut slept = Duration::ZERO;
    while slept < total && running() {
        let d = step.min(total - slept);
        std::thread::sleep(d);
        slept += d;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::utils::thread::{join_thread, reap_finished, sleep_while, spawn};

    #[test]
    pub fn spawn_name_test() {
        let h = spawn("T-name", || std::thread::current().name().map(|x| x.to_string())).unwrap();
        assert_eq!(h.join().unwrap(), Some("T-name".to_string()));
    }

    #[test]
    pub fn sleep_while_interrupt_test() {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let begin = Instant::now();
        let h = std::thread::spawn(move || {
            sleep_while(Duration::from_secs(10), || r.load(Ordering::SeqCst));
        });
        std::thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        h.join().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[test]
    pub fn reap_finished_test() {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let mut threads = vec![
            spawn("T-done", || {}).unwrap(),
            spawn("T-panic", || panic!("task blew up")).unwrap(),
            spawn("T-alive", move || {
                sleep_while(Duration::from_secs(10), || r.load(Ordering::SeqCst))
            })
            .unwrap(),
        ];
        let deadline = Instant::now() + Duration::from_secs(5);
        while threads.iter().filter(|t| t.is_finished()).count() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        reap_finished(&mut threads);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread().name(), Some("T-alive"));

        running.store(false, Ordering::SeqCst);
        assert!(join_thread(threads.remove(0)));
        assert!(!join_thread(spawn("T-panic-2", || panic!("again")).unwrap()));
    }
}
