use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::channel::{SendTimeoutError, Sender};
use crate::metrics::metric::{Counter, Gauge};

const SEND_STEP: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ChannelSender<T> {
    name: String,
    sender: Sender<T>,

    size: Gauge,
    counter: Counter,
}

impl<T> ChannelSender<T> {
    pub fn new(name: &str, sender: Sender<T>, size: Gauge, counter: Counter) -> Self {
        ChannelSender {
            name: name.to_string(),
            sender,
            size,
            counter,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    fn on_success(&self) {
        self.size.fetch_add(1);
        self.counter.fetch_add(1);
    }

    /// Blocks while the channel is full. Gives up once `running` turns false or the
    /// receiver is gone, so a cancelled producer never hangs on a stalled consumer.
    pub fn send(&self, mut event: T, running: &AtomicBool) -> anyhow::Result<()> {
        let mut times = 0u64;
        loop {
            match self.sender.send_timeout(event, SEND_STEP) {
                Ok(()) => {
                    self.on_success();
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(e)) => {
                    if !running.load(Ordering::Relaxed) {
                        return Err(anyhow!("channel {} send interrupted", self.name));
                    }
                    times += 1;
                    if times % 200 == 0 {
                        warn!("channel {} full over {} times", self.name, times);
                    }
                    event = e;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(anyhow!("channel {} disconnected", self.name));
                }
            }
        }
    }

    pub fn size(&self) -> i64 {
        self.size.load()
    }
}
