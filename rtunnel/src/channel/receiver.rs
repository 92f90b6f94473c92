use std::time::Duration;

use crate::channel::{Receiver, RecvTimeoutError, TryRecvError};
use crate::metrics::metric::{Counter, Gauge};

pub struct ChannelReceiver<T> {
    name: String,
    pub(crate) receiver: Receiver<T>,
    size: Gauge,
    drain_counter: Counter,
}

impl<T> ChannelReceiver<T> {
    pub fn new(name: &str, receiver: Receiver<T>, size: Gauge, drain_counter: Counter) -> Self {
        ChannelReceiver {
            name: name.to_string(),
            receiver,
            size,
            drain_counter,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    fn on_success(&self) {
        self.size.fetch_sub(1);
        self.drain_counter.fetch_add(1);
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.receiver.try_recv().map(|event| {
            self.on_success();
            event
        })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout).map(|event| {
            self.on_success();
            event
        })
    }
}
