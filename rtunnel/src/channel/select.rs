use std::time::Duration;

use crossbeam::channel::Select;

use crate::channel::receiver::ChannelReceiver;
use crate::channel::Receiver;

/// Waits on a changing subset of receivers; operation indexes are in `recv` call order.
pub struct ChannelSelect<'a> {
    select: Select<'a>,
}

impl<'a> ChannelSelect<'a> {
    pub fn new() -> Self {
        ChannelSelect {
            select: Select::new(),
        }
    }

    pub fn recv<T>(&mut self, r: &'a ChannelReceiver<T>) -> usize {
        self.select.recv(&r.receiver)
    }

    pub fn recv_raw<T>(&mut self, r: &'a Receiver<T>) -> usize {
        self.select.recv(r)
    }

    /// Index of an operation that may be ready. A following `try_recv` can still come
    /// back empty.
    pub fn ready_timeout(&mut self, timeout: Duration) -> Option<usize> {
        self.select.ready_timeout(timeout).ok()
    }
}
