//! Bounded in-process channels carrying [`Element`]s between the tasks of one task group.
//! Every channel reports its size and throughput to the metric registry.

use crate::api::element::Element;
use crate::channel::receiver::ChannelReceiver;
use crate::channel::sender::ChannelSender;
use crate::metrics::{register_counter, register_gauge, Tag};

pub const CHANNEL_SIZE_PREFIX: &str = "channel_size_";
pub const CHANNEL_ACCEPTED_PREFIX: &str = "channel_accepted_";
pub const CHANNEL_DRAIN_PREFIX: &str = "channel_drain_";

pub type TryRecvError = crossbeam::channel::TryRecvError;
pub type RecvTimeoutError = crossbeam::channel::RecvTimeoutError;
pub type SendTimeoutError<T> = crossbeam::channel::SendTimeoutError<T>;

pub type ElementReceiver = ChannelReceiver<Element>;
pub type ElementSender = ChannelSender<Element>;

pub type Receiver<T> = crossbeam::channel::Receiver<T>;
pub type Sender<T> = crossbeam::channel::Sender<T>;

pub mod receiver;
pub mod select;
pub mod sender;

pub fn bounded<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    crossbeam::channel::bounded(cap)
}

pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    crossbeam::channel::unbounded()
}

pub fn named_channel<T>(
    name: &str,
    tags: Vec<Tag>,
    cap: usize,
) -> (ChannelSender<T>, ChannelReceiver<T>) {
    debug!("create channel {}, capacity: {}", name, cap);

    let (sender, receiver) = bounded(cap.max(1));
    let size = register_gauge(CHANNEL_SIZE_PREFIX.to_owned() + name, tags.clone());
    let accepted_counter =
        register_counter(CHANNEL_ACCEPTED_PREFIX.to_owned() + name, tags.clone());
    let drain_counter = register_counter(CHANNEL_DRAIN_PREFIX.to_owned() + name, tags);

    (
        ChannelSender::new(name, sender, size.clone(), accepted_counter),
        ChannelReceiver::new(name, receiver, size, drain_counter),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::channel::named_channel;
    use crate::channel::select::ChannelSelect;
    use crate::metrics::Tag;

    #[test]
    pub fn named_channel_metric_test() {
        let (sender, receiver) = named_channel::<u32>("test_a", vec![Tag::new("t", "a")], 2);
        let running = AtomicBool::new(true);
        sender.send(1, &running).unwrap();
        sender.send(2, &running).unwrap();
        assert_eq!(sender.size(), 2);

        assert_eq!(receiver.try_recv().unwrap(), 1);
        assert_eq!(receiver.recv_timeout(Duration::from_millis(10)).unwrap(), 2);
        assert_eq!(sender.size(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    pub fn send_gives_up_when_stopped_test() {
        let (sender, _receiver) = named_channel::<u32>("test_b", vec![], 1);
        let running = AtomicBool::new(true);
        sender.send(1, &running).unwrap();

        let stopped = AtomicBool::new(false);
        assert!(sender.send(2, &stopped).is_err());
    }

    #[test]
    pub fn select_ready_test() {
        let (s1, r1) = named_channel::<u32>("test_c", vec![], 4);
        let (_s2, r2) = named_channel::<u32>("test_d", vec![], 4);
        let running = AtomicBool::new(true);
        s1.send(7, &running).unwrap();

        let mut select = ChannelSelect::new();
        let i1 = select.recv(&r1);
        let _i2 = select.recv(&r2);
        assert_eq!(select.ready_timeout(Duration::from_millis(100)), Some(i1));
        assert_eq!(r1.try_recv().unwrap(), 7);
        assert_eq!(select.ready_timeout(Duration::from_millis(10)), None);
    }
}
