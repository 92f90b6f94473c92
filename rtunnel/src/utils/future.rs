use std::sync::Mutex;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

/// Handed out to observers of a [`CompletableFuture`]. Resolves to an error when the
/// producer side is dropped without completing.
pub type PassiveCompletableFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A single-assignment value observed through any number of futures.
pub struct CompletableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: Mutex<Option<oneshot::Sender<T>>>,
    shared: Shared<oneshot::Receiver<T>>,
}

impl<T> CompletableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        CompletableFuture {
            sender: Mutex::new(Some(sender)),
            shared: receiver.shared(),
        }
    }

    /// Returns `false` when the value was already set, the new value is then dropped.
    pub fn complete(&self, value: T) -> bool {
        let mut sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match sender.take() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    pub fn future(&self) -> PassiveCompletableFuture<T> {
        let shared = self.shared.clone();
        async move {
            shared
                .await
                .map_err(|_| anyhow!("future dropped before completion"))
        }
        .boxed()
    }
}

impl<T> Default for CompletableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        CompletableFuture::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::future::CompletableFuture;

    #[tokio::test]
    pub async fn complete_once_test() {
        let f = CompletableFuture::new();
        let a = f.future();
        let b = f.future();

        assert!(!f.is_done());
        assert!(f.complete(1));
        assert!(!f.complete(2));
        assert!(f.is_done());

        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(b.await.unwrap(), 1);
        // observers created after completion see the same value
        assert_eq!(f.future().await.unwrap(), 1);
    }

    #[tokio::test]
    pub async fn dropped_producer_test() {
        let f: CompletableFuture<u32> = CompletableFuture::new();
        let observer = f.future();
        drop(f);
        assert!(observer.await.is_err());
    }
}
