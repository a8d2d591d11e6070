use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

/// Per-consumer buffering for [`fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkBuffer {
    /// Each consumer buffers at most `n` items; the pump waits for room.
    Bounded(usize),
    /// Consumers never apply backpressure to the pump.
    Unbounded,
}

enum Sink<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Sink<T> {
    /// False once the consumer has been dropped.
    async fn push(&self, item: T) -> bool {
        match self {
            Sink::Bounded(tx) => tx.send(item).await.is_ok(),
            Sink::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }
}

/// Splits `source` into `n` independently paced consumers.
///
/// The source is polled exactly once, by a background task, and every item
/// is delivered to every live consumer in order. A full bounded consumer
/// holds the pump until it has room, so no consumer can miss an item that
/// another consumer received. Dropped consumers are detached; the pump stops
/// early only when all of them are gone. Items are forwarded verbatim, so an
/// error item reaches every consumer before they close.
///
/// Must be called within a tokio runtime.
pub fn fork<S, T>(source: S, n: usize, buffer: ForkBuffer) -> Vec<BoxStream<'static, T>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
{
    let mut sinks = Vec::with_capacity(n);
    let mut outputs = Vec::with_capacity(n);

    for _ in 0..n {
        match buffer {
            ForkBuffer::Bounded(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                sinks.push(Sink::Bounded(tx));
                outputs.push(ReceiverStream::new(rx).boxed());
            }
            ForkBuffer::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                sinks.push(Sink::Unbounded(tx));
                outputs.push(UnboundedReceiverStream::new(rx).boxed());
            }
        }
    }

    tokio::spawn(pump(source, sinks));
    outputs
}

async fn pump<S, T>(source: S, mut sinks: Vec<Sink<T>>)
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
{
    let mut source = Box::pin(source);
    while let Some(item) = source.next().await {
        let mut live = Vec::with_capacity(sinks.len());
        for sink in sinks.drain(..) {
            if sink.push(item.clone()).await {
                live.push(sink);
            }
        }
        sinks = live;
        if sinks.is_empty() {
            tracing::debug!("all fork consumers dropped, stopping pump");
            return;
        }
    }
    // Dropping the senders closes every consumer.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::stream;

    use crate::error::{SoulError, SoulResult};

    #[tokio::test]
    async fn each_consumer_sees_every_item_in_order() {
        let mut forks = fork(stream::iter(vec!["a", "b", "c"]), 2, ForkBuffer::Unbounded);
        let second = forks.pop().unwrap();
        let first = forks.pop().unwrap();
        assert_eq!(first.collect::<Vec<_>>().await, vec!["a", "b", "c"]);
        assert_eq!(second.collect::<Vec<_>>().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn slow_consumer_with_tight_buffer_misses_nothing() {
        let items: Vec<u32> = (0..50).collect();
        let mut forks = fork(stream::iter(items.clone()), 2, ForkBuffer::Bounded(1));
        let slow = forks.pop().unwrap();
        let fast = forks.pop().unwrap();

        let slow_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut slow = slow;
            while let Some(item) = slow.next().await {
                if item % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                seen.push(item);
            }
            seen
        });
        let fast_seen: Vec<u32> = fast.collect().await;
        let slow_seen = slow_task.await.unwrap();

        assert_eq!(fast_seen, items);
        assert_eq!(slow_seen, items);
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_stall_others() {
        let items: Vec<u32> = (0..20).collect();
        let mut forks = fork(stream::iter(items.clone()), 2, ForkBuffer::Bounded(1));
        drop(forks.pop());
        let kept: Vec<u32> = forks.pop().unwrap().collect().await;
        assert_eq!(kept, items);
    }

    #[tokio::test]
    async fn errors_reach_every_consumer() {
        let source = stream::iter(vec![
            Ok("partial".to_string()),
            Err(SoulError::Transport("reset".into())),
        ]);
        let forks: Vec<_> = fork::<_, SoulResult<String>>(source, 2, ForkBuffer::Bounded(4));
        for consumer in forks {
            let items: Vec<SoulResult<String>> = consumer.collect().await;
            assert_eq!(items.len(), 2);
            assert_eq!(items[0], Ok("partial".to_string()));
            assert!(matches!(items[1], Err(SoulError::Transport(_))));
        }
    }

    #[tokio::test]
    async fn empty_source_closes_consumers() {
        let forks = fork(stream::iter(Vec::<u8>::new()), 3, ForkBuffer::Unbounded);
        for consumer in forks {
            assert!(consumer.collect::<Vec<_>>().await.is_empty());
        }
    }
}
