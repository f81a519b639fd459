use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stable identity of a work item for the lifetime of the multiplexer, so
/// results can be correlated back to their source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkId(u64);

/// A unit of concurrent work. `Single` produces exactly one value and is
/// done; `Sequence` produces zero or more values over time and retires when
/// its stream ends. The variant is decided at registration, not inspected
/// dynamically.
pub enum Work<T> {
    Single(BoxFuture<'static, anyhow::Result<T>>),
    Sequence(BoxStream<'static, anyhow::Result<T>>),
}

impl<T> Work<T> {
    pub fn single<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Work::Single(fut.boxed())
    }

    pub fn sequence<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
    {
        Work::Sequence(stream.boxed())
    }
}

enum Event<T> {
    Value(WorkId, T),
    Retired(WorkId),
    Failed(WorkId, anyhow::Error),
}

/// Runs an open set of work items concurrently and yields each value as it
/// becomes available, in completion order. New work may be pushed at any
/// time, including between results while consuming.
///
/// A `Sequence` item keeps appearing after each value until its stream ends;
/// the end retires it silently, like a completed `Single`. The first item
/// error cancels all remaining items and is returned to the consumer.
pub struct Multiplexer<T> {
    tx: mpsc::Sender<Event<T>>,
    rx: mpsc::Receiver<Event<T>>,
    cancel: CancellationToken,
    next_id: u64,
    live: usize,
    finished: bool,
}

const RESULT_CHANNEL_CAPACITY: usize = 32;

impl<T: Send + 'static> Multiplexer<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            tx,
            rx,
            cancel: CancellationToken::new(),
            next_id: 0,
            live: 0,
            finished: false,
        }
    }

    /// Adds a work item to the running set and starts it immediately.
    pub fn push(&mut self, work: Work<T>) -> WorkId {
        let id = WorkId(self.next_id);
        self.next_id += 1;
        self.live += 1;

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = Self::run(id, work, &tx) => {}
            }
        });
        id
    }

    async fn run(id: WorkId, work: Work<T>, tx: &mpsc::Sender<Event<T>>) {
        match work {
            Work::Single(fut) => match fut.await {
                Ok(value) => {
                    if tx.send(Event::Value(id, value)).await.is_ok() {
                        let _ = tx.send(Event::Retired(id)).await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Event::Failed(id, e)).await;
                }
            },
            Work::Sequence(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            if tx.send(Event::Value(id, value)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Event::Failed(id, e)).await;
                            return;
                        }
                    }
                }
                let _ = tx.send(Event::Retired(id)).await;
            }
        }
    }

    /// Waits for the next completed value from any item. `Ok(None)` once no
    /// work remains. On an item error every sibling is cancelled and the
    /// error is returned; the multiplexer is finished afterwards.
    pub async fn next(&mut self) -> anyhow::Result<Option<(WorkId, T)>> {
        if self.finished {
            return Ok(None);
        }
        while self.live > 0 {
            // We hold a sender ourselves, so recv() cannot return None here.
            match self.rx.recv().await {
                Some(Event::Value(id, value)) => return Ok(Some((id, value))),
                Some(Event::Retired(_)) => self.live -= 1,
                Some(Event::Failed(id, e)) => {
                    self.finished = true;
                    self.live = 0;
                    self.cancel.cancel();
                    return Err(e.context(format!("multiplexed work {:?} failed", id)));
                }
                None => break,
            }
        }
        self.finished = true;
        Ok(None)
    }

    /// Number of items still running.
    pub fn pending(&self) -> usize {
        self.live
    }
}

impl<T: Send + 'static> Default for Multiplexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Multiplexer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "mux_test.rs"]
mod mux_test;
