//! Bridges a blocking, thread-bound decode loop with an asynchronous
//! consumer, pacing decoding to the source frame rate and handing over at
//! most one frame at a time.
//!
//! Incoming bytes are streamed into a file inside a scoped temp directory;
//! the decoder reads that file from a worker thread as it grows. Known
//! accepted limitation: if frames are decoded and consumed faster than bytes
//! can be written, the decoder may read a frame boundary mid-write and
//! produce a corrupted frame. This trade-off is inherited deliberately;
//! callers needing perfect frame integrity must buffer the whole input
//! first.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::Stream;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WRITE_CHUNK: usize = 64 * 1024;

/// The blocking decode primitive supplied by the video decoding
/// collaborator. `read_frame` returning `Ok(None)` means "no frame available
/// right now"; the limiter decides whether that is transient starvation or
/// the genuine end by checking whether the byte writer has finished.
pub trait BlockingDecoder: Send + 'static {
    type Frame: Send + 'static;

    /// Source frame rate in frames per second; non-positive disables pacing.
    fn frame_rate(&self) -> f64;

    fn read_frame(&mut self) -> anyhow::Result<Option<Self::Frame>>;
}

/// Single-element handoff cell. The decode thread overwrites
/// unconditionally; a frame not yet consumed when the next arrives is
/// permanently dropped. This is how load is shed under real-time pressure
/// instead of accumulating backlog.
struct FrameSlot<F> {
    state: Mutex<SlotState<F>>,
    notify: Notify,
}

struct SlotState<F> {
    frame: Option<F>,
    done: bool,
    failed: Option<anyhow::Error>,
}

impl<F> FrameSlot<F> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                done: false,
                failed: None,
            }),
            notify: Notify::new(),
        }
    }

    fn publish(&self, frame: F) {
        self.state.lock().unwrap().frame = Some(frame);
        self.notify.notify_one();
    }

    fn finish(&self) {
        self.state.lock().unwrap().done = true;
        self.notify.notify_one();
    }

    fn fail(&self, e: anyhow::Error) {
        let mut state = self.state.lock().unwrap();
        state.failed = Some(e);
        state.done = true;
        drop(state);
        self.notify.notify_one();
    }
}

/// Write-side progress shared between the async byte writer and the blocking
/// decode thread. A monotonic write counter avoids the lost-wakeup race of a
/// plain event flag.
struct WriteProgress {
    state: Mutex<(u64, bool)>,
    cond: Condvar,
}

impl WriteProgress {
    fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cond: Condvar::new(),
        }
    }

    fn note_write(&self) {
        self.state.lock().unwrap().0 += 1;
        self.cond.notify_all();
    }

    fn complete(&self) {
        self.state.lock().unwrap().1 = true;
        self.cond.notify_all();
    }

    fn snapshot(&self) -> (u64, bool) {
        *self.state.lock().unwrap()
    }

    /// Blocks until the write counter moves past `seen` or the writer
    /// completes.
    fn wait_past(&self, seen: u64) -> (u64, bool) {
        let mut state = self.state.lock().unwrap();
        while state.0 == seen && !state.1 {
            state = self.cond.wait(state).unwrap();
        }
        *state
    }
}

/// Real-time-paced sequence of decoded frames. The consumer only ever sees
/// the most recently decoded frame, and decoding paces itself to the source
/// frame rate rather than racing ahead of real time.
pub struct RealtimeFrames<D: BlockingDecoder> {
    slot: Arc<FrameSlot<D::Frame>>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<anyhow::Result<()>>>,
    decoder: Option<JoinHandle<()>>,
    finished: bool,
    // Removed with everything in it when the sequence is dropped, on every
    // exit path.
    _workdir: TempDir,
}

impl<D: BlockingDecoder> RealtimeFrames<D> {
    /// Starts the byte writer and the decode worker. `open` is called on the
    /// worker thread once the first bytes have been written.
    pub fn spawn<R, F>(input: R, open: F) -> anyhow::Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnOnce(&Path) -> anyhow::Result<D> + Send + 'static,
    {
        let workdir = tempfile::tempdir().context("create decode workdir")?;
        let path = workdir.path().join("vid_pipe");

        let slot = Arc::new(FrameSlot::new());
        let progress = Arc::new(WriteProgress::new());
        let cancel = CancellationToken::new();

        let writer = {
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let result = write_bytes(input, &path, &progress, &cancel).await;
                // Always wake the decode thread, even on a failed write.
                progress.complete();
                result
            })
        };

        let decoder = {
            let slot = Arc::clone(&slot);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                match decode_loop(open, &path, &slot, &progress, &cancel) {
                    Ok(()) => slot.finish(),
                    Err(e) => slot.fail(e),
                }
            })
        };

        Ok(Self {
            slot,
            cancel,
            writer: Some(writer),
            decoder: Some(decoder),
            finished: false,
            _workdir: workdir,
        })
    }

    /// Waits for the next decoded frame. `Ok(None)` once the source is
    /// exhausted; frames overwritten before this is called are not seen.
    pub async fn next_frame(&mut self) -> anyhow::Result<Option<D::Frame>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let notified = self.slot.notify.notified();
            {
                let mut state = self.slot.state.lock().unwrap();
                if let Some(e) = state.failed.take() {
                    self.finished = true;
                    return Err(e);
                }
                if let Some(frame) = state.frame.take() {
                    return Ok(Some(frame));
                }
                if state.done {
                    break;
                }
            }
            notified.await;
        }
        self.finished = true;
        // Surface writer failures; a decode thread panic aborts the join.
        if let Some(writer) = self.writer.take() {
            writer.await.context("byte writer panicked")??;
        }
        if let Some(decoder) = self.decoder.take() {
            decoder.await.context("decode worker panicked")?;
        }
        Ok(None)
    }

    /// Consumes the sequence as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = anyhow::Result<D::Frame>> {
        futures::stream::try_unfold(self, |mut frames| async move {
            Ok(frames.next_frame().await?.map(|f| (f, frames)))
        })
    }
}

impl<D: BlockingDecoder> Drop for RealtimeFrames<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_bytes<R>(
    mut input: R,
    path: &Path,
    progress: &WriteProgress,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .context("create decode handoff file")?;
    let mut buf = vec![0u8; WRITE_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = input.read(&mut buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }
        file.write_all(&buf[..n]).await?;
        file.sync_data().await?;
        progress.note_write();
    }
}

fn decode_loop<D, F>(
    open: F,
    path: &Path,
    slot: &FrameSlot<D::Frame>,
    progress: &WriteProgress,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    D: BlockingDecoder,
    F: FnOnce(&Path) -> anyhow::Result<D>,
{
    // Do not open the decoder until there is data on disk.
    let (writes, complete) = progress.wait_past(0);
    if writes == 0 && complete {
        return Ok(());
    }

    let mut decoder = open(path)?;
    let fps = decoder.frame_rate();
    let gap = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));

    let started = Instant::now();
    let mut last_publish: Option<Instant> = None;
    let mut decoded = 0u64;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match decoder.read_frame()? {
            Some(frame) => {
                // Align with the source frame rate, measured from the last
                // publish; the first frame goes out immediately.
                if let (Some(gap), Some(last)) = (gap, last_publish) {
                    let elapsed = last.elapsed();
                    if elapsed < gap {
                        std::thread::sleep(gap - elapsed);
                    }
                }
                slot.publish(frame);
                last_publish = Some(Instant::now());
                decoded += 1;
            }
            None => {
                // Out of frames. If the writer is still going this is
                // transient starvation, not end-of-stream: wait for more
                // bytes and try again.
                let (writes, complete) = progress.snapshot();
                if complete {
                    break;
                }
                progress.wait_past(writes);
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        log::debug!("effective frame rate: {:.2}", decoded as f64 / elapsed);
    }
    Ok(())
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod realtime_test;
