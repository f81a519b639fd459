use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;

use super::{BlockingDecoder, RealtimeFrames};

/// Stand-in for a native decoder: produces `total` numbered frames, ignoring
/// the handoff file contents.
struct CountingDecoder {
    next: u32,
    total: u32,
    fps: f64,
}

impl BlockingDecoder for CountingDecoder {
    type Frame = u32;

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn read_frame(&mut self) -> anyhow::Result<Option<u32>> {
        if self.next >= self.total {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(self.next))
    }
}

fn assert_monotonic(frames: &[u32]) {
    assert!(
        frames.windows(2).all(|w| w[0] < w[1]),
        "frames reordered or duplicated: {:?}",
        frames
    );
}

#[tokio::test]
async fn paces_decoding_to_the_frame_rate() -> anyhow::Result<()> {
    let handoff_path: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
    let seen_path = Arc::clone(&handoff_path);

    let mut frames = RealtimeFrames::spawn(Cursor::new(vec![0u8; 256]), move |path: &Path| {
        assert!(path.exists(), "decoder opened before any bytes written");
        *seen_path.lock().unwrap() = Some(path.to_path_buf());
        Ok(CountingDecoder {
            next: 0,
            total: 5,
            fps: 100.0,
        })
    })?;

    let started = Instant::now();
    let mut seen = Vec::new();
    while let Some(frame) = frames.next_frame().await? {
        seen.push(frame);
    }

    assert!(seen.len() <= 5);
    assert_eq!(seen.last(), Some(&5));
    assert_monotonic(&seen);
    // Four inter-frame gaps of 10ms each, minus scheduling slack.
    assert!(
        started.elapsed() >= Duration::from_millis(35),
        "decoded faster than real time: {:?}",
        started.elapsed()
    );

    // The handoff file lives in a scoped directory, gone with the sequence.
    let path = handoff_path.lock().unwrap().clone().unwrap();
    drop(frames);
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn slow_consumer_sees_a_monotonic_subsequence() -> anyhow::Result<()> {
    // No pacing: the decoder floods the slot and overwrites freely.
    let mut frames = RealtimeFrames::spawn(Cursor::new(vec![0u8; 64]), |_: &Path| {
        Ok(CountingDecoder {
            next: 0,
            total: 10,
            fps: 0.0,
        })
    })?;

    let mut seen = Vec::new();
    while let Some(frame) = frames.next_frame().await? {
        seen.push(frame);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!seen.is_empty());
    assert!(seen.len() <= 10);
    assert_monotonic(&seen);
    // The final frame is never overwritten, so it is always observed.
    assert_eq!(seen.last(), Some(&10));
    Ok(())
}

/// Running out of buffered bytes while the writer is still going is
/// transient starvation, not end-of-stream.
#[tokio::test]
async fn starved_decoder_waits_for_more_bytes() -> anyhow::Result<()> {
    struct StarveDecoder {
        calls: Arc<Mutex<u32>>,
    }

    impl BlockingDecoder for StarveDecoder {
        type Frame = u32;

        fn frame_rate(&self) -> f64 {
            0.0
        }

        fn read_frame(&mut self) -> anyhow::Result<Option<u32>> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            // First read finds no complete frame yet; the frame appears once
            // more bytes have arrived.
            if *calls == 2 {
                Ok(Some(1))
            } else {
                Ok(None)
            }
        }
    }

    let calls = Arc::new(Mutex::new(0u32));
    let decoder_calls = Arc::clone(&calls);

    let (mut feed, source) = tokio::io::duplex(64);
    let mut frames = RealtimeFrames::spawn(source, move |_: &Path| {
        Ok(StarveDecoder {
            calls: decoder_calls,
        })
    })?;

    tokio::spawn(async move {
        feed.write_all(b"first half").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        feed.write_all(b"second half").await.unwrap();
        // Dropping the feed ends the stream.
    });

    let mut seen = Vec::new();
    while let Some(frame) = frames.next_frame().await? {
        seen.push(frame);
    }
    assert_eq!(seen, vec![1]);
    assert!(*calls.lock().unwrap() >= 3, "decoder never re-polled after starving");
    Ok(())
}

#[tokio::test]
async fn empty_input_ends_without_opening_the_decoder() -> anyhow::Result<()> {
    let mut frames = RealtimeFrames::<CountingDecoder>::spawn(
        Cursor::new(Vec::<u8>::new()),
        |_: &Path| -> anyhow::Result<CountingDecoder> { anyhow::bail!("must not open") },
    )?;
    assert!(frames.next_frame().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn decode_errors_surface_to_the_consumer() {
    struct FailingDecoder;

    impl BlockingDecoder for FailingDecoder {
        type Frame = u32;

        fn frame_rate(&self) -> f64 {
            25.0
        }

        fn read_frame(&mut self) -> anyhow::Result<Option<u32>> {
            anyhow::bail!("decode failed")
        }
    }

    let mut frames =
        RealtimeFrames::spawn(Cursor::new(vec![0u8; 16]), |_: &Path| Ok(FailingDecoder))
            .expect("spawn");
    let err = frames.next_frame().await.expect_err("decode error");
    assert!(format!("{:#}", err).contains("decode failed"));
}

#[tokio::test]
async fn stream_adapter_yields_the_same_frames() -> anyhow::Result<()> {
    use futures::TryStreamExt;

    let frames = RealtimeFrames::spawn(Cursor::new(vec![0u8; 32]), |_: &Path| {
        Ok(CountingDecoder {
            next: 0,
            total: 3,
            fps: 0.0,
        })
    })?;
    let seen: Vec<u32> = frames.into_stream().try_collect().await?;
    assert!(!seen.is_empty());
    assert_monotonic(&seen);
    assert_eq!(seen.last(), Some(&3));
    Ok(())
}
