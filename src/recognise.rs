//! Drives a transcoder pipeline and a caller-supplied recognition backend
//! together: frames are sampled from the clip, and one recognition task is
//! injected per frame so recognition overlaps the scan for the next frame.

use bytes::Bytes;
use futures::{Future, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::pipeline::{FramePipeline, PipelineItem, TranscodeConfig};
use crate::split::RecordFormat;

const DEFAULT_FRAME_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub position: BoundingBox,
}

/// One sampled frame in which the backend found something.
#[derive(Clone, Debug)]
pub struct RecognisedFrame {
    pub frame: Bytes,
    pub objects: Vec<DetectedObject>,
}

/// The recognition backend seam. Consumed here, implemented elsewhere
/// (a vision API client, a local network, ...). `Ok(None)` means the
/// backend saw nothing of interest in the image.
pub trait Recognise: Clone + Send + Sync + 'static {
    fn recognise(
        &self,
        image: Bytes,
    ) -> impl Future<Output = anyhow::Result<Option<Vec<DetectedObject>>>> + Send;
}

/// Samples frames from a video stream and runs each through a recognition
/// backend, yielding hits as they complete.
pub struct VideoRecogniser<C> {
    recogniser: C,
    frame_count: usize,
}

impl<C: Recognise> VideoRecogniser<C> {
    pub fn new(recogniser: C) -> Self {
        Self {
            recogniser,
            frame_count: DEFAULT_FRAME_COUNT,
        }
    }

    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count.max(1);
        self
    }

    /// Given a video stream and its duration, generates recognition results.
    /// Frames and recognitions run concurrently; results arrive in
    /// completion order, not frame order.
    pub fn check_video<R>(
        &self,
        video: R,
        duration_ms: u64,
    ) -> anyhow::Result<impl Stream<Item = anyhow::Result<RecognisedFrame>>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let times = frame_seconds(duration_ms, self.frame_count);
        let config = TranscodeConfig::builder()
            .args(mjpeg_select_args(&times))
            .format(RecordFormat::Jpeg)
            .build();
        let pipeline = FramePipeline::<Option<RecognisedFrame>>::spawn(config, video)?;
        let recogniser = self.recogniser.clone();

        Ok(futures::stream::try_unfold(
            (pipeline, recogniser),
            |(mut pipeline, recogniser)| async move {
                loop {
                    match pipeline.next().await? {
                        Some(PipelineItem::Frame(frame)) => {
                            let backend = recogniser.clone();
                            pipeline.inject(async move {
                                let objects = backend.recognise(frame.clone()).await?;
                                Ok(objects.map(|objects| RecognisedFrame { frame, objects }))
                            });
                        }
                        Some(PipelineItem::Task(Some(hit))) => {
                            return Ok(Some((hit, (pipeline, recogniser))))
                        }
                        Some(PipelineItem::Task(None)) => {}
                        None => return Ok(None),
                    }
                }
            },
        ))
    }
}

/// Picks the instants to sample: the first frame just after the start, the
/// last one just before the end (when three or more frames are wanted), and
/// the rest evenly spaced in between.
fn frame_seconds(duration_ms: u64, frame_count: usize) -> Vec<f64> {
    let mut times = vec![0.1];
    let add_end_frame = frame_count >= 3;
    let middle = frame_count.saturating_sub(if add_end_frame { 2 } else { 1 });
    let gap = duration_ms as f64 / (middle as f64 + 1.0) / 1000.0;
    for n in 1..=middle {
        times.push(n as f64 * gap);
    }
    if add_end_frame {
        times.push((duration_ms as f64 / 1000.0 - 0.1).max(0.0));
    }
    times
}

/// Transcoder arguments selecting the frame at each instant, as a JPEG
/// stream on stdout. `-vsync vfr`, or duplicate frames are produced to fill
/// the gaps between selected frames.
fn mjpeg_select_args(frame_seconds: &[f64]) -> Vec<String> {
    let select = frame_seconds
        .iter()
        .map(|t| format!("gte(t\\,{t:.3})*lt(prev_pts*TB\\,{t:.3})"))
        .collect::<Vec<_>>()
        .join("+");
    vec![
        "-i".to_string(),
        "-".to_string(),
        "-vsync".to_string(),
        "vfr".to_string(),
        "-vf".to_string(),
        format!("select={}", select),
        "-f".to_string(),
        "mjpeg".to_string(),
        "-".to_string(),
    ]
}
