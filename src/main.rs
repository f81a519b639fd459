//! Demo: transcode a video (file or stdin) to JPEG frames on disk.
//!
//! Usage: frame-pipe [input|-] [output-dir]

use anyhow::Context as _;
use tokio::io::AsyncRead;

use frame_pipe::pipeline::{FramePipeline, PipelineItem, TranscodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "-".to_string());
    let out_dir = args.next().unwrap_or_else(|| "frames".to_string());
    std::fs::create_dir_all(&out_dir)?;

    let reader: Box<dyn AsyncRead + Unpin + Send> = if input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("open {}", input))?,
        )
    };

    let config = TranscodeConfig::builder()
        .args(["-i", "-", "-an", "-f", "mjpeg", "-"])
        .build();
    let mut pipeline = FramePipeline::<()>::spawn(config, reader)?;

    let mut count = 0u32;
    loop {
        let item = tokio::select! {
            item = pipeline.next() => item?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
        };
        match item {
            Some(PipelineItem::Frame(frame)) => {
                count += 1;
                let path = format!("{}/frame_{:05}.jpg", out_dir, count);
                tokio::fs::write(&path, &frame).await?;
                log::debug!("wrote {} ({} bytes)", path, frame.len());
            }
            Some(PipelineItem::Task(())) => {}
            None => break,
        }
    }

    let meta = pipeline.metadata();
    log::info!(
        "wrote {} frames to {} (source: {:?} fps, {:?})",
        count,
        out_dir,
        meta.fps,
        meta.duration
    );
    Ok(())
}
