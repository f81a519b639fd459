//! One-shot transcoder invocations: run to completion, capture output,
//! check the exit code.

use std::process::Stdio;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::Error;
use crate::recognise::BoundingBox;

const PROGRAM: &str = "ffmpeg";

/// Runs the transcoder with `args`, optionally feeding `input` on stdin,
/// and returns its stdout. Non-zero exit becomes
/// [`Error::TranscoderFailed`] with the captured diagnostics.
pub async fn run(program: &str, args: &[String], input: Option<Bytes>) -> anyhow::Result<Bytes> {
    log::debug!("transcoder args: {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn transcoder {}", program))?;

    if let Some(data) = input {
        let mut stdin = child.stdin.take().context("transcoder stdin not piped")?;
        // Feed concurrently with the output reads below, or a large input
        // deadlocks against a full stdout pipe.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                log::debug!("transcoder stdin write: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }

    let output = child
        .wait_with_output()
        .await
        .context("wait for transcoder")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        log::info!("transcoder return code {:?}", output.status.code());
        log::info!("{}", stderr);
        return Err(Error::TranscoderFailed {
            status: output.status,
            stderr,
        }
        .into());
    }
    Ok(Bytes::from(output.stdout))
}

/// Extracts frame `frame_num` of `input` as a single JPEG.
pub async fn extract_frame(
    input: &str,
    frame_num: u32,
    extra_filters: &[String],
) -> anyhow::Result<Bytes> {
    let mut filters = vec![format!("select=eq(n\\,{})", frame_num)];
    filters.extend_from_slice(extra_filters);
    let args = vec![
        "-i".to_string(),
        input.to_string(),
        "-vf".to_string(),
        filters.join(","),
        "-vframes".to_string(),
        "1".to_string(),
        "-y".to_string(),
        "-f".to_string(),
        "singlejpeg".to_string(),
        "-".to_string(),
    ];
    run(PROGRAM, &args, None).await
}

/// Draws `boxes` onto a JPEG and writes the result to `output`. With no
/// boxes the image is written through unchanged.
pub async fn draw_boxes(
    image: Bytes,
    output: &str,
    colour: &str,
    boxes: &[BoundingBox],
    thickness: u32,
) -> anyhow::Result<()> {
    if boxes.is_empty() {
        tokio::fs::write(output, &image).await?;
        return Ok(());
    }
    let filters = boxes
        .iter()
        .map(|b| {
            format!(
                "drawbox=x={}:y={}:w={}:h={}:color={}:t={}",
                b.x, b.y, b.w, b.h, colour, thickness
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    let args = vec![
        "-i".to_string(),
        "-".to_string(),
        "-vf".to_string(),
        filters,
        "-y".to_string(),
        "-f".to_string(),
        "singlejpeg".to_string(),
        output.to_string(),
    ];
    run(PROGRAM, &args, Some(image)).await.map(|_| ())
}
