//! Structured metadata recovered from the transcoder's diagnostic stream.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

static FPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*fps\b").unwrap());
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2})\.(\d{1,3})").unwrap());

/// What the transcoder has reported about its input so far. Both fields stay
/// `None` until the matching token shows up in the diagnostic text.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TranscodeMetadata {
    /// Source frame rate in frames per second.
    pub fps: Option<f64>,
    /// Source duration.
    pub duration: Option<Duration>,
}

impl TranscodeMetadata {
    /// Scans one diagnostic line for metadata tokens. The first occurrence
    /// of each token wins.
    pub fn scan_line(&mut self, line: &str) {
        if self.fps.is_none() {
            if let Some(fps) = parse_fps(line) {
                log::debug!("transcoder reports {} fps", fps);
                self.fps = Some(fps);
            }
        }
        if self.duration.is_none() {
            if let Some(duration) = parse_duration(line) {
                log::debug!("transcoder reports duration {:?}", duration);
                self.duration = Some(duration);
            }
        }
    }
}

/// Extracts a floating-point "N fps" token.
pub fn parse_fps(line: &str) -> Option<f64> {
    let caps = FPS_RE.captures(line)?;
    caps[1].parse().ok()
}

/// Extracts a `Duration: HH:MM:SS.cc` token.
pub fn parse_duration(line: &str) -> Option<Duration> {
    let caps = DURATION_RE.captures(line)?;
    let hours: u64 = caps[1].parse().ok()?;
    let minutes: u64 = caps[2].parse().ok()?;
    let seconds: u64 = caps[3].parse().ok()?;
    let frac = &caps[4];
    let millis: u64 = frac.parse::<u64>().ok()? * 10u64.pow(3 - frac.len() as u32);
    Some(Duration::from_millis(
        ((hours * 60 + minutes) * 60 + seconds) * 1000 + millis,
    ))
}

/// Reads one line, capped at `limit` bytes. A line exceeding the cap is
/// returned as a raw partial read (the remainder surfaces as further
/// partial lines) instead of failing. `None` at end of stream. Both `\n`
/// and `\r` terminate a line, since transcoders rewrite progress lines
/// with bare carriage returns.
pub(crate) async fn read_line_capped<R>(
    reader: &mut R,
    limit: usize,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                (true, 0)
            } else {
                let room = limit - collected.len();
                match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                    Some(at) if at <= room => {
                        collected.extend_from_slice(&available[..at]);
                        (true, at + 1)
                    }
                    // Line exceeds the cap: raw partial read, the remainder
                    // surfaces as further lines.
                    _ if available.len() >= room => {
                        collected.extend_from_slice(&available[..room]);
                        (true, room)
                    }
                    _ => {
                        collected.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            }
        };
        reader.consume(used);
        if done {
            if collected.is_empty() && used == 0 {
                return Ok(None);
            }
            return Ok(Some(String::from_utf8_lossy(&collected).into_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_fps_token() {
        let line = "  Stream #0:0(und): Video: h264, yuv420p, 1280x720, 29.97 fps, 30 tbr";
        assert_eq!(parse_fps(line), Some(29.97));
        assert_eq!(parse_fps("frame=  120 q=2.0"), None);
    }

    #[test]
    fn parses_duration_token() {
        let line = "  Duration: 00:01:02.28, start: 0.000000, bitrate: 1287 kb/s";
        assert_eq!(parse_duration(line), Some(Duration::from_millis(62_280)));
        assert_eq!(parse_duration("Duration: N/A"), None);
    }

    #[test]
    fn first_token_wins() {
        let mut meta = TranscodeMetadata::default();
        meta.scan_line("10 fps");
        meta.scan_line("20 fps");
        assert_eq!(meta.fps, Some(10.0));
    }

    #[tokio::test]
    async fn caps_overlong_lines() -> anyhow::Result<()> {
        let mut data = vec![b'a'; 100];
        data.extend_from_slice(b"\nshort\n");
        let mut reader = tokio::io::BufReader::new(Cursor::new(data));

        let first = read_line_capped(&mut reader, 64).await?.unwrap();
        assert_eq!(first.len(), 64);
        let rest = read_line_capped(&mut reader, 64).await?.unwrap();
        assert_eq!(rest.len(), 36);
        assert_eq!(read_line_capped(&mut reader, 64).await?.unwrap(), "short");
        assert_eq!(read_line_capped(&mut reader, 64).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn carriage_return_ends_a_line() -> anyhow::Result<()> {
        let mut reader =
            tokio::io::BufReader::new(Cursor::new(b"frame=1\rframe=2\n".to_vec()));
        assert_eq!(
            read_line_capped(&mut reader, 64).await?.unwrap(),
            "frame=1"
        );
        assert_eq!(
            read_line_capped(&mut reader, 64).await?.unwrap(),
            "frame=2"
        );
        Ok(())
    }
}
