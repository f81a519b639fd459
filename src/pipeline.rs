//! Orchestrates an external transcoder process: feeds it input while
//! concurrently draining its diagnostic stream and splitting its output into
//! image records.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bytes::Bytes;
use futures::{Future, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};

use crate::error::Error;
use crate::metadata::{read_line_capped, TranscodeMetadata};
use crate::mux::{Multiplexer, Work, WorkId};
use crate::split::{FrameSplitter, RecordFormat};

const DEFAULT_PROGRAM: &str = "ffmpeg";
const DEFAULT_READ_CHUNK: usize = 4096;
const DEFAULT_WRITE_CHUNK: usize = 64 * 1024;
const DEFAULT_LINE_LIMIT: usize = 4096;

/// How to invoke the external transcoder. The argument list is a fixed
/// contract: input on stdin, image records on stdout, line-oriented
/// diagnostics on stderr, exit code 0 on success.
#[derive(Clone, Debug)]
pub struct TranscodeConfig {
    pub program: String,
    pub args: Vec<String>,
    pub format: RecordFormat,
    /// Max bytes per read of the process output.
    pub read_chunk: usize,
    /// Bytes per write when feeding the process input.
    pub write_chunk: usize,
    /// Cap on a single diagnostic line; longer lines fall back to raw
    /// partial reads.
    pub line_limit: usize,
}

impl TranscodeConfig {
    pub fn builder() -> TranscodeConfigBuilder {
        TranscodeConfigBuilder::default()
    }
}

pub struct TranscodeConfigBuilder {
    program: String,
    args: Vec<String>,
    format: RecordFormat,
    read_chunk: usize,
    write_chunk: usize,
    line_limit: usize,
}

impl Default for TranscodeConfigBuilder {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            format: RecordFormat::Jpeg,
            read_chunk: DEFAULT_READ_CHUNK,
            write_chunk: DEFAULT_WRITE_CHUNK,
            line_limit: DEFAULT_LINE_LIMIT,
        }
    }
}

impl TranscodeConfigBuilder {
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes;
        self
    }

    pub fn write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = bytes;
        self
    }

    pub fn line_limit(mut self, bytes: usize) -> Self {
        self.line_limit = bytes;
        self
    }

    pub fn build(self) -> TranscodeConfig {
        TranscodeConfig {
            program: self.program,
            args: self.args,
            format: self.format,
            read_chunk: self.read_chunk,
            write_chunk: self.write_chunk,
            line_limit: self.line_limit,
        }
    }
}

/// What the pipeline hands the consumer: decoded image records in stream
/// order, interleaved with the results of any injected tasks as they
/// complete.
#[derive(Debug)]
pub enum PipelineItem<T> {
    Frame(Bytes),
    Task(T),
}

enum Feed<T> {
    InputDone,
    StderrDone,
    Frame(Bytes),
    Task(T),
}

/// Runs the transcoder with three concurrent activities multiplexed
/// together: stdin feeding, stderr draining and stdout record splitting.
/// Only the records (and injected task results) are yielded; the other two
/// run for their side effects. The process is reaped when the orchestration
/// ends on any path, and a non-zero exit surfaces as
/// [`Error::TranscoderFailed`] carrying the captured diagnostics.
pub struct FramePipeline<T> {
    mux: Multiplexer<Feed<T>>,
    child: Option<Child>,
    program: String,
    stderr_text: Arc<Mutex<String>>,
    metadata: Arc<Mutex<TranscodeMetadata>>,
    finished: bool,
}

impl<T: Send + 'static> FramePipeline<T> {
    pub fn spawn<R>(config: TranscodeConfig, input: R) -> anyhow::Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        log::debug!("transcoder args: {} {}", config.program, config.args.join(" "));
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn transcoder {}", config.program))?;

        let stdin = child.stdin.take().context("transcoder stdin not piped")?;
        let stdout = child.stdout.take().context("transcoder stdout not piped")?;
        let stderr = child.stderr.take().context("transcoder stderr not piped")?;

        let stderr_text = Arc::new(Mutex::new(String::new()));
        let metadata = Arc::new(Mutex::new(TranscodeMetadata::default()));

        let mut mux = Multiplexer::new();
        let write_chunk = config.write_chunk;
        mux.push(Work::single(async move {
            feed_stdin(input, stdin, write_chunk).await?;
            Ok(Feed::InputDone)
        }));
        {
            let stderr_text = Arc::clone(&stderr_text);
            let metadata = Arc::clone(&metadata);
            let line_limit = config.line_limit;
            mux.push(Work::single(async move {
                drain_stderr(stderr, line_limit, &stderr_text, &metadata).await?;
                Ok(Feed::StderrDone)
            }));
        }
        let splitter = FrameSplitter::with_chunk_size(stdout, config.format, config.read_chunk);
        mux.push(Work::sequence(
            record_stream(splitter).map(|r| r.map(Feed::Frame)),
        ));

        Ok(Self {
            mux,
            child: Some(child),
            program: config.program,
            stderr_text,
            metadata,
            finished: false,
        })
    }

    /// The next frame or injected-task result, in completion order.
    /// `Ok(None)` once everything is done and the process has exited
    /// successfully.
    pub async fn next(&mut self) -> anyhow::Result<Option<PipelineItem<T>>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.mux.next().await {
                Ok(Some((_, Feed::Frame(frame)))) => {
                    return Ok(Some(PipelineItem::Frame(frame)))
                }
                Ok(Some((_, Feed::Task(value)))) => return Ok(Some(PipelineItem::Task(value))),
                Ok(Some((_, Feed::InputDone))) => {
                    log::debug!("transcoder input fully fed");
                }
                Ok(Some((_, Feed::StderrDone))) => {
                    log::debug!("transcoder diagnostics drained");
                }
                Ok(None) => {
                    self.finished = true;
                    self.check_exit().await?;
                    return Ok(None);
                }
                Err(e) => {
                    self.finished = true;
                    return Err(self.fail(e).await);
                }
            }
        }
    }

    /// Adds a one-shot task whose result is yielded alongside the frames,
    /// without stalling the scan for the next record.
    pub fn inject<F>(&mut self, task: F) -> WorkId
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.mux.push(Work::single(async move { Ok(Feed::Task(task.await?)) }))
    }

    /// Metadata recovered from the diagnostic stream so far.
    pub fn metadata(&self) -> TranscodeMetadata {
        *self.metadata.lock().unwrap()
    }

    /// Everything the process has written to its diagnostic stream so far.
    pub fn diagnostics(&self) -> String {
        self.stderr_text.lock().unwrap().clone()
    }

    async fn check_exit(&mut self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().await.context("wait for transcoder")?;
        if !status.success() {
            let stderr = self.stderr_text.lock().unwrap().clone();
            log::info!("transcoder {} exited with {}", self.program, status);
            log::info!("{}", stderr);
            return Err(Error::TranscoderFailed { status, stderr }.into());
        }
        Ok(())
    }

    /// An activity failed. If the process already exited unsuccessfully on
    /// its own, report that as the root cause; otherwise kill and reap, and
    /// keep the original error.
    async fn fail(&mut self, e: anyhow::Error) -> anyhow::Error {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    let stderr = self.stderr_text.lock().unwrap().clone();
                    log::info!("transcoder {} exited with {}", self.program, status);
                    return Error::TranscoderFailed { status, stderr }.into();
                }
                _ => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        e
    }
}

async fn feed_stdin<R>(mut input: R, mut stdin: ChildStdin, chunk: usize) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        let n = input.read(&mut buf).await.context("read pipeline input")?;
        if n == 0 {
            break;
        }
        match stdin.write_all(&buf[..n]).await {
            Ok(()) => {}
            // The process stopped reading (it may have exited, or needed no
            // more input). Not an error here; the exit status check decides.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log::debug!("transcoder closed its input early");
                return Ok(());
            }
            Err(e) => return Err(e).context("write transcoder input"),
        }
    }
    // Closing the pipe signals end-of-input.
    let _ = stdin.shutdown().await;
    Ok(())
}

async fn drain_stderr(
    stderr: ChildStderr,
    line_limit: usize,
    text: &Mutex<String>,
    metadata: &Mutex<TranscodeMetadata>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stderr);
    while let Some(line) = read_line_capped(&mut reader, line_limit).await? {
        metadata.lock().unwrap().scan_line(&line);
        let mut text = text.lock().unwrap();
        text.push_str(&line);
        text.push('\n');
    }
    Ok(())
}

/// Turns a splitter into a stream of fully assembled records.
fn record_stream<R>(
    splitter: FrameSplitter<R>,
) -> impl futures::Stream<Item = anyhow::Result<Bytes>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::try_unfold(splitter, |mut splitter| async move {
        let frame = match splitter.next_record().await? {
            Some(mut record) => record.read_to_end().await?,
            None => return Ok(None),
        };
        Ok(Some((frame, splitter)))
    })
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
