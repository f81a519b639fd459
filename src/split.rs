use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// JPEG start-of-image marker.
pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

const BMP_MAGIC: [u8; 2] = [b'B', b'M'];
/// Magic plus the little-endian u32 declared size.
const BMP_HEADER_LEN: usize = 6;

const DEFAULT_CHUNK_SIZE: usize = 4096;

/// How consecutive image records are delimited inside the byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordFormat {
    /// Marker-delimited: records run from `FF D8` to `FF D9`, matched
    /// literally with no escaping. A final record truncated by upstream EOF
    /// is yielded as-is.
    Jpeg,
    /// Length-prefixed: `B M` magic, then a little-endian u32 giving the
    /// total record size including the six header bytes. A truncated
    /// trailing record is dropped.
    Bmp,
}

/// Splits an undifferentiated byte stream into consecutive self-contained
/// image records, handling markers and payloads that straddle read-chunk
/// boundaries via a carry-over buffer.
///
/// The stream is linear, so only one record can be open at a time: each
/// [`Record`] mutably borrows the splitter until it is dropped. Dropping a
/// JPEG record half-drained skips ahead to the next start marker; a BMP
/// record's unread remainder is discarded on drop.
#[derive(Debug)]
pub struct FrameSplitter<R> {
    reader: R,
    format: RecordFormat,
    chunk_size: usize,
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameSplitter<R> {
    pub fn new(reader: R, format: RecordFormat) -> Self {
        Self::with_chunk_size(reader, format, DEFAULT_CHUNK_SIZE)
    }

    /// `chunk_size` caps how many bytes a single upstream read may return.
    pub fn with_chunk_size(reader: R, format: RecordFormat, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            reader,
            format,
            chunk_size,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    /// Finds the next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> anyhow::Result<Option<Record<'_, R>>> {
        let state = match self.format {
            RecordFormat::Jpeg => {
                if !self.seek_start().await? {
                    return Ok(None);
                }
                RecordState::Jpeg { done: false }
            }
            RecordFormat::Bmp => match self.buffer_sized_record().await? {
                Some(len) => RecordState::Bmp { remaining: len },
                None => return Ok(None),
            },
        };
        Ok(Some(Record {
            splitter: self,
            state,
        }))
    }

    /// Reads up to `chunk_size` more bytes into the carry-over buffer.
    /// `false` on upstream end-of-stream.
    async fn fill(&mut self) -> anyhow::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = vec![0u8; self.chunk_size];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    /// Discards bytes until the buffer begins with the JPEG start marker.
    /// A trailing lone `FF` may be the first half of the marker, so it is
    /// retained across the next read rather than discarded.
    async fn seek_start(&mut self) -> anyhow::Result<bool> {
        loop {
            if let Some(at) = find(&self.buf, &JPEG_START) {
                self.buf.advance(at);
                return Ok(true);
            }
            if self.buf.last() == Some(&0xFF) {
                let tail = self.buf.split_off(self.buf.len() - 1);
                self.buf = tail;
            } else {
                self.buf.clear();
            }
            if !self.fill().await? {
                return Ok(false);
            }
        }
    }

    /// Reads the length-prefixed header and accumulates the full declared
    /// size into the buffer. `None` if the stream ends first (a truncated
    /// trailing record is simply dropped, not an error).
    async fn buffer_sized_record(&mut self) -> anyhow::Result<Option<usize>> {
        while self.buf.len() < BMP_HEADER_LEN {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        if self.buf[..2] != BMP_MAGIC {
            return Err(Error::MalformedStream(format!(
                "bad record magic {:02x} {:02x}",
                self.buf[0], self.buf[1]
            ))
            .into());
        }
        let declared =
            u32::from_le_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if declared < BMP_HEADER_LEN {
            return Err(Error::MalformedStream(format!(
                "declared record size {} smaller than its header",
                declared
            ))
            .into());
        }
        while self.buf.len() < declared {
            if !self.fill().await? {
                self.buf.clear();
                return Ok(None);
            }
        }
        Ok(Some(declared))
    }
}

#[derive(Debug)]
enum RecordState {
    Jpeg { done: bool },
    Bmp { remaining: usize },
}

/// One self-contained image, drained as a finite ordered sequence of byte
/// chunks. Holds the splitter's carry-over buffer exclusively while open.
#[derive(Debug)]
pub struct Record<'a, R> {
    splitter: &'a mut FrameSplitter<R>,
    state: RecordState,
}

impl<R: AsyncRead + Unpin> Record<'_, R> {
    /// The next chunk of this record, or `None` once it is complete.
    pub async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        match &mut self.state {
            RecordState::Jpeg { done } => {
                if *done {
                    return Ok(None);
                }
                loop {
                    let buf = &mut self.splitter.buf;
                    if let Some(at) = find(buf, &JPEG_END) {
                        *done = true;
                        // Remainder stays buffered; it may start the next record.
                        return Ok(Some(buf.split_to(at + JPEG_END.len()).freeze()));
                    }
                    // No end marker yet. Hand out what has been scanned, but
                    // hold back a trailing lone FF: it may be the first byte
                    // of the end marker arriving in the next chunk.
                    let deliver = match buf.last() {
                        Some(&0xFF) => buf.len() - 1,
                        _ => buf.len(),
                    };
                    if deliver > 0 {
                        return Ok(Some(buf.split_to(deliver).freeze()));
                    }
                    if !self.splitter.fill().await? {
                        // Upstream ended mid-record; the producer may
                        // legitimately stop mid-frame. Yield what is left.
                        *done = true;
                        let buf = &mut self.splitter.buf;
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let len = buf.len();
                        return Ok(Some(buf.split_to(len).freeze()));
                    }
                }
            }
            RecordState::Bmp { remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                // The whole record was buffered up front, so this never reads.
                let take = (*remaining).min(self.splitter.chunk_size);
                *remaining -= take;
                Ok(Some(self.splitter.buf.split_to(take).freeze()))
            }
        }
    }

    /// Concatenates the remaining chunks into one buffer.
    pub async fn read_to_end(&mut self) -> anyhow::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

impl<R> Drop for Record<'_, R> {
    fn drop(&mut self) {
        // An abandoned sized record must not leave its payload to be
        // misread as the next record's header.
        if let RecordState::Bmp { remaining } = self.state {
            let skip = remaining.min(self.splitter.buf.len());
            self.splitter.buf.advance(skip);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
#[path = "split_test.rs"]
mod split_test;
