use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Read pass-through that copies every byte it delivers into a sink, so a
/// stream can be persisted while it is being consumed. Bytes reach the sink
/// no later than the read after the one that delivered them.
pub struct TeeReader<R, W> {
    reader: R,
    writer: W,
    pending: BytesMut,
}

impl<R, W> TeeReader<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        // Finish saving what earlier reads delivered before reading more.
        while !this.pending.is_empty() {
            let n = ready!(Pin::new(&mut this.writer).poll_write(cx, &this.pending))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "tee sink closed",
                )));
            }
            this.pending.advance(n);
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;
        let delivered = &buf.filled()[before..];
        if !delivered.is_empty() {
            this.pending.extend_from_slice(delivered);
            // Opportunistic write; anything left is drained on the next read.
            while !this.pending.is_empty() {
                match Pin::new(&mut this.writer).poll_write(cx, &this.pending) {
                    Poll::Ready(Ok(n)) if n > 0 => this.pending.advance(n),
                    _ => break,
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn saves_everything_it_delivers() -> anyhow::Result<()> {
        let data: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        let mut tee = TeeReader::new(Cursor::new(data.clone()), Cursor::new(Vec::new()));

        let mut delivered = Vec::new();
        tee.read_to_end(&mut delivered).await?;
        assert_eq!(delivered, data);

        let (_, writer) = tee.into_inner();
        assert_eq!(writer.into_inner(), data);
        Ok(())
    }
}
