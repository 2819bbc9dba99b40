//! The file I/O object interface (§6) and adapters that promote ordinary
//! reader/writer/seeker types up to it.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::fcall::Stat;
use crate::utils::Result;

/// A directory entry yielded by [`File::readdir`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub stat: Stat,
    /// Byte offset of the entry *after* this one, for the next `readdir`
    /// call to resume from (mirrors the protocol's directory-read-by-offset
    /// model).
    pub offset: u64,
}

/// The capability an open fid exposes to the session (§6).
///
/// `stat`, `readdir`, and `set_deadline` are optional: a plain file need
/// not implement directory listing, and a handler with no notion of
/// per-request deadlines can ignore `set_deadline` entirely (its default
/// is a no-op).
#[async_trait]
pub trait File: Send + Sync {
    async fn read_at(&self, offset: u64, count: u32) -> Result<Vec<u8>>;
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32>;
    async fn close(&self) -> Result<()>;

    async fn stat(&self) -> Option<Result<Stat>> {
        None
    }

    async fn readdir(&self, _offset: u64, _count: u32) -> Option<Result<Vec<DirEntry>>> {
        None
    }

    /// Best-effort deadline hint for an in-flight read, used to honor
    /// cancellation (§5). The default is a no-op: an adapter that can't
    /// interrupt its underlying I/O simply runs to completion.
    async fn set_deadline(&self, _at: Option<std::time::Instant>) {}
}

/// Promotes any `AsyncRead + AsyncSeek` type to [`File`], serializing
/// positional access through a mutex since a single fid may be read from
/// concurrently by more than one in-flight request.
pub struct SeekReader<T> {
    inner: Mutex<T>,
}

impl<T> SeekReader<T> {
    pub fn new(inner: T) -> SeekReader<T> {
        SeekReader { inner: Mutex::new(inner) }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin> File for SeekReader<T> {
    async fn read_at(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        inner.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; count as usize];
        let n = read_up_to(&mut *inner, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(crate::error::Error::protocol("file is read-only"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Promotes any `AsyncRead + AsyncWrite + AsyncSeek` type (a regular
/// on-disk file, for instance) to [`File`].
pub struct SeekFile<T> {
    inner: Mutex<T>,
}

impl<T> SeekFile<T> {
    pub fn new(inner: T) -> SeekFile<T> {
        SeekFile { inner: Mutex::new(inner) }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Sync + Unpin> File for SeekFile<T> {
    async fn read_at(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        inner.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; count as usize];
        let n = read_up_to(&mut *inner, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        inner.seek(std::io::SeekFrom::Start(offset)).await?;
        inner.write_all(data).await?;
        Ok(data.len() as u32)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.flush().await?;
        Ok(())
    }
}

/// Promotes a plain `AsyncRead + AsyncWrite` stream (no seeking) to
/// [`File`]. Used for the auth fid, which is backed by one end of a
/// `tokio::io::duplex` pipe handed to the [`crate::handler::AuthPolicy`]
/// coroutine — offset is ignored, reads and writes are purely sequential.
pub struct DuplexFile<T> {
    inner: Mutex<T>,
}

impl<T> DuplexFile<T> {
    pub fn new(inner: T) -> DuplexFile<T> {
        DuplexFile { inner: Mutex::new(inner) }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> File for DuplexFile<T> {
    async fn read_at(&self, _offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let mut buf = vec![0u8; count as usize];
        let n = inner.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_at(&self, _offset: u64, data: &[u8]) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        inner.write_all(data).await?;
        Ok(data.len() as u32)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.shutdown().await?;
        Ok(())
    }
}

async fn read_up_to<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
