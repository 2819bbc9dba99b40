//! Transactional message encoder (§4.1, §5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fcall::{Data, FCall, Msg, Stat, IOHDRSZ, MAX_ERROR_LEN, MAX_FILENAME_LEN,
    MAX_UID_LEN, MAX_VERSION_LEN};
use crate::handler::Flush;
use crate::serialize;

/// Emits framed 9P2000 messages, one complete message at a time, under an
/// exclusive write lock so concurrent senders never interleave bytes.
pub struct Encoder<W> {
    writer: Mutex<W>,
    msize: AtomicU32,
    first_error: StdMutex<Option<std::io::ErrorKind>>,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(writer: W, msize: u32) -> Encoder<W> {
        Encoder {
            writer: Mutex::new(writer),
            msize: AtomicU32::new(msize),
            first_error: StdMutex::new(None),
        }
    }

    pub fn set_msize(&self, msize: u32) {
        self.msize.store(msize, Ordering::Relaxed);
    }

    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    /// The first transport write error seen on this encoder, if any.
    /// Every send after the first error becomes a no-op, per §4.1.
    pub fn first_error(&self) -> Option<std::io::ErrorKind> {
        *self.first_error.lock().unwrap()
    }

    /// Encodes and writes a single message, holding the write lock for
    /// its whole duration.
    pub async fn send(&self, tag: u16, body: FCall) -> Result<()> {
        if self.first_error().is_some() {
            return Ok(());
        }
        let body = sanitize(body)?;
        let mut bytes = Vec::new();
        serialize::write_msg(&mut bytes, &Msg { tag, body })?;
        if bytes.len() > u32::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&bytes).await {
            drop(writer);
            self.note_error(e.kind());
            return Err(Error::Transport(e));
        }
        Ok(())
    }

    /// Writes an `Rread` reply, splitting `data` into as many same-tag
    /// `Rread` messages as the negotiated `msize` requires. Required
    /// because a single message's payload is bounded by `msize - IOHDRSZ`.
    pub async fn send_rread(&self, tag: u16, data: &[u8]) -> Result<()> {
        let chunk_len = (self.msize().saturating_sub(IOHDRSZ)).max(1) as usize;
        if data.is_empty() {
            return self
                .send(tag, FCall::Rread { data: Data(Vec::new()) })
                .await;
        }
        for chunk in data.chunks(chunk_len) {
            self.send(tag, FCall::Rread { data: Data(chunk.to_vec()) })
                .await?;
        }
        Ok(())
    }

    fn note_error(&self, kind: std::io::ErrorKind) {
        let mut first = self.first_error.lock().unwrap();
        if first.is_none() {
            *first = Some(kind);
        }
    }

    /// Flushes the underlying writer. A write error here is swallowed the
    /// same way a send error is: the encoder already latched it.
    pub async fn flush(&self) {
        if self.first_error().is_some() {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.flush().await {
            drop(writer);
            self.note_error(e.kind());
        }
    }
}

/// Truncates the fields the protocol allows a server to silently shorten
/// (version and error text), and rejects the ones it doesn't (filenames
/// inside a stat record).
fn sanitize(body: FCall) -> Result<FCall> {
    Ok(match body {
        FCall::Rversion { msize, mut version } => {
            version.truncate(MAX_VERSION_LEN);
            FCall::Rversion { msize, version }
        }
        FCall::Rerror { mut ename } => {
            ename.truncate(MAX_ERROR_LEN);
            FCall::Rerror { ename }
        }
        FCall::Rstat { stat } => FCall::Rstat { stat: check_stat(stat)? },
        FCall::Twstat { fid, stat } => FCall::Twstat { fid, stat: check_stat(stat)? },
        other => other,
    })
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> Flush for Encoder<W> {
    async fn flush(&self) {
        Encoder::flush(self).await;
    }
}

fn check_stat(stat: Stat) -> Result<Stat> {
    if stat.name.len() > MAX_FILENAME_LEN
        || stat.uid.len() > MAX_UID_LEN
        || stat.gid.len() > MAX_UID_LEN
        || stat.muid.len() > MAX_UID_LEN
    {
        return Err(Error::NameTooLong);
    }
    Ok(stat)
}
