//! Session engine (§4.5): the state of one attachment to the file tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{string, Error, Result};
use crate::fcall::{FCall, Qid, QidType, Stat};
use crate::file::File;
use crate::idpool::IdPool;
use crate::qidpool::QidPool;
use crate::utils::join;
use crate::walk::Walker;
use crate::wstat::{self, SubRequest};

/// A fid's binding: the path it resolves to, and the I/O object it owns
/// once opened (`None` for a fid that has only been walked to).
#[derive(Clone)]
struct FidEntry {
    path: String,
    file: Option<Arc<dyn File>>,
    is_auth: bool,
    /// The qid type bits last reported for this fid's path, kept current
    /// by `twalk`/`topen`/`tcreate` so `Tcreate`'s directory-fid check
    /// (§4.5) doesn't depend on the qid pool having an entry for the path.
    qtype: QidType,
}

/// What the session asks the user handler to do. Distinct from the wire
/// `FCall` because walk and wstat synthesize sub-requests that never
/// appear on the wire verbatim (§4.6, §4.7).
pub enum SessionRequest {
    Walk { path: String },
    Open { path: String, mode: u8 },
    Create { path: String, name: String, perm: u32, mode: u8 },
    Read { file: Arc<dyn File>, offset: u64, count: u32 },
    Write { file: Arc<dyn File>, offset: u64, data: Vec<u8> },
    Stat { path: String, file: Option<Arc<dyn File>> },
    Wstat { path: String, sub: SubRequest },
    Remove { path: String },
}

pub enum SessionReply {
    Walk(Option<Qid>),
    Open { file: Arc<dyn File>, qid: Qid },
    Create { file: Arc<dyn File>, qid: Qid },
    Read(Vec<u8>),
    Write(u32),
    Stat(Stat),
    Wstat(std::result::Result<(), String>),
    Remove(std::result::Result<(), String>),
    Error(String),
}

/// A structured request delivered to the user handler, with a one-shot
/// channel for the answer (§4.8).
///
/// `reply` takes `&self` rather than `self` so the façade can hold onto
/// a request across several `next()` calls (middleware may overwrite it
/// and answer later) while still being able to check whether it was
/// ever answered.
pub struct Request {
    pub body: SessionRequest,
    reply: std::sync::Mutex<Option<oneshot::Sender<SessionReply>>>,
}

impl Request {
    pub fn new(body: SessionRequest, reply: oneshot::Sender<SessionReply>) -> Request {
        Request { body, reply: std::sync::Mutex::new(Some(reply)) }
    }

    /// Sends `reply` if this request hasn't been answered yet; a second
    /// call is a silent no-op.
    pub fn reply(&self, reply: SessionReply) {
        if let Some(tx) = self.reply.lock().unwrap().take() {
            let _ = tx.send(reply);
        }
    }

    pub fn answered(&self) -> bool {
        self.reply.lock().unwrap().is_none()
    }
}

/// One authenticated attachment. Owns the fid table and delivers
/// structured requests to the handler's request channel.
pub struct Session {
    qids: Arc<QidPool>,
    fids: RwLock<HashMap<u32, FidEntry>>,
    ref_count: Arc<AtomicUsize>,
    request_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
    /// Set once by the `AuthPolicy` coroutine started on `Tauth`; `Tattach`
    /// waits on it before admitting the afid (§4.4, data model "Session").
    auth_result: std::sync::Mutex<Option<std::result::Result<(), String>>>,
    auth_done: tokio::sync::Notify,
    /// Mints per-walk trace ids (§4.3, Design Notes "identifier pool");
    /// shared with the owning connection's diagnostic id pool.
    walk_ids: Arc<IdPool>,
    /// This session's own diagnostic id, released back to `walk_ids` when
    /// the session is dropped.
    diag_id: u32,
}

impl Session {
    pub fn new(
        qids: Arc<QidPool>,
        root_fid: u32,
        request_tx: mpsc::Sender<Request>,
        cancel: CancellationToken,
        id_pool: Arc<IdPool>,
        diag_id: u32,
    ) -> Session {
        let mut fids = HashMap::new();
        fids.insert(
            root_fid,
            FidEntry { path: "/".to_owned(), file: None, is_auth: false, qtype: QidType::DIR },
        );
        Session {
            qids,
            fids: RwLock::new(fids),
            ref_count: Arc::new(AtomicUsize::new(1)),
            request_tx,
            cancel,
            auth_result: std::sync::Mutex::new(None),
            auth_done: tokio::sync::Notify::new(),
            walk_ids: id_pool,
            diag_id,
        }
    }

    /// Builds a session hosting only an auth fid, before any attach has
    /// completed (§4.4 `Tauth`).
    pub fn new_for_auth(
        qids: Arc<QidPool>,
        afid: u32,
        request_tx: mpsc::Sender<Request>,
        cancel: CancellationToken,
        id_pool: Arc<IdPool>,
        diag_id: u32,
    ) -> Session {
        let mut fids = HashMap::new();
        fids.insert(afid, FidEntry { path: String::new(), file: None, is_auth: true, qtype: QidType::AUTH });
        Session {
            qids,
            fids: RwLock::new(fids),
            ref_count: Arc::new(AtomicUsize::new(1)),
            request_tx,
            cancel,
            auth_result: std::sync::Mutex::new(None),
            auth_done: tokio::sync::Notify::new(),
            walk_ids: id_pool,
            diag_id,
        }
    }

    /// Installs `file` as the I/O object backing `fid` directly, bypassing
    /// the normal `Topen` handshake. Used to wire the auth fid to its
    /// channel (§4.4 `Tauth`) and by `Tcreate`'s directory adapter.
    pub async fn install_file(&self, fid: u32, file: std::sync::Arc<dyn File>) {
        let mut fids = self.fids.write().await;
        if let Some(entry) = fids.get_mut(&fid) {
            entry.file = Some(file);
        }
    }

    /// Records the `AuthPolicy`'s verdict and wakes any `Tattach` waiting
    /// on it.
    pub fn set_auth_result(&self, result: std::result::Result<(), String>) {
        *self.auth_result.lock().unwrap() = Some(result);
        self.auth_done.notify_waiters();
    }

    /// Waits for the `AuthPolicy` coroutine to finish and returns its
    /// verdict.
    pub async fn wait_auth_result(&self) -> std::result::Result<(), String> {
        loop {
            if let Some(r) = self.auth_result.lock().unwrap().clone() {
                return r;
            }
            self.auth_done.notified().await;
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn root_qid(&self) -> Qid {
        self.qids.get_or_insert("/", QidType::DIR)
    }

    pub fn is_auth_fid(&self, fid: u32) -> bool {
        self.fids
            .try_read()
            .map(|f| f.get(&fid).is_some_and(|e| e.is_auth))
            .unwrap_or(false)
    }

    async fn deliver(&self, body: SessionRequest) -> Result<SessionReply> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(Request::new(body, tx))
            .await
            .map_err(|_| Error::handler("handler request channel closed"))?;
        rx.await.map_err(|_| Error::handler("handler dropped the request"))
    }

    pub async fn twalk(
        &self,
        fid: u32,
        newfid: u32,
        wnames: &[String],
        cancel: &CancellationToken,
    ) -> Result<FCall> {
        let base = {
            let fids = self.fids.read().await;
            fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?.path.clone()
        };

        if wnames.is_empty() {
            let mut fids = self.fids.write().await;
            let entry = fids.get(&fid).cloned().ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            fids.insert(newfid, entry);
            drop(fids);
            self.ref_count.fetch_add(1, Ordering::SeqCst);
            return Ok(FCall::Rwalk { wqids: Vec::new() });
        }

        {
            let fids = self.fids.read().await;
            if fids.get(&fid).is_some_and(|e| e.file.is_some()) {
                return Err(Error::protocol("walk of an open fid"));
            }
        }

        let walk_id = self.walk_ids.acquire().unwrap_or(0);
        trace!("session={} walk={walk_id} base={base} elements={}", self.diag_id, wnames.len());
        let walker = Arc::new(Walker::new(wnames.len()));
        let steps = walker.steps(&base, wnames);
        let deliveries = steps.into_iter().map(|step| {
            let walker = walker.clone();
            async move {
                let outcome = match self.deliver(SessionRequest::Walk { path: step.path.clone() }).await {
                    Ok(SessionReply::Walk(Some(qid))) => Ok(qid),
                    Ok(SessionReply::Walk(None)) => Err(string::ENOENT.to_owned()),
                    Ok(SessionReply::Error(e)) => Err(e),
                    Ok(_) => Err(string::EPROTO.to_owned()),
                    Err(_) => Err(string::EIO.to_owned()),
                };
                walker.fill(step.index, outcome);
            }
        });
        tokio::select! {
            _ = futures::future::join_all(deliveries) => {}
            _ = cancel.cancelled() => {}
        }

        let outcome = walker.outcome();
        self.walk_ids.release(walk_id);
        let found = match outcome {
            crate::walk::WalkOutcome::Found(qids) => qids,
            crate::walk::WalkOutcome::NotFound(reason) => return Err(Error::protocol(reason)),
        };

        let final_path = (0..found.len()).fold(base.clone(), |p, i| join(&p, &wnames[i]));
        let qtype = found.last().map_or(QidType::FILE, |q| q.typ);
        let mut fids = self.fids.write().await;
        fids.insert(newfid, FidEntry { path: final_path, file: None, is_auth: false, qtype });
        drop(fids);
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        Ok(FCall::Rwalk { wqids: found })
    }

    pub async fn topen(&self, fid: u32, mode: u8) -> Result<FCall> {
        let path = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            if entry.file.is_some() {
                return Err(Error::protocol("fid already open"));
            }
            entry.path.clone()
        };
        match self.deliver(SessionRequest::Open { path: path.clone(), mode }).await? {
            SessionReply::Open { file, qid } => {
                let mut fids = self.fids.write().await;
                if let Some(entry) = fids.get_mut(&fid) {
                    entry.file = Some(file);
                    entry.qtype = qid.typ;
                }
                Ok(FCall::Ropen { qid, iounit: 0 })
            }
            SessionReply::Error(e) => Err(Error::protocol(e)),
            _ => Err(Error::protocol(string::EPROTO)),
        }
    }

    pub async fn tcreate(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<FCall> {
        let path = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            if !entry.qtype.contains(QidType::DIR) {
                return Err(Error::protocol(string::ENOTDIR));
            }
            entry.path.clone()
        };
        match self
            .deliver(SessionRequest::Create { path: path.clone(), name: name.to_owned(), perm, mode })
            .await?
        {
            SessionReply::Create { file, qid } => {
                let mut fids = self.fids.write().await;
                fids.insert(
                    fid,
                    FidEntry { path: join(&path, name), file: Some(file), is_auth: false, qtype: qid.typ },
                );
                Ok(FCall::Rcreate { qid, iounit: 0 })
            }
            SessionReply::Error(e) => Err(Error::protocol(e)),
            _ => Err(Error::protocol(string::EPROTO)),
        }
    }

    pub async fn tread(
        &self,
        fid: u32,
        offset: u64,
        count: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let file = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            entry.file.clone().ok_or_else(|| Error::protocol("fid not open"))?
        };
        tokio::select! {
            result = self.deliver(SessionRequest::Read { file: file.clone(), offset, count }) => {
                match result? {
                    SessionReply::Read(data) => Ok(data),
                    SessionReply::Error(e) => Err(Error::protocol(e)),
                    _ => Err(Error::protocol(string::EPROTO)),
                }
            }
            _ = cancel.cancelled() => {
                let _ = file.close().await;
                Err(Error::protocol("cancelled"))
            }
        }
    }

    /// Reads directly from the fid's installed file, bypassing the
    /// handler channel. Used for the auth fid (§4.4 `Tauth`), whose I/O
    /// object is the policy's duplex channel rather than anything the
    /// handler should see.
    pub async fn auth_read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let file = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            entry.file.clone().ok_or_else(|| Error::protocol("auth fid not installed"))?
        };
        file.read_at(offset, count).await
    }

    /// Writes directly to the fid's installed file; the auth-fid
    /// counterpart of [`Session::auth_read`].
    pub async fn auth_write(&self, fid: u32, offset: u64, data: Vec<u8>) -> Result<u32> {
        let file = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            entry.file.clone().ok_or_else(|| Error::protocol("auth fid not installed"))?
        };
        file.write_at(offset, &data).await
    }

    pub async fn twrite(&self, fid: u32, offset: u64, data: Vec<u8>) -> Result<u32> {
        let file = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            entry.file.clone().ok_or_else(|| Error::protocol("fid not open"))?
        };
        // Write cancellation is best-effort only (§9 open question): no
        // select against the cancellation token here.
        match self.deliver(SessionRequest::Write { file, offset, data }).await? {
            SessionReply::Write(n) => Ok(n),
            SessionReply::Error(e) => Err(Error::protocol(e)),
            _ => Err(Error::protocol(string::EPROTO)),
        }
    }

    pub async fn tstat(&self, fid: u32) -> Result<Stat> {
        let (path, file, is_auth) = {
            let fids = self.fids.read().await;
            let entry = fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?;
            (entry.path.clone(), entry.file.clone(), entry.is_auth)
        };
        if is_auth {
            return Ok(Stat {
                qid: Qid { typ: QidType::AUTH, version: 0, path: 0 },
                mode: crate::fcall::dm::AUTH,
                ..Stat::unset()
            });
        }
        if let Some(file) = &file {
            if let Some(result) = file.stat().await {
                return result;
            }
        }
        match self.deliver(SessionRequest::Stat { path, file }).await? {
            SessionReply::Stat(stat) => Ok(stat),
            SessionReply::Error(e) => Err(Error::protocol(e)),
            _ => Err(Error::protocol(string::EPROTO)),
        }
    }

    pub async fn twstat(&self, fid: u32, stat: &Stat) -> Result<()> {
        let path = {
            let fids = self.fids.read().await;
            fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?.path.clone()
        };
        let subs = wstat::demultiplex(&path, stat);
        let mut replies = Vec::with_capacity(subs.len());
        let mut renamed_to = None;
        for sub in subs {
            if let SubRequest::Rename { new_name, .. } = &sub {
                renamed_to = Some(new_name.clone());
            }
            let reply = self.deliver(SessionRequest::Wstat { path: path.clone(), sub }).await?;
            match reply {
                SessionReply::Wstat(r) => replies.push(r),
                SessionReply::Error(e) => replies.push(Err(e)),
                _ => replies.push(Err(string::EPROTO.to_owned())),
            }
        }
        match wstat::aggregate(&replies) {
            Ok(()) => {
                if let Some(new_name) = renamed_to {
                    let new_path = join(parent(&path), &new_name);
                    self.qids.rename(&path, &new_path);
                    let mut fids = self.fids.write().await;
                    if let Some(entry) = fids.get_mut(&fid) {
                        entry.path = new_path;
                    }
                }
                Ok(())
            }
            Err(e) => Err(Error::protocol(e)),
        }
    }

    pub async fn tclunk(&self, fid: u32) -> Result<()> {
        let removed = {
            let mut fids = self.fids.write().await;
            fids.remove(&fid)
        };
        if let Some(entry) = removed {
            if let Some(file) = entry.file {
                let _ = file.close().await;
            }
        }
        self.dec_ref();
        Ok(())
    }

    pub async fn tremove(&self, fid: u32) -> Result<()> {
        let path = {
            let fids = self.fids.read().await;
            fids.get(&fid).ok_or_else(|| Error::protocol(string::EBADF_FID))?.path.clone()
        };
        let result = self.deliver(SessionRequest::Remove { path: path.clone() }).await;
        self.qids.delete(&path);
        self.tclunk(fid).await?;
        match result? {
            SessionReply::Wstat(Ok(())) | SessionReply::Remove(Ok(())) => Ok(()),
            SessionReply::Error(e) | SessionReply::Wstat(Err(e)) | SessionReply::Remove(Err(e)) => {
                Err(Error::protocol(e))
            }
            _ => Ok(()),
        }
    }

    /// Decrements the reference count. The connection watches
    /// [`Session::ref_count`] after every clunk/remove and drops its
    /// `Session` (and with it the last `request_tx` clone) once it hits
    /// zero, which closes the channel and ends the handler's `next()`
    /// loop (§9).
    fn dec_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.walk_ids.release(self.diag_id);
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_root_is_root() {
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/a/b"), "/a");
    }

    fn new_session() -> (Session, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Session::new(
            Arc::new(QidPool::new()),
            1,
            tx,
            CancellationToken::new(),
            Arc::new(IdPool::new(u32::MAX)),
            1,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn clone_walk_duplicates_the_fid_without_asking_the_handler() {
        let (session, mut rx) = new_session();
        let cancel = CancellationToken::new();
        let reply = session.twalk(1, 2, &[], &cancel).await.unwrap();
        assert!(matches!(reply, FCall::Rwalk { ref wqids } if wqids.is_empty()));
        assert_eq!(session.ref_count(), 2);
        assert!(rx.try_recv().is_err(), "clone must not deliver a request to the handler");
    }

    #[tokio::test]
    async fn tclunk_decrements_ref_count() {
        let (session, _rx) = new_session();
        let cancel = CancellationToken::new();
        session.twalk(1, 2, &[], &cancel).await.unwrap();
        assert_eq!(session.ref_count(), 2);
        session.tclunk(2).await.unwrap();
        assert_eq!(session.ref_count(), 1);
    }

    #[tokio::test]
    async fn walk_into_unknown_fid_is_a_protocol_error() {
        let (session, _rx) = new_session();
        let cancel = CancellationToken::new();
        let err = session.twalk(99, 2, &["a".to_owned()], &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn tcreate_on_a_file_fid_is_rejected_with_enotdir() {
        let (session, mut rx) = new_session();
        let cancel = CancellationToken::new();

        let respond_to_walk = async {
            let req = rx.recv().await.unwrap();
            req.reply(SessionReply::Walk(Some(Qid { typ: QidType::FILE, version: 0, path: 2 })));
        };
        let walk = session.twalk(1, 2, &["f".to_owned()], &cancel);
        let (_, walk_result) = tokio::join!(respond_to_walk, walk);
        walk_result.unwrap();

        let err = session.tcreate(2, "x", 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref s) if s.as_str() == string::ENOTDIR));
        assert!(rx.try_recv().is_err(), "a non-directory fid must be rejected before reaching the handler");
    }
}
