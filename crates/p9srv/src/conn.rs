//! Connection multiplexer (§4.4): the per-connection state machine that
//! negotiates protocol parameters, routes T-messages to the owning
//! session, and manages pending-request cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::decoder::{Decoded, Decoder};
use crate::encoder::Encoder;
use crate::error::{string, Error, Result};
use crate::fcall::{Data, FCall, MsgType, QidType, MIN_BUF_SIZE, NOFID, P92000, VERSION_UNKNOWN};
use crate::file::{DuplexFile, File};
use crate::handler::{AuthPolicy, Flush, HandlerFactory, Source};
use crate::idpool::IdPool;
use crate::qidpool::QidPool;
use crate::session::Session;

/// Depth of the bounded channel between a session and its handler.
const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Size in bytes of the in-memory pipe backing an auth exchange.
const AUTH_CHANNEL_CAPACITY: usize = 8192;

/// Everything a [`Connection`] needs that isn't negotiated over the wire:
/// the server's desired `msize`, an optional auth policy, and the factory
/// that produces and drives the user handler for each new session.
pub struct Config {
    pub msize: u32,
    pub auth: Option<Arc<dyn AuthPolicy>>,
    pub handler_factory: Arc<dyn HandlerFactory>,
}

#[derive(PartialEq, Eq)]
enum State {
    New,
    Active,
}

/// One accepted transport connection (§5: "each accepted transport
/// connection runs an independent task"). Owns the decode/encode halves,
/// the connection-wide qid pool, the fid→session routing table, and the
/// pending-tag cancellation map that implements `Tflush`.
pub struct Connection<R, W> {
    decoder: Decoder<R>,
    encoder: Arc<Encoder<W>>,
    config: Config,
    qids: Arc<QidPool>,
    /// Mints the diagnostic session ids that appear in attach/auth log
    /// lines (§4.3, §9 "identifier pool"); never exposed on the wire,
    /// since fids and tags are client-chosen.
    session_ids: Arc<IdPool>,
    fid_sessions: Arc<RwLock<HashMap<u32, Arc<Session>>>>,
    pending: Arc<StdMutex<HashMap<u16, CancellationToken>>>,
    /// Tags a `Tflush` has already claimed: the request task for that tag
    /// suppresses its own reply once it sees itself listed here (§8:
    /// "emitting any R-message for the cancelled tag is suppressed").
    flushed: Arc<StdMutex<HashSet<u16>>>,
    root_cancel: CancellationToken,
    state: State,
    closing: bool,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(reader: R, writer: W, config: Config) -> Connection<R, W> {
        Connection {
            decoder: Decoder::new(reader, config.msize),
            encoder: Arc::new(Encoder::new(writer, config.msize)),
            config,
            qids: Arc::new(QidPool::new()),
            session_ids: Arc::new(IdPool::new(u32::MAX)),
            fid_sessions: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            flushed: Arc::new(StdMutex::new(HashSet::new())),
            root_cancel: CancellationToken::new(),
            state: State::New,
            closing: false,
        }
    }

    /// Drives the connection to completion: negotiates the version, then
    /// routes messages until the transport closes or a fatal error
    /// occurs.
    pub async fn serve(mut self) -> Result<()> {
        loop {
            let decoded = match self.decoder.next().await {
                Ok(d) => d,
                Err(e) => {
                    self.shutdown();
                    return Err(Error::Transport(e));
                }
            };
            match decoded {
                Decoded::Eof => {
                    self.shutdown();
                    return Ok(());
                }
                Decoded::BadMessage { tag, reason } => {
                    debug!("bad message tag={tag}: {reason}");
                    self.encoder.send(tag, FCall::Rerror { ename: reason }).await?;
                }
                Decoded::Msg { tag, body } => {
                    if let Err(e) = self.route(tag, body).await {
                        self.shutdown();
                        return Err(e);
                    }
                    if self.closing {
                        self.shutdown();
                        return Ok(());
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    async fn route(&mut self, tag: u16, body: FCall) -> Result<()> {
        match self.state {
            State::New => match body {
                FCall::Tversion { msize, version } => self.handle_version(tag, msize, version).await,
                _ => {
                    self.encoder.send(tag, FCall::Rerror { ename: "need Tversion".to_owned() }).await?;
                    self.closing = true;
                    Ok(())
                }
            },
            State::Active => match body {
                FCall::Tversion { .. } => {
                    self.encoder
                        .send(tag, FCall::Rerror { ename: "Tversion out of order".to_owned() })
                        .await
                }
                FCall::Tauth { afid, uname, aname } => self.handle_tauth(tag, afid, uname, aname).await,
                FCall::Tattach { fid, afid, uname, aname } => {
                    self.handle_tattach(tag, fid, afid, uname, aname).await
                }
                FCall::Tflush { oldtag } => self.handle_tflush(tag, oldtag).await,
                other => self.handle_fid_message(tag, other).await,
            },
        }
    }

    async fn handle_version(&mut self, tag: u16, msize: u32, version: String) -> Result<()> {
        if version.starts_with(P92000) && msize >= MIN_BUF_SIZE as u32 {
            let negotiated = msize.min(self.config.msize);
            self.decoder.set_msize(negotiated);
            self.encoder.set_msize(negotiated);
            self.state = State::Active;
            info!("version negotiated: msize={negotiated} version={version}");
            self.encoder
                .send(tag, FCall::Rversion { msize: negotiated, version: P92000.to_owned() })
                .await
        } else {
            self.encoder
                .send(tag, FCall::Rversion { msize, version: VERSION_UNKNOWN.to_owned() })
                .await
        }
    }

    async fn handle_tflush(&self, tag: u16, oldtag: u16) -> Result<()> {
        let token = self.pending.lock().unwrap().remove(&oldtag);
        if let Some(token) = token {
            token.cancel();
            self.flushed.lock().unwrap().insert(oldtag);
        }
        self.encoder.send(tag, FCall::Rflush).await
    }

    async fn handle_tauth(&self, tag: u16, afid: u32, uname: String, aname: String) -> Result<()> {
        let Some(policy) = self.config.auth.clone() else {
            return self.encoder.send(tag, FCall::Rerror { ename: string::ENOSYS.to_owned() }).await;
        };
        if self.fid_sessions.read().await.contains_key(&afid) {
            return self
                .encoder
                .send(tag, FCall::Rerror { ename: string::EBADF_INUSE.to_owned() })
                .await;
        }

        let (policy_end, file_end) = tokio::io::duplex(AUTH_CHANNEL_CAPACITY);
        let (dummy_tx, _dummy_rx) = mpsc::channel(1);
        let diag_id = self.session_ids.acquire().unwrap_or(0);
        let session = Arc::new(Session::new_for_auth(
            self.qids.clone(),
            afid,
            dummy_tx,
            self.root_cancel.child_token(),
            self.session_ids.clone(),
            diag_id,
        ));
        session.install_file(afid, Arc::new(DuplexFile::new(file_end))).await;
        self.fid_sessions.write().await.insert(afid, session.clone());

        let aqid = self.qids.get_or_insert(&format!("#auth-{afid}"), QidType::AUTH);
        let session_for_policy = session.clone();
        debug!("auth session={diag_id} started: afid={afid} uname={uname}");
        tokio::spawn(async move {
            let result = policy
                .authenticate(Box::new(DuplexFile::new(policy_end)) as Box<dyn File>, &uname, &aname)
                .await;
            if let Err(e) = &result {
                debug!("auth session={diag_id} rejected: {e}");
            }
            session_for_policy.set_auth_result(result);
        });

        self.encoder.send(tag, FCall::Rauth { aqid }).await
    }

    async fn handle_tattach(
        &self,
        tag: u16,
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    ) -> Result<()> {
        if self.fid_sessions.read().await.contains_key(&fid) {
            return self
                .encoder
                .send(tag, FCall::Rerror { ename: string::EBADF_INUSE.to_owned() })
                .await;
        }

        if self.config.auth.is_some() {
            if afid == NOFID {
                return self
                    .encoder
                    .send(tag, FCall::Rerror { ename: "authentication required".to_owned() })
                    .await;
            }
            let auth_session = self.fid_sessions.read().await.get(&afid).cloned();
            let auth_session = match auth_session {
                Some(s) if s.is_auth_fid(afid) => s,
                _ => {
                    return self
                        .encoder
                        .send(tag, FCall::Rerror { ename: string::EBADF_FID.to_owned() })
                        .await
                }
            };
            if let Err(e) = auth_session.wait_auth_result().await {
                return self
                    .encoder
                    .send(tag, FCall::Rerror { ename: format!("auth failed: {e}") })
                    .await;
            }
        }

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let diag_id = self.session_ids.acquire().unwrap_or(0);
        let session = Arc::new(Session::new(
            self.qids.clone(),
            fid,
            tx,
            self.root_cancel.child_token(),
            self.session_ids.clone(),
            diag_id,
        ));
        self.fid_sessions.write().await.insert(fid, session.clone());

        let flusher: Arc<dyn Flush> = self.encoder.clone();
        let source = Source::new(rx, flusher);
        tokio::spawn(self.config.handler_factory.run(source));

        info!("attach: session={diag_id} fid={fid} uname={uname} aname={aname}");
        self.encoder.send(tag, FCall::Rattach { qid: session.root_qid() }).await
    }

    async fn handle_fid_message(&self, tag: u16, body: FCall) -> Result<()> {
        let Some(&fid) = body.fids().first() else {
            return self
                .encoder
                .send(tag, FCall::Rerror { ename: format!("unexpected {:?}", MsgType::from(&body)) })
                .await;
        };

        let session = self.fid_sessions.read().await.get(&fid).cloned();
        let Some(session) = session else {
            return self.encoder.send(tag, FCall::Rerror { ename: string::EBADF_FID.to_owned() }).await;
        };

        if session.is_auth_fid(fid)
            && !matches!(
                body,
                FCall::Tread { .. } | FCall::Twrite { .. } | FCall::Tstat { .. } | FCall::Tclunk { .. }
            )
        {
            return self.encoder.send(tag, FCall::Rerror { ename: string::EACCES.to_owned() }).await;
        }

        if let FCall::Twalk { fid, newfid, .. } = &body {
            if newfid != fid && self.fid_sessions.read().await.contains_key(newfid) {
                return self
                    .encoder
                    .send(tag, FCall::Rerror { ename: string::EBADF_INUSE.to_owned() })
                    .await;
            }
        }

        let Some(cancel) = self.register_pending(tag) else {
            error!("duplicate in-flight tag {tag}, closing connection");
            return Err(Error::protocol("duplicate tag"));
        };

        let encoder = self.encoder.clone();
        let fid_sessions = self.fid_sessions.clone();
        let pending = self.pending.clone();
        let flushed = self.flushed.clone();
        let was_read = matches!(body, FCall::Tread { .. });

        tokio::spawn(async move {
            let reply = execute_fid_request(session, body, cancel, fid_sessions).await;
            pending.lock().unwrap().remove(&tag);
            if flushed.lock().unwrap().remove(&tag) {
                return;
            }
            let sent = match &reply {
                FCall::Rread { data } if was_read => encoder.send_rread(tag, &data.0).await,
                _ => encoder.send(tag, reply).await,
            };
            if let Err(e) = sent {
                error!("failed to send reply for tag {tag}: {e}");
            }
        });

        Ok(())
    }

    fn register_pending(&self, tag: u16) -> Option<CancellationToken> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&tag) {
            return None;
        }
        let token = self.root_cancel.child_token();
        pending.insert(tag, token.clone());
        Some(token)
    }
}

/// Runs one fid-bearing request against its session and folds the
/// outcome into a reply `FCall`, updating the fid→session map for
/// requests that mint or retire a fid.
async fn execute_fid_request(
    session: Arc<Session>,
    body: FCall,
    cancel: CancellationToken,
    fid_sessions: Arc<RwLock<HashMap<u32, Arc<Session>>>>,
) -> FCall {
    let result = run(&session, body, &cancel, &fid_sessions).await;
    match result {
        Ok(fcall) => fcall,
        Err(e) => FCall::Rerror { ename: e.client_message() },
    }
}

async fn run(
    session: &Arc<Session>,
    body: FCall,
    cancel: &CancellationToken,
    fid_sessions: &Arc<RwLock<HashMap<u32, Arc<Session>>>>,
) -> Result<FCall> {
    match body {
        FCall::Twalk { fid, newfid, wnames } => {
            let reply = session.twalk(fid, newfid, &wnames, cancel).await?;
            if newfid != fid {
                fid_sessions.write().await.insert(newfid, session.clone());
            }
            Ok(reply)
        }
        FCall::Topen { fid, mode } => session.topen(fid, mode).await,
        FCall::Tcreate { fid, name, perm, mode } => session.tcreate(fid, &name, perm, mode).await,
        FCall::Tread { fid, offset, count } => {
            let data = if session.is_auth_fid(fid) {
                session.auth_read(fid, offset, count).await?
            } else {
                session.tread(fid, offset, count, cancel).await?
            };
            Ok(FCall::Rread { data: Data(data) })
        }
        FCall::Twrite { fid, offset, data } => {
            let n = if session.is_auth_fid(fid) {
                session.auth_write(fid, offset, data.0).await?
            } else {
                session.twrite(fid, offset, data.0).await?
            };
            Ok(FCall::Rwrite { count: n })
        }
        FCall::Tclunk { fid } => {
            session.tclunk(fid).await?;
            fid_sessions.write().await.remove(&fid);
            Ok(FCall::Rclunk)
        }
        FCall::Tremove { fid } => {
            let result = session.tremove(fid).await;
            fid_sessions.write().await.remove(&fid);
            result?;
            Ok(FCall::Rremove)
        }
        FCall::Tstat { fid } => session.tstat(fid).await.map(|stat| FCall::Rstat { stat }),
        FCall::Twstat { fid, stat } => session.twstat(fid, &stat).await.map(|_| FCall::Rwstat),
        _ => Err(Error::protocol(format!("unexpected {:?}", MsgType::from(&body)))),
    }
}
