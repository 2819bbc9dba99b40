//! Handler façade, Stack, and Mux (§4.8): the public contract user code
//! writes against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::string;
use crate::fcall::{Qid, QidType};
use crate::file::File;
use crate::qidpool::QidPool;
use crate::session::{Request, SessionReply, SessionRequest};
use crate::wstat::SubRequest;

/// Something an encoder can be told to flush, so [`Source`] doesn't need
/// to be generic over the transport type.
#[async_trait]
pub trait Flush: Send + Sync {
    async fn flush(&self);
}

/// The pull-model contract every handler implements.
///
/// `next()` advances to the following request: it first emits the
/// default reply for the previous request if nothing answered it,
/// flushes the encoder, then blocks for the next delivery. Returns
/// `false` once the request channel is closed (the session has ended).
#[async_trait]
pub trait Handler: Send {
    async fn next(&mut self) -> bool;
    fn request(&self) -> &Request;
    fn update_request(&mut self, r: Request);
}

/// The bottom of every handler chain: reads directly from a session's
/// request channel.
pub struct Source {
    rx: mpsc::Receiver<Request>,
    flusher: Arc<dyn Flush>,
    current: Option<Request>,
}

impl Source {
    pub fn new(rx: mpsc::Receiver<Request>, flusher: Arc<dyn Flush>) -> Source {
        Source { rx, flusher, current: None }
    }
}

#[async_trait]
impl Handler for Source {
    async fn next(&mut self) -> bool {
        if let Some(req) = self.current.take() {
            if !req.answered() {
                req.reply(default_reply(&req.body));
            }
        }
        self.flusher.flush().await;
        match self.rx.recv().await {
            Some(req) => {
                self.current = Some(req);
                true
            }
            None => false,
        }
    }

    fn request(&self) -> &Request {
        self.current.as_ref().expect("next() must be called before request()")
    }

    fn update_request(&mut self, r: Request) {
        self.current = Some(r);
    }
}

/// The documented default answer for a request nobody answered (§4.8, §7).
fn default_reply(body: &SessionRequest) -> SessionReply {
    match body {
        SessionRequest::Walk { .. } => SessionReply::Walk(None),
        SessionRequest::Open { .. } | SessionRequest::Create { .. } => {
            SessionReply::Error(string::EACCES.to_owned())
        }
        SessionRequest::Read { .. } => SessionReply::Error(string::EIO.to_owned()),
        SessionRequest::Write { .. } => SessionReply::Error(string::EIO.to_owned()),
        SessionRequest::Stat { .. } => SessionReply::Error(string::EACCES.to_owned()),
        SessionRequest::Wstat { sub, .. } => SessionReply::Wstat(Err(sub.default_error().to_owned())),
        SessionRequest::Remove { .. } => SessionReply::Remove(Err(string::EACCES.to_owned())),
    }
}

/// Composes handlers left to right (§4.8). A request is offered to each
/// child in turn until one answers it or overwrites it via
/// `update_request`; if none answer, [`Source`]'s default-reply logic
/// fires on the next call to `next()`.
pub struct Stack {
    source: Source,
    middleware: Vec<Box<dyn Middleware>>,
}

/// A single stage in a [`Stack`]. Unlike [`Handler`], a middleware stage
/// is stateless between calls: it's given the current request and may
/// answer it, rewrite it, or pass it through untouched.
#[async_trait]
pub trait Middleware: Send {
    async fn handle(&mut self, req: &Request);
}

impl Stack {
    pub fn new(source: Source) -> Stack {
        Stack { source, middleware: Vec::new() }
    }

    pub fn push(mut self, stage: Box<dyn Middleware>) -> Stack {
        self.middleware.push(stage);
        self
    }
}

#[async_trait]
impl Handler for Stack {
    async fn next(&mut self) -> bool {
        if !self.source.next().await {
            return false;
        }
        for stage in &mut self.middleware {
            let req = self.source.request();
            if req.answered() {
                break;
            }
            stage.handle(req).await;
        }
        true
    }

    fn request(&self) -> &Request {
        self.source.request()
    }

    fn update_request(&mut self, r: Request) {
        self.source.update_request(r);
    }
}

/// Routes requests by the longest matching path prefix to a registered
/// sub-handler. Intermediate directories of the prefix tree (any path
/// that is a strict ancestor of a registered prefix but not itself
/// registered) are served internally as read-only synthetic directories,
/// listing the next path segment toward each such prefix.
pub struct Mux {
    routes: HashMap<String, Box<dyn Middleware>>,
    /// Qids minted for synthetic intermediate directories, keyed by path
    /// so a repeated reference to the same intermediate path keeps the
    /// same identity for the life of this `Mux` (§4.2's qid-pool
    /// invariant, reused here rather than duplicated).
    synthetic_qids: Arc<QidPool>,
}

impl Mux {
    pub fn new() -> Mux {
        Mux { routes: HashMap::new(), synthetic_qids: Arc::new(QidPool::new()) }
    }

    pub fn register(&mut self, prefix: impl Into<String>, handler: Box<dyn Middleware>) {
        self.routes.insert(normalize_prefix(&prefix.into()), handler);
    }

    fn longest_match(&self, path: &str) -> Option<&str> {
        self.routes
            .keys()
            .filter(|prefix| path == prefix.as_str() || path.starts_with(&format!("{prefix}/")))
            .max_by_key(|prefix| prefix.len())
            .map(|s| s.as_str())
    }

    /// Whether `path` is a strict ancestor directory of at least one
    /// registered prefix (and so must be synthesized, having matched no
    /// route in [`Mux::longest_match`]).
    fn has_registered_descendant(&self, path: &str) -> bool {
        let child_prefix = if path == "/" { "/".to_owned() } else { format!("{path}/") };
        self.routes.keys().any(|route| route.starts_with(&child_prefix))
    }

    /// The immediate next path segment of every registered prefix rooted
    /// under `path`, deduplicated and sorted for a stable listing order.
    fn child_names(&self, path: &str) -> Vec<String> {
        let child_prefix = if path == "/" { "/".to_owned() } else { format!("{path}/") };
        let mut names: Vec<String> = self
            .routes
            .keys()
            .filter_map(|route| route.strip_prefix(child_prefix.as_str()))
            .filter(|rest| !rest.is_empty())
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_owned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    async fn serve_intermediate(&self, req: &Request, path: &str) {
        let qid = self.synthetic_qids.get_or_insert(path, QidType::DIR);
        match &req.body {
            SessionRequest::Walk { .. } => req.reply(SessionReply::Walk(Some(qid))),
            SessionRequest::Stat { .. } => req.reply(SessionReply::Stat(synthetic_dir_stat(path, qid))),
            SessionRequest::Open { mode, .. } => {
                if mode & 0x3 != crate::fcall::om::READ {
                    req.reply(SessionReply::Error(string::EACCES.to_owned()));
                    return;
                }
                let file: Arc<dyn File> = Arc::new(SyntheticDir {
                    path: path.to_owned(),
                    children: self.child_names(path),
                    qids: self.synthetic_qids.clone(),
                });
                req.reply(SessionReply::Open { file, qid });
            }
            SessionRequest::Create { .. } => req.reply(SessionReply::Error(string::EACCES.to_owned())),
            SessionRequest::Wstat { sub, .. } => {
                req.reply(SessionReply::Wstat(Err(sub.default_error().to_owned())))
            }
            SessionRequest::Remove { .. } => {
                req.reply(SessionReply::Remove(Err(string::EACCES.to_owned())))
            }
            SessionRequest::Read { .. } | SessionRequest::Write { .. } => {}
        }
    }

    fn path_of(req: &Request) -> Option<&str> {
        match &req.body {
            SessionRequest::Walk { path }
            | SessionRequest::Open { path, .. }
            | SessionRequest::Create { path, .. }
            | SessionRequest::Stat { path, .. }
            | SessionRequest::Wstat { path, .. }
            | SessionRequest::Remove { path } => Some(path.as_str()),
            SessionRequest::Read { .. } | SessionRequest::Write { .. } => None,
        }
    }
}

impl Default for Mux {
    fn default() -> Mux {
        Mux::new()
    }
}

#[async_trait]
impl Middleware for Mux {
    async fn handle(&mut self, req: &Request) {
        let Some(path) = Self::path_of(req).map(|p| p.to_owned()) else { return };
        if let Some(prefix) = self.longest_match(&path).map(|s| s.to_owned()) {
            if let Some(handler) = self.routes.get_mut(&prefix) {
                handler.handle(req).await;
            }
            return;
        }
        if self.has_registered_descendant(&path) {
            self.serve_intermediate(req, &path).await;
        }
    }
}

/// The read-only listing of an intermediate directory's immediate
/// children, installed as the `File` behind an `Topen` of a synthetic
/// path (§4.8).
struct SyntheticDir {
    path: String,
    children: Vec<String>,
    qids: Arc<QidPool>,
}

#[async_trait]
impl File for SyntheticDir {
    async fn read_at(&self, _offset: u64, _count: u32) -> crate::utils::Result<Vec<u8>> {
        Err(crate::error::Error::protocol(string::EISDIR))
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> crate::utils::Result<u32> {
        Err(crate::error::Error::protocol(string::EACCES))
    }

    async fn close(&self) -> crate::utils::Result<()> {
        Ok(())
    }

    async fn readdir(&self, offset: u64, count: u32) -> Option<crate::utils::Result<Vec<crate::file::DirEntry>>> {
        let start = offset as usize;
        if start >= self.children.len() {
            return Some(Ok(Vec::new()));
        }
        let end = (start + count.max(1) as usize).min(self.children.len());
        let entries = self.children[start..end]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let child_path = crate::utils::join(&self.path, name);
                let qid = self.qids.get_or_insert(&child_path, QidType::DIR);
                crate::file::DirEntry { stat: synthetic_dir_stat(&child_path, qid), offset: (start + i + 1) as u64 }
            })
            .collect();
        Some(Ok(entries))
    }
}

/// Builds the stat record for a synthetic intermediate directory or one
/// of its listed children: a fixed read-only directory, no owner
/// information (there is no real file behind it to ask).
fn synthetic_dir_stat(path: &str, qid: Qid) -> crate::fcall::Stat {
    let name = if path == "/" { String::new() } else { path.rsplit('/').next().unwrap_or(path).to_owned() };
    crate::fcall::Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: crate::fcall::dm::DIR | 0o555,
        atime: 0,
        mtime: 0,
        length: 0,
        name,
        uid: String::new(),
        gid: String::new(),
        muid: String::new(),
    }
}

fn normalize_prefix(s: &str) -> String {
    if s.len() > 1 && s.ends_with('/') {
        s[..s.len() - 1].to_owned()
    } else {
        s.to_owned()
    }
}

/// External collaborator that authenticates a `Tattach`/`Tauth` (§6).
/// The core only routes to this; it implements nothing about how trust
/// is established.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Runs the authentication exchange over `channel`. A `Some(Err(_))`
    /// rejects the attach; `Ok(())` admits it.
    async fn authenticate(
        &self,
        channel: Box<dyn File>,
        uname: &str,
        aname: &str,
    ) -> Result<(), String>;
}

/// Produces a fresh handler chain for each new session and drives it to
/// completion. The connection only needs to hand over the [`Source`] and
/// spawn the returned future (§4.4: "the connection spawns the user
/// handler against the session's request channel").
pub trait HandlerFactory: Send + Sync {
    fn run(&self, source: Source) -> futures::future::BoxFuture<'static, ()>;
}

/// Adapts a plain `Handler`-builder closure into a [`HandlerFactory`] that
/// drives the built handler with a simple `next()` loop.
pub fn drive_to_completion(
    new_handler: impl Fn(Source) -> Box<dyn Handler> + Send + Sync + 'static,
) -> impl HandlerFactory {
    struct Driving<F>(F);

    impl<F> HandlerFactory for Driving<F>
    where
        F: Fn(Source) -> Box<dyn Handler> + Send + Sync + 'static,
    {
        fn run(&self, source: Source) -> futures::future::BoxFuture<'static, ()> {
            let mut handler = (self.0)(source);
            Box::pin(async move { while handler.next().await {} })
        }
    }

    Driving(new_handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFlush;
    #[async_trait]
    impl Flush for NoopFlush {
        async fn flush(&self) {}
    }

    fn qid() -> Qid {
        Qid { typ: QidType::FILE, version: 0, path: 1 }
    }

    #[tokio::test]
    async fn source_emits_default_reply_for_an_unanswered_request() {
        let (tx, rx) = mpsc::channel(1);
        let mut source = Source::new(rx, Arc::new(NoopFlush));

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send(Request::new(SessionRequest::Walk { path: "/a".into() }, reply_tx))
            .await
            .unwrap();
        assert!(source.next().await);
        drop(tx); // no more requests; the next `next()` call closes the loop
        assert!(!source.next().await);
        assert_eq!(reply_rx.await.map(|_| ()).is_ok(), true);
    }

    #[tokio::test]
    async fn an_answered_request_does_not_get_a_default_reply_too() {
        let (tx, rx) = mpsc::channel(1);
        let mut source = Source::new(rx, Arc::new(NoopFlush));
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send(Request::new(SessionRequest::Walk { path: "/a".into() }, reply_tx))
            .await
            .unwrap();
        assert!(source.next().await);
        source.request().reply(SessionReply::Walk(Some(qid())));
        drop(tx);
        assert!(!source.next().await);
        match reply_rx.await.unwrap() {
            SessionReply::Walk(Some(q)) => assert_eq!(q, qid()),
            _ => panic!("expected the explicit reply to win"),
        }
    }

    #[tokio::test]
    async fn mux_routes_by_longest_prefix() {
        struct Tag(&'static str, Vec<String>);
        #[async_trait]
        impl Middleware for Tag {
            async fn handle(&mut self, req: &Request) {
                self.1.push(self.0.to_owned());
                req.reply(SessionReply::Error("handled".into()));
            }
        }
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let mut mux = Mux::new();
        mux.register("/a", Box::new(Tag("a", Vec::new())));
        mux.register("/a/b", Box::new(Tag("b", Vec::new())));
        let _ = &seen;

        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
        let req = Request::new(SessionRequest::Stat { path: "/a/b/c".into(), file: None }, reply_tx);
        mux.handle(&req).await;
        assert!(req.answered());
    }

    #[tokio::test]
    async fn mux_synthesizes_a_walk_qid_for_an_intermediate_directory() {
        struct Unreachable;
        #[async_trait]
        impl Middleware for Unreachable {
            async fn handle(&mut self, _req: &Request) {
                panic!("an intermediate path must not be forwarded to a registered handler");
            }
        }
        let mut mux = Mux::new();
        mux.register("/a/b", Box::new(Unreachable));

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let req = Request::new(SessionRequest::Walk { path: "/a".into() }, reply_tx);
        mux.handle(&req).await;
        assert!(req.answered());
        match reply_rx.await.unwrap() {
            SessionReply::Walk(Some(q)) => assert!(q.typ.contains(QidType::DIR)),
            _ => panic!("expected a synthetic directory qid"),
        }
    }

    #[tokio::test]
    async fn mux_leaves_unrelated_paths_unanswered() {
        struct Noop;
        #[async_trait]
        impl Middleware for Noop {
            async fn handle(&mut self, _req: &Request) {}
        }
        let mut mux = Mux::new();
        mux.register("/a/b", Box::new(Noop));

        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
        let req = Request::new(SessionRequest::Walk { path: "/z".into() }, reply_tx);
        mux.handle(&req).await;
        assert!(!req.answered());
    }

    #[tokio::test]
    async fn mux_lists_the_immediate_children_of_an_intermediate_directory() {
        struct Noop;
        #[async_trait]
        impl Middleware for Noop {
            async fn handle(&mut self, _req: &Request) {}
        }
        let mut mux = Mux::new();
        mux.register("/a/b", Box::new(Noop));
        mux.register("/a/c/d", Box::new(Noop));

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let req = Request::new(SessionRequest::Open { path: "/a".into(), mode: crate::fcall::om::READ }, reply_tx);
        mux.handle(&req).await;
        let file = match reply_rx.await.unwrap() {
            SessionReply::Open { file, .. } => file,
            _ => panic!("expected Open"),
        };
        let entries = file.readdir(0, 10).await.unwrap().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.stat.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn mux_rejects_create_under_an_intermediate_directory() {
        struct Noop;
        #[async_trait]
        impl Middleware for Noop {
            async fn handle(&mut self, _req: &Request) {}
        }
        let mut mux = Mux::new();
        mux.register("/a/b", Box::new(Noop));

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let req = Request::new(
            SessionRequest::Create { path: "/a".into(), name: "x".into(), perm: 0, mode: 0 },
            reply_tx,
        );
        mux.handle(&req).await;
        assert!(matches!(reply_rx.await.unwrap(), SessionReply::Error(_)));
    }
}
