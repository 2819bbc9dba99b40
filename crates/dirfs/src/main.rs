//! Serves a real directory tree over 9P2000 using the p9srv core.
//!
//! This binary owns everything the core deliberately leaves out: the
//! TCP/Unix accept loop, signal handling, and the actual file tree — it
//! is a [`p9srv::handler::Middleware`] that turns walk/open/create/
//! read/write/stat/wstat/remove requests into real filesystem calls
//! rooted at `exportdir`.

mod utils;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use log::{error, info};
use tokio::fs;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use p9srv::conn::{Config, Connection};
use p9srv::error::{string, Error};
use p9srv::fcall::{dm, om, DEFAULT_MSIZE};
use p9srv::file::{DirEntry, File, SeekFile};
use p9srv::handler::{drive_to_completion, Handler, HandlerFactory, Middleware, Stack};
use p9srv::session::{Request, SessionReply, SessionRequest};
use p9srv::wstat::SubRequest;
use p9srv::Result;

use crate::utils::{
    file_name, gid_for_name, qid_from_metadata, stat_from_metadata, uid_for_name,
};

/// A directory fid's I/O object: listing, not bytes. `Tread` against it
/// is routed here by [`p9srv::dirio::read_dir`] (via `Session::tread`).
struct DirHandle {
    path: PathBuf,
}

#[async_trait]
impl File for DirHandle {
    async fn read_at(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(Error::protocol(string::EISDIR))
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(Error::protocol(string::EISDIR))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn readdir(&self, offset: u64, count: u32) -> Option<Result<Vec<DirEntry>>> {
        Some(self.list(offset, count).await)
    }
}

impl DirHandle {
    async fn list(&self, offset: u64, count: u32) -> Result<Vec<DirEntry>> {
        let rd = fs::read_dir(&self.path).await.map_err(to_error)?;
        let mut entries = ReadDirStream::new(rd).skip(offset as usize);
        let mut out = Vec::new();
        let mut i = offset;
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(to_error)?;
            let meta = entry.metadata().await.map_err(to_error)?;
            out.push(DirEntry {
                stat: stat_from_metadata(&entry.file_name().to_string_lossy(), &meta),
                offset: i + 1,
            });
            i += 1;
            if out.len() as u32 >= count.max(1) {
                break;
            }
        }
        Ok(out)
    }
}

/// Maps filesystem paths in the 9P tree onto real paths under `root`.
struct DirFs {
    root: PathBuf,
}

impl DirFs {
    fn new(root: PathBuf) -> DirFs {
        DirFs { root }
    }

    fn real_path(&self, virtual_path: &str) -> PathBuf {
        match virtual_path.trim_start_matches('/') {
            "" => self.root.clone(),
            rest => self.root.join(rest),
        }
    }
}

#[async_trait]
impl Middleware for DirFs {
    async fn handle(&mut self, req: &Request) {
        match &req.body {
            SessionRequest::Walk { path } => self.handle_walk(req, path).await,
            SessionRequest::Open { path, mode } => self.handle_open(req, path, *mode).await,
            SessionRequest::Create { path, name, perm, mode } => {
                self.handle_create(req, path, name, *perm, *mode).await
            }
            SessionRequest::Read { file, offset, count } => {
                handle_read(req, file.as_ref(), *offset, *count).await
            }
            SessionRequest::Write { file, offset, data } => {
                handle_write(req, file.as_ref(), *offset, data).await
            }
            SessionRequest::Stat { path, .. } => self.handle_stat(req, path).await,
            SessionRequest::Wstat { path, sub } => self.handle_wstat(req, path, sub).await,
            SessionRequest::Remove { path } => self.handle_remove(req, path).await,
        }
    }
}

impl DirFs {
    async fn handle_walk(&self, req: &Request, path: &str) {
        let real = self.real_path(path);
        match fs::symlink_metadata(&real).await {
            Ok(meta) => req.reply(SessionReply::Walk(Some(qid_from_metadata(&meta)))),
            Err(_) => req.reply(SessionReply::Walk(None)),
        }
    }

    async fn handle_open(&self, req: &Request, path: &str, mode: u8) {
        let real = self.real_path(path);
        let meta = match fs::symlink_metadata(&real).await {
            Ok(meta) => meta,
            Err(e) => return req.reply(SessionReply::Error(to_error(e).client_message())),
        };
        if meta.is_dir() {
            let qid = qid_from_metadata(&meta);
            req.reply(SessionReply::Open { file: Arc::new(DirHandle { path: real }), qid });
            return;
        }
        match open_options(mode).open(&real).await {
            Ok(file) => {
                let qid = qid_from_metadata(&meta);
                req.reply(SessionReply::Open { file: Arc::new(SeekFile::new(file)), qid });
            }
            Err(e) => req.reply(SessionReply::Error(to_error(e).client_message())),
        }
    }

    async fn handle_create(&self, req: &Request, path: &str, name: &str, perm: u32, mode: u8) {
        let real = self.real_path(path).join(name);
        if perm & dm::DIR != 0 {
            if let Err(e) = fs::create_dir(&real).await {
                return req.reply(SessionReply::Error(to_error(e).client_message()));
            }
            let meta = match fs::symlink_metadata(&real).await {
                Ok(meta) => meta,
                Err(e) => return req.reply(SessionReply::Error(to_error(e).client_message())),
            };
            let qid = qid_from_metadata(&meta);
            req.reply(SessionReply::Create { file: Arc::new(DirHandle { path: real }), qid });
            return;
        }

        let file = match open_options(mode).create(true).create_new(true).open(&real).await {
            Ok(file) => file,
            Err(e) => return req.reply(SessionReply::Error(to_error(e).client_message())),
        };
        if let Err(e) = fs::set_permissions(&real, std::fs::Permissions::from_mode(perm & 0o777)).await
        {
            return req.reply(SessionReply::Error(to_error(e).client_message()));
        }
        let meta = match fs::symlink_metadata(&real).await {
            Ok(meta) => meta,
            Err(e) => return req.reply(SessionReply::Error(to_error(e).client_message())),
        };
        let qid = qid_from_metadata(&meta);
        req.reply(SessionReply::Create { file: Arc::new(SeekFile::new(file)), qid });
    }

    async fn handle_stat(&self, req: &Request, path: &str) {
        let real = self.real_path(path);
        match fs::symlink_metadata(&real).await {
            Ok(meta) => req.reply(SessionReply::Stat(stat_from_metadata(&name_of(path, &real), &meta))),
            Err(e) => req.reply(SessionReply::Error(to_error(e).client_message())),
        }
    }

    async fn handle_wstat(&self, req: &Request, path: &str, sub: &SubRequest) {
        let real = self.real_path(path);
        let result = match sub {
            SubRequest::Sync => Ok(()),
            SubRequest::Chmod { mode } => fs::set_permissions(&real, std::fs::Permissions::from_mode(mode & 0o777))
                .await
                .map_err(|e| to_error(e).client_message()),
            SubRequest::Truncate { size } => truncate(&real, *size).await,
            SubRequest::Utimes { atime, mtime } => set_times(&real, *atime, *mtime).await,
            SubRequest::Chown { uid, gid } => chown(&real, uid, gid),
            SubRequest::Rename { old_path, new_name } => {
                let new_real = self.real_path(parent(old_path)).join(new_name);
                fs::rename(&real, &new_real).await.map_err(|e| to_error(e).client_message())
            }
        };
        req.reply(SessionReply::Wstat(result));
    }

    async fn handle_remove(&self, req: &Request, path: &str) {
        let real = self.real_path(path);
        let result = match fs::symlink_metadata(&real).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&real).await,
            Ok(_) => fs::remove_file(&real).await,
            Err(e) => Err(e),
        };
        req.reply(SessionReply::Remove(result.map_err(|e| to_error(e).client_message())));
    }
}

async fn handle_read(req: &Request, file: &dyn File, offset: u64, count: u32) {
    let result = match p9srv::dirio::read_dir(file, offset, count).await {
        Ok(data) => Ok(data),
        Err(_) => file.read_at(offset, count).await,
    };
    match result {
        Ok(data) => req.reply(SessionReply::Read(data)),
        Err(e) => req.reply(SessionReply::Error(e.client_message())),
    }
}

async fn handle_write(req: &Request, file: &dyn File, offset: u64, data: &[u8]) {
    match file.write_at(offset, data).await {
        Ok(n) => req.reply(SessionReply::Write(n)),
        Err(e) => req.reply(SessionReply::Error(e.client_message())),
    }
}

fn open_options(mode: u8) -> fs::OpenOptions {
    let mut opts = fs::OpenOptions::new();
    match mode & 0x3 {
        om::WRITE => {
            opts.write(true);
        }
        om::RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if mode & om::TRUNC != 0 {
        opts.truncate(true);
    }
    opts
}

async fn truncate(path: &Path, size: u64) -> std::result::Result<(), String> {
    let file = fs::OpenOptions::new().write(true).open(path).await.map_err(|e| to_error(e).client_message())?;
    file.set_len(size).await.map_err(|e| to_error(e).client_message())
}

async fn set_times(path: &Path, atime: u32, mtime: u32) -> std::result::Result<(), String> {
    let at = filetime::FileTime::from_unix_time(atime as i64, 0);
    let mt = filetime::FileTime::from_unix_time(mtime as i64, 0);
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || filetime::set_file_times(&path, at, mt))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}

fn chown(path: &Path, uid: &str, gid: &str) -> std::result::Result<(), String> {
    let uid = if uid.is_empty() { None } else { uid_for_name(uid) };
    let gid = if gid.is_empty() { None } else { gid_for_name(gid) };
    nix::unistd::chown(path, uid, gid).map_err(|e| e.to_string())
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn name_of(virtual_path: &str, real: &Path) -> String {
    if virtual_path == "/" {
        "/".to_owned()
    } else {
        file_name(real)
    }
}

fn to_error(e: std::io::Error) -> Error {
    use std::io::ErrorKind::*;
    let msg = match e.kind() {
        NotFound => string::ENOENT,
        PermissionDenied => string::EACCES,
        AlreadyExists => string::EEXIST,
        _ => return Error::protocol(string::EIO),
    };
    Error::protocol(msg)
}

#[derive(Debug, Parser)]
#[command(about = "Serves a real directory tree over 9P2000")]
struct Cli {
    /// Dial string: proto!address!port, e.g. tcp!0.0.0.0!564 or unix!/tmp/p9.sock!0
    address: String,
    /// Directory to export
    exportdir: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("dirfs: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if !fs::try_exists(&cli.exportdir).await? {
        return Err(Error::protocol("export directory does not exist"));
    }
    let root = fs::canonicalize(&cli.exportdir).await?;
    info!("exporting {} on {}", root.display(), cli.address);

    let factory: Arc<dyn HandlerFactory> = Arc::new(drive_to_completion(move |source| {
        let stack = Stack::new(source).push(Box::new(DirFs::new(root.clone())));
        Box::new(stack) as Box<dyn Handler>
    }));

    tokio::select! {
        result = serve(&cli.address, DEFAULT_MSIZE, factory) => result,
        result = shutdown_signal() => result.map_err(Error::Transport),
    }
}

async fn serve(addr: &str, msize: u32, factory: Arc<dyn HandlerFactory>) -> Result<()> {
    let (proto, host, port) = p9srv::utils::parse_proto(addr)
        .ok_or_else(|| Error::protocol("invalid dial string, expected proto!addr!port"))?;
    match proto {
        "tcp" => serve_tcp(&format!("{host}:{port}"), msize, factory).await,
        // The trailing segment of a unix dial string is a conventional
        // instance suffix with no meaning for a domain socket path.
        "unix" => serve_unix(host, msize, factory).await,
        other => Err(Error::protocol(format!("unsupported protocol: {other}"))),
    }
}

async fn serve_tcp(addr: &str, msize: u32, factory: Arc<dyn HandlerFactory>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on tcp {addr}");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {peer}");
        let factory = factory.clone();
        tokio::spawn(async move {
            let (read, write) = stream.into_split();
            let config = Config { msize, auth: None, handler_factory: factory };
            if let Err(e) = Connection::new(read, write, config).serve().await {
                error!("connection error: {e}");
            }
        });
    }
}

/// Removes the socket file on drop, the way a Unix-domain server should
/// clean up after itself on graceful shutdown.
struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<DeleteOnDrop> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {e}", self.path);
        }
    }
}

async fn serve_unix(path: &str, msize: u32, factory: Arc<dyn HandlerFactory>) -> Result<()> {
    let listener = DeleteOnDrop::bind(path)?;
    info!("listening on unix {path}");
    loop {
        let (stream, _) = listener.listener.accept().await?;
        let factory = factory.clone();
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(stream);
            let config = Config { msize, auth: None, handler_factory: factory };
            if let Err(e) = Connection::new(read, write, config).serve().await {
                error!("connection error: {e}");
            }
        });
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p9srv::fcall::QidType;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    async fn dispatch(fs: &mut DirFs, body: SessionRequest) -> SessionReply {
        let (tx, rx) = oneshot::channel();
        let req = Request::new(body, tx);
        fs.handle(&req).await;
        rx.await.expect("DirFs always replies")
    }

    #[tokio::test]
    async fn walk_to_an_existing_file_returns_a_file_qid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(&mut fs, SessionRequest::Walk { path: "/hello.txt".to_owned() }).await {
            SessionReply::Walk(Some(qid)) => assert!(!qid.typ.contains(QidType::DIR)),
            _ => panic!("expected Walk(Some(..)), got a different reply"),
        }
    }

    #[tokio::test]
    async fn walk_to_a_missing_path_returns_none() {
        let dir = tempdir().unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(&mut fs, SessionRequest::Walk { path: "/nope".to_owned() }).await {
            SessionReply::Walk(None) => {}
            _ => panic!("expected Walk(None)"),
        }
    }

    #[tokio::test]
    async fn create_then_write_then_read_round_trips_through_the_real_file() {
        let dir = tempdir().unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        let file = match dispatch(
            &mut fs,
            SessionRequest::Create {
                path: "/".to_owned(),
                name: "new.txt".to_owned(),
                perm: 0o644,
                mode: om::RDWR,
            },
        )
        .await
        {
            SessionReply::Create { file, .. } => file,
            _ => panic!("expected Create"),
        };

        file.write_at(0, b"payload").await.unwrap();
        let data = file.read_at(0, 100).await.unwrap();
        assert_eq!(data, b"payload");
        assert!(dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn wstat_chmod_changes_the_real_permission_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(
            &mut fs,
            SessionRequest::Wstat { path: "/f".to_owned(), sub: SubRequest::Chmod { mode: 0o600 } },
        )
        .await
        {
            SessionReply::Wstat(Ok(())) => {}
            _ => panic!("expected Wstat(Ok(..))"),
        }

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn wstat_rename_moves_the_real_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old");
        std::fs::write(&path, b"").unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(
            &mut fs,
            SessionRequest::Wstat {
                path: "/old".to_owned(),
                sub: SubRequest::Rename { old_path: "/old".to_owned(), new_name: "new".to_owned() },
            },
        )
        .await
        {
            SessionReply::Wstat(Ok(())) => {}
            _ => panic!("expected Wstat(Ok(..))"),
        }

        assert!(!path.exists());
        assert!(dir.path().join("new").exists());
    }

    #[tokio::test]
    async fn remove_deletes_the_real_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doomed");
        std::fs::write(&path, b"").unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(&mut fs, SessionRequest::Remove { path: "/doomed".to_owned() }).await {
            SessionReply::Remove(Ok(())) => {}
            _ => panic!("expected Remove(Ok(..))"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stat_of_root_reports_a_directory_qid() {
        let dir = tempdir().unwrap();
        let mut fs = DirFs::new(dir.path().to_owned());

        match dispatch(&mut fs, SessionRequest::Stat { path: "/".to_owned(), file: None }).await {
            SessionReply::Stat(stat) => assert!(stat.qid.typ.contains(QidType::DIR)),
            _ => panic!("expected Stat(..)"),
        }
    }
}
