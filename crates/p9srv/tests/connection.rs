//! Full-connection integration tests (§8 "Concrete end-to-end scenarios"):
//! drive a real [`Connection`] over an in-memory duplex pipe and observe
//! the wire-level replies a client would see.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use p9srv::conn::{Config, Connection};
use p9srv::decoder::{Decoded, Decoder};
use p9srv::error::Result;
use p9srv::fcall::{FCall, Msg, Qid, QidType, NOFID, NOTAG};
use p9srv::file::File;
use p9srv::handler::{Handler, HandlerFactory, Source};
use p9srv::serialize::write_msg;
use p9srv::session::{SessionReply, SessionRequest};

fn encode(tag: u16, body: FCall) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_msg(&mut bytes, &Msg { tag, body }).unwrap();
    bytes
}

async fn negotiate_and_attach<W: AsyncWriteExt + Unpin, R: tokio::io::AsyncRead + Unpin>(
    write_half: &mut W,
    dec: &mut Decoder<R>,
    fid: u32,
) {
    write_half
        .write_all(&encode(NOTAG, FCall::Tversion { msize: 8192, version: "9P2000".to_owned() }))
        .await
        .unwrap();
    dec.next().await.unwrap();

    write_half
        .write_all(&encode(
            1,
            FCall::Tattach { fid, afid: NOFID, uname: "glenda".into(), aname: "".into() },
        ))
        .await
        .unwrap();
    match dec.next().await.unwrap() {
        Decoded::Msg { body: FCall::Rattach { .. }, .. } => {}
        _ => panic!("expected Rattach"),
    }
}

/// A handler that resolves `/a` and `/a/b` to qids, leaves `/a/b/c` absent,
/// and replies to `Topen` with a never-read `SlowFile` so a caller can
/// exercise `Tflush` against an in-flight `Tread`.
struct ScriptedFs {
    slow_file_closed: Arc<AtomicBool>,
}

struct SlowFile(Arc<AtomicBool>);

#[async_trait]
impl File for SlowFile {
    async fn read_at(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
        Ok(0)
    }
    async fn close(&self) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn qid_for(path: &str) -> Option<Qid> {
    match path {
        "/a" => Some(Qid { typ: QidType::DIR, version: 0, path: 1 }),
        "/a/b" => Some(Qid { typ: QidType::DIR, version: 0, path: 2 }),
        _ => None,
    }
}

impl HandlerFactory for ScriptedFs {
    fn run(&self, mut source: Source) -> futures::future::BoxFuture<'static, ()> {
        let closed = self.slow_file_closed.clone();
        Box::pin(async move {
            while source.next().await {
                let req = source.request();
                match &req.body {
                    SessionRequest::Walk { path } => {
                        req.reply(SessionReply::Walk(qid_for(path)));
                    }
                    SessionRequest::Open { .. } => {
                        let file: Arc<dyn File> = Arc::new(SlowFile(closed.clone()));
                        req.reply(SessionReply::Open {
                            file,
                            qid: Qid { typ: QidType::FILE, version: 0, path: 3 },
                        });
                    }
                    SessionRequest::Read { .. } => {
                        // Never replies: models a file whose read blocks
                        // until the request is cancelled.
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    _ => {
                        req.reply(SessionReply::Error("unexpected request".to_owned()));
                    }
                }
            }
        })
    }
}

fn scripted_config(closed: Arc<AtomicBool>) -> Config {
    Config {
        msize: 8192,
        auth: None,
        handler_factory: Arc::new(ScriptedFs { slow_file_closed: closed }),
    }
}

#[tokio::test]
async fn walk_depth_three_with_a_missing_tail_element_returns_the_found_prefix() {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (server_read, server_write) = tokio::io::split(server_side);
    let conn = Connection::new(server_read, server_write, scripted_config(Arc::new(AtomicBool::new(false))));
    let handle = tokio::spawn(conn.serve());

    let (mut read_half, mut write_half) = tokio::io::split(client_side);
    let mut dec = Decoder::new(&mut read_half, 8192);
    negotiate_and_attach(&mut write_half, &mut dec, 1).await;

    write_half
        .write_all(&encode(
            2,
            FCall::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
            },
        ))
        .await
        .unwrap();

    match dec.next().await.unwrap() {
        Decoded::Msg { tag: 2, body: FCall::Rwalk { wqids } } => {
            assert_eq!(wqids.len(), 2, "expected the found prefix /a, /a/b, not the absent /a/b/c");
            assert_eq!(wqids[0].path, 1);
            assert_eq!(wqids[1].path, 2);
        }
        Decoded::Msg { body, .. } => panic!("expected Rwalk, got {body:?}"),
        Decoded::BadMessage { reason, .. } => panic!("expected Rwalk, got a bad message: {reason}"),
        Decoded::Eof => panic!("expected Rwalk, got eof"),
    }

    drop(write_half);
    let _ = handle.await;
}

#[tokio::test]
async fn flush_cancels_an_in_flight_read_and_closes_its_file() {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (server_read, server_write) = tokio::io::split(server_side);
    let closed = Arc::new(AtomicBool::new(false));
    let conn = Connection::new(server_read, server_write, scripted_config(closed.clone()));
    let handle = tokio::spawn(conn.serve());

    let (mut read_half, mut write_half) = tokio::io::split(client_side);
    let mut dec = Decoder::new(&mut read_half, 8192);
    negotiate_and_attach(&mut write_half, &mut dec, 1).await;

    write_half
        .write_all(&encode(2, FCall::Twalk { fid: 1, newfid: 2, wnames: vec!["a".to_owned()] }))
        .await
        .unwrap();
    dec.next().await.unwrap();

    write_half.write_all(&encode(3, FCall::Topen { fid: 2, mode: 0 })).await.unwrap();
    match dec.next().await.unwrap() {
        Decoded::Msg { tag: 3, body: FCall::Ropen { .. } } => {}
        Decoded::Msg { body, .. } => panic!("expected Ropen, got {body:?}"),
        _ => panic!("expected Ropen"),
    }

    write_half
        .write_all(&encode(5, FCall::Tread { fid: 2, offset: 0, count: 1 << 20 }))
        .await
        .unwrap();
    // Give the read a moment to register as pending before flushing it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    write_half.write_all(&encode(6, FCall::Tflush { oldtag: 5 })).await.unwrap();
    match dec.next().await.unwrap() {
        Decoded::Msg { tag: 6, body: FCall::Rflush } => {}
        Decoded::Msg { body, .. } => panic!("expected Rflush, got {body:?}"),
        _ => panic!("expected Rflush"),
    }

    // No Rread(tag=5) should ever arrive; the connection should stay quiet
    // for this tag. A short race window is acceptable, final state is not.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(closed.load(Ordering::SeqCst), "cancellation must close the slow file");

    drop(write_half);
    let _ = handle.await;
}
