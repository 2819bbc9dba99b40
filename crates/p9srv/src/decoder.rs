//! Streaming message decoder (§4.1).

use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::fcall::{Data, FCall, MsgType, Qid, QidType, Stat, MAX_ANAME_LEN,
    MAX_FILENAME_LEN, MAX_UID_LEN, MAX_VERSION_LEN, MAX_WELEM};
use crate::io_err;

/// Fixed portion of every message: size[4] type[1] tag[2].
const HEADER_LEN: u32 = 7;

/// Result of advancing the decoder by one message.
pub enum Decoded {
    /// A well-formed message.
    Msg { tag: u16, body: FCall },
    /// The type byte was unrecognized or the declared length failed the
    /// per-type bound check. The offending bytes have already been
    /// skipped so the stream is realigned for the next call.
    BadMessage { tag: u16, reason: String },
    /// The transport closed cleanly with no partial message pending.
    Eof,
}

/// Reads 9P2000 messages off an `AsyncRead` with a bounded working
/// buffer. Validates framing and field-level constraints (§4.1 point 5)
/// before handing a message back.
pub struct Decoder<R> {
    reader: R,
    /// Negotiated maximum message size; bounds the allocation made for
    /// `Twrite`/`Rread` payloads and the declared-length check for every
    /// other type.
    msize: u32,
    first_error: Option<std::io::Error>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(reader: R, msize: u32) -> Decoder<R> {
        Decoder {
            reader,
            msize,
            first_error: None,
        }
    }

    /// Updates the negotiated message size, called once `Tversion`
    /// negotiation completes.
    pub fn set_msize(&mut self, msize: u32) {
        self.msize = msize;
    }

    /// The first I/O error observed on this decoder, if any.
    pub fn first_error(&self) -> Option<&std::io::Error> {
        self.first_error.as_ref()
    }

    /// Advances to and returns the next message.
    pub async fn next(&mut self) -> std::io::Result<Decoded> {
        let mut header = [0u8; 7];
        match self.read_fill(&mut header).await {
            Ok(0) => return Ok(Decoded::Eof),
            Ok(n) if n < 7 => {
                return Err(self.record(io_err!(
                    UnexpectedEof,
                    "connection closed mid-header"
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(self.record(e)),
        }

        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let type_byte = header[4];
        let tag = u16::from_le_bytes([header[5], header[6]]);

        let msg_type = match MsgType::from_u8(type_byte) {
            Some(t) if t.is_t() => t,
            _ => {
                let body_len = size.saturating_sub(HEADER_LEN);
                self.skip(body_len).await?;
                return Ok(Decoded::BadMessage {
                    tag,
                    reason: format!("unknown message type {type_byte}"),
                });
            }
        };

        if size < HEADER_LEN {
            return Ok(Decoded::BadMessage {
                tag,
                reason: "declared size smaller than header".to_owned(),
            });
        }
        let body_len = size - HEADER_LEN;

        let (min, max) = self.bounds(msg_type);
        if body_len < min || max.is_some_and(|max| body_len > max) {
            self.skip(body_len).await?;
            return Ok(Decoded::BadMessage {
                tag,
                reason: format!("body length {body_len} out of range for {msg_type:?}"),
            });
        }

        let mut body = vec![0u8; body_len as usize];
        if let Err(e) = self.read_fill(&mut body).await {
            return Err(self.record(e));
        }

        match self.parse_body(msg_type, &body) {
            Ok(fcall) => Ok(Decoded::Msg { tag, body: fcall }),
            Err(reason) => Ok(Decoded::BadMessage { tag, reason }),
        }
    }

    /// Per-type body-length bounds (excluding the 7-byte fixed header).
    /// `None` for the upper bound means "bounded by the negotiated
    /// msize", computed against `self.msize` rather than a constant.
    fn bounds(&self, t: MsgType) -> (u32, Option<u32>) {
        use MsgType::*;
        let max_version = (2 + MAX_VERSION_LEN) as u32;
        let max_uname = (2 + MAX_UID_LEN) as u32;
        let max_aname = (2 + MAX_ANAME_LEN) as u32;
        let max_wname = (2 + MAX_FILENAME_LEN) as u32;
        let max_stat = stat_max_body();
        match t {
            Tversion => (6, Some(max_version)),
            Tauth => (8, Some(4 + max_uname + max_aname)),
            Tattach => (12, Some(8 + max_uname + max_aname)),
            Tflush => (2, Some(2)),
            Twalk => (10, Some(10 + MAX_WELEM as u32 * max_wname)),
            Topen => (5, Some(5)),
            Tcreate => (11, Some(8 + max_wname)),
            Tread => (16, Some(16)),
            Twrite => (16, Some(16 + self.msize)),
            Tclunk => (4, Some(4)),
            Tremove => (4, Some(4)),
            Tstat => (4, Some(4)),
            Twstat => (6, Some(6 + max_stat)),
            _ => (0, Some(self.msize)),
        }
    }

    fn parse_body(&self, t: MsgType, body: &[u8]) -> Result<FCall, String> {
        let mut cur = Cursor { buf: body, pos: 0 };
        let fcall = match t {
            MsgType::Tversion => FCall::Tversion {
                msize: cur.u32()?,
                version: cur.string(MAX_VERSION_LEN)?,
            },
            MsgType::Tauth => FCall::Tauth {
                afid: cur.u32()?,
                uname: cur.string(MAX_UID_LEN)?,
                aname: cur.string(MAX_ANAME_LEN)?,
            },
            MsgType::Tattach => FCall::Tattach {
                fid: cur.u32()?,
                afid: cur.u32()?,
                uname: cur.string(MAX_UID_LEN)?,
                aname: cur.string(MAX_ANAME_LEN)?,
            },
            MsgType::Tflush => FCall::Tflush { oldtag: cur.u16()? },
            MsgType::Twalk => {
                let fid = cur.u32()?;
                let newfid = cur.u32()?;
                let n = cur.u16()? as usize;
                if n > MAX_WELEM {
                    return Err("too many walk elements".to_owned());
                }
                let mut wnames = Vec::with_capacity(n);
                for _ in 0..n {
                    wnames.push(cur.string(MAX_FILENAME_LEN)?);
                }
                FCall::Twalk { fid, newfid, wnames }
            }
            MsgType::Topen => FCall::Topen {
                fid: cur.u32()?,
                mode: cur.u8()?,
            },
            MsgType::Tcreate => FCall::Tcreate {
                fid: cur.u32()?,
                name: cur.string(MAX_FILENAME_LEN)?,
                perm: cur.u32()?,
                mode: cur.u8()?,
            },
            MsgType::Tread => FCall::Tread {
                fid: cur.u32()?,
                offset: cur.u64()?,
                count: cur.u32()?,
            },
            MsgType::Twrite => {
                let fid = cur.u32()?;
                let offset = cur.u64()?;
                let count = cur.u32()?;
                let data = cur.data(count as usize)?;
                FCall::Twrite { fid, offset, data }
            }
            MsgType::Tclunk => FCall::Tclunk { fid: cur.u32()? },
            MsgType::Tremove => FCall::Tremove { fid: cur.u32()? },
            MsgType::Tstat => FCall::Tstat { fid: cur.u32()? },
            MsgType::Twstat => {
                let fid = cur.u32()?;
                let stat = cur.stat()?;
                FCall::Twstat { fid, stat }
            }
            _ => return Err(format!("{t:?} is not a client-originated message")),
        };
        if cur.pos != body.len() {
            return Err("trailing bytes in message body".to_owned());
        }
        Ok(fcall)
    }

    async fn read_fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.reader.read(&mut buf[total..]).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
        Ok(total)
    }

    async fn skip(&mut self, mut n: u32) -> std::io::Result<()> {
        let mut scratch = [0u8; 1024];
        while n > 0 {
            let take = n.min(scratch.len() as u32) as usize;
            let got = self.reader.read(&mut scratch[..take]).await?;
            if got == 0 {
                break;
            }
            n -= got as u32;
        }
        Ok(())
    }

    fn record(&mut self, e: std::io::Error) -> std::io::Error {
        let kind = e.kind();
        let msg = e.to_string();
        if self.first_error.is_none() {
            self.first_error = Some(std::io::Error::new(kind, msg.clone()));
        }
        std::io::Error::new(kind, msg)
    }
}

fn stat_max_body() -> u32 {
    let fixed = 2 + 4 + 13 + 4 + 4 + 4 + 8u32; // typ dev qid mode atime mtime length
    let name = (2 + MAX_FILENAME_LEN) as u32;
    let uid = (2 + MAX_UID_LEN) as u32;
    2 + fixed + name + uid + uid + uid // leading stat-size prefix + body + name + uid + gid + muid
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err("message body truncated".to_owned());
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self, max_len: usize) -> Result<String, String> {
        let len = self.u16()? as usize;
        if len > max_len {
            return Err(format!("string of length {len} exceeds limit {max_len}"));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "invalid UTF-8 in string field".to_owned())
    }

    fn data(&mut self, len: usize) -> Result<Data, String> {
        Ok(Data(self.take(len)?.to_vec()))
    }

    fn qid(&mut self) -> Result<Qid, String> {
        let typ = self.u8()?;
        let typ = QidType::from_bits(typ).ok_or_else(|| "invalid qid type bits".to_owned())?;
        let version = self.u32()?;
        let path = self.u64()?;
        Ok(Qid { typ, version, path })
    }

    fn stat(&mut self) -> Result<Stat, String> {
        let _size = self.u16()?; // redundant inner length, validated by caller's bound check
        let typ = self.u16()?;
        let dev = self.u32()?;
        let qid = self.qid()?;
        let mode = self.u32()?;
        let atime = self.u32()?;
        let mtime = self.u32()?;
        let length = self.u64()?;
        let name = self.string(MAX_FILENAME_LEN)?;
        let uid = self.string(MAX_UID_LEN)?;
        let gid = self.string(MAX_UID_LEN)?;
        let muid = self.string(MAX_UID_LEN)?;
        Ok(Stat {
            typ,
            dev,
            qid,
            mode,
            atime,
            mtime,
            length,
            name,
            uid,
            gid,
            muid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Msg, NOTAG};
    use crate::serialize::write_msg;

    async fn roundtrip(body: FCall, tag: u16) -> Decoded {
        let mut bytes = Vec::new();
        write_msg(&mut bytes, &Msg { tag, body }).unwrap();
        let mut dec = Decoder::new(&bytes[..], 8192);
        dec.next().await.unwrap()
    }

    #[tokio::test]
    async fn decodes_a_well_formed_tversion() {
        let body = FCall::Tversion {
            msize: 8192,
            version: "9P2000".to_owned(),
        };
        match roundtrip(body, NOTAG).await {
            Decoded::Msg { tag, body: FCall::Tversion { msize, version } } => {
                assert_eq!(tag, NOTAG);
                assert_eq!(msize, 8192);
                assert_eq!(version, "9P2000");
            }
            _ => panic!("expected Tversion"),
        }
    }

    #[tokio::test]
    async fn unknown_type_byte_yields_bad_message_and_resyncs() {
        let mut bytes = Vec::new();
        // declared size 7 (header only), bogus type 200, tag 1
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.push(200);
        bytes.extend_from_slice(&1u16.to_le_bytes());
        // A well-formed Tclunk follows.
        let mut dec_bytes = bytes.clone();
        write_msg(
            &mut dec_bytes,
            &Msg {
                tag: 2,
                body: FCall::Tclunk { fid: 9 },
            },
        )
        .unwrap();

        let mut dec = Decoder::new(&dec_bytes[..], 8192);
        match dec.next().await.unwrap() {
            Decoded::BadMessage { tag, .. } => assert_eq!(tag, 1),
            _ => panic!("expected BadMessage"),
        }
        match dec.next().await.unwrap() {
            Decoded::Msg { tag, body: FCall::Tclunk { fid } } => {
                assert_eq!(tag, 2);
                assert_eq!(fid, 9);
            }
            _ => panic!("expected Tclunk to decode after the bad message"),
        }
    }

    #[tokio::test]
    async fn eof_with_no_bytes_is_not_an_error() {
        let bytes: Vec<u8> = Vec::new();
        let mut dec = Decoder::new(&bytes[..], 8192);
        match dec.next().await.unwrap() {
            Decoded::Eof => {}
            _ => panic!("expected Eof"),
        }
    }

    #[tokio::test]
    async fn walk_with_too_many_elements_is_rejected() {
        let wnames: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
        let body = FCall::Twalk {
            fid: 1,
            newfid: 2,
            wnames,
        };
        // Hand-encode since Encodable would also refuse an oversized body
        // at the sender; here we want the decoder's own check exercised
        // against a raw, intentionally-too-long byte stream.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&20u16.to_le_bytes());
        for i in 0..20u16 {
            let name = format!("e{i}");
            raw.extend_from_slice(&(name.len() as u16).to_le_bytes());
            raw.extend_from_slice(name.as_bytes());
        }
        let size = HEADER_LEN + raw.len() as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.push(MsgType::Twalk as u8);
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&raw);

        let mut dec = Decoder::new(&bytes[..], 8192);
        match dec.next().await.unwrap() {
            Decoded::BadMessage { tag, .. } => assert_eq!(tag, 3),
            other => panic!("expected BadMessage, got a differently-shaped result: {:?}", matches!(other, Decoded::Msg{..})),
        }
        let _ = body; // constructed only to document the equivalent valid shape
    }
}
