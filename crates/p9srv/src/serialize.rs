//! Serialize/deserialize 9P2000 messages into/from binary.
//!
//! This module is the "wire primitives" layer: little-endian integer
//! packing and the `Encodable`/`Decodable` traits for every field shape in
//! §6 of the protocol. It knows nothing about framing, bounded buffers, or
//! streamed payloads — that lives in [`crate::decoder`] and
//! [`crate::encoder`].

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing-specific result, to overload operators on `Result`.
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper around `WriteBytesExt` to provide operator overloads for
/// serializing.
///
/// `<<` serializes the right-hand side argument into the left-hand side
/// encoder.
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: `encoder << data`.
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper around `ReadBytesExt` to provide operator overloads for
/// deserializing.
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A type which can be serialized into 9P2000 binary.
pub trait Encodable {
    /// Encode self to `w`, returning the number of bytes written.
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        // size[2] precedes the body; it is the body length, not counting
        // itself.
        let body_len = self.size();
        match Encoder::new(w)
            << &body_len
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion { ref msize, ref version } => buf << msize << version,
            Rversion { ref msize, ref version } => buf << msize << version,
            Tauth { ref afid, ref uname, ref aname } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach { ref fid, ref afid, ref uname, ref aname } => {
                buf << fid << afid << uname << aname
            }
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk { ref fid, ref newfid, ref wnames } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen { ref qid, ref iounit } => buf << qid << iounit,
            Tcreate { ref fid, ref name, ref perm, ref mode } => {
                buf << fid << name << perm << mode
            }
            Rcreate { ref qid, ref iounit } => buf << qid << iounit,
            Tread { ref fid, ref offset, ref count } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite { ref fid, ref offset, ref data } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            Rstat { ref stat } => buf << stat,
            Twstat { ref fid, ref stat } => buf << fid << stat,
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// A type which can be deserialized from 9P2000 binary.
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "invalid UTF-8 in string field"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _body_len: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(Tversion) => FCall::Tversion { msize: decode!(buf), version: decode!(buf) },
            Some(Rversion) => FCall::Rversion { msize: decode!(buf), version: decode!(buf) },
            Some(Tauth) => FCall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rauth) => FCall::Rauth { aqid: decode!(buf) },
            Some(Tattach) => FCall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rattach) => FCall::Rattach { qid: decode!(buf) },
            Some(Rerror) => FCall::Rerror { ename: decode!(buf) },
            Some(Tflush) => FCall::Tflush { oldtag: decode!(buf) },
            Some(Rflush) => FCall::Rflush,
            Some(Twalk) => FCall::Twalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(Rwalk) => FCall::Rwalk { wqids: decode!(buf) },
            Some(Topen) => FCall::Topen { fid: decode!(buf), mode: decode!(buf) },
            Some(Ropen) => FCall::Ropen { qid: decode!(buf), iounit: decode!(buf) },
            Some(Tcreate) => FCall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(Rcreate) => FCall::Rcreate { qid: decode!(buf), iounit: decode!(buf) },
            Some(Tread) => FCall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(Rread) => FCall::Rread { data: decode!(buf) },
            Some(Twrite) => FCall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(Rwrite) => FCall::Rwrite { count: decode!(buf) },
            Some(Tclunk) => FCall::Tclunk { fid: decode!(buf) },
            Some(Rclunk) => FCall::Rclunk,
            Some(Tremove) => FCall::Tremove { fid: decode!(buf) },
            Some(Rremove) => FCall::Rremove,
            Some(Tstat) => FCall::Tstat { fid: decode!(buf) },
            Some(Rstat) => FCall::Rstat { stat: decode!(buf) },
            Some(Twstat) => FCall::Twstat { fid: decode!(buf), stat: decode!(buf) },
            Some(Rwstat) => FCall::Rwstat,
            None => return res!(io_err!(InvalidData, "unknown message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Read one 9P message from a byte-oriented reader (no framing, no bounds
/// checking — used for tests and by [`crate::decoder`] once a full body
/// has been buffered).
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Write one 9P message to a byte-oriented writer (no framing).
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encoder_writes_bytes_in_order() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10u8 {
            (&i).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn version_round_trips() {
        let expected = Msg {
            tag: 0xdead,
            body: FCall::Rversion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn walk_round_trips() {
        let expected = Msg {
            tag: 7,
            body: FCall::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
            },
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();
        let mut readbuf = Cursor::new(buf);
        let actual = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn stat_round_trips() {
        let stat = Stat {
            typ: 0,
            dev: 0,
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: 42,
            },
            mode: dm::DIR | 0o755,
            atime: 1,
            mtime: 2,
            length: 0,
            name: "root".to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "".to_owned(),
        };
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();
        let mut readbuf = Cursor::new(buf);
        let decoded: Stat = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(stat, decoded);
    }

    #[test]
    fn invalid_utf8_string_is_rejected() {
        // len=1, followed by an invalid UTF-8 byte.
        let bytes: Vec<u8> = vec![1, 0, 0xff];
        let mut readbuf = Cursor::new(bytes);
        let result: Result<String> = Decodable::decode(&mut readbuf);
        assert!(result.is_err());
    }
}
