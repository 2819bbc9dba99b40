//! 9P2000 protocol data types and constants.
//!
//! # Protocol
//! 9P2000 (see the Plan 9 manual, §5 `intro`)

use bitflags::bitflags;
use enum_primitive::*;

/// The only version string this server understands.
pub const P92000: &str = "9P2000";

/// The version string `Rversion` carries when the server does not
/// recognize the client's proposed version.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`.
pub const NOFID: u32 = !0;

/// Room for `Tread`/`Twrite`/`Rread` header: size[4] type[1] tag[2] fid[4]
/// offset[8] count[4].
pub const IOHDRSZ: u32 = 23;

/// Maximum number of path elements in a single `Twalk`.
pub const MAX_WELEM: usize = 16;

/// Maximum length in bytes of a single filename/path element.
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum length in bytes of a uid/gid/muid string.
pub const MAX_UID_LEN: usize = 45;

/// Maximum length in bytes of the version string.
pub const MAX_VERSION_LEN: usize = 20;

/// Maximum length in bytes of an `Rerror` message.
pub const MAX_ERROR_LEN: usize = 512;

/// Maximum length in bytes of the `aname` attach string.
pub const MAX_ANAME_LEN: usize = 255;

/// Lower bound on the decoder's working buffer: enough for the fixed
/// header plus the largest possible `Twalk` path list.
pub const MIN_BUF_SIZE: usize = MAX_WELEM * (MAX_FILENAME_LEN + 2) + 17;

/// Default decoder/encoder buffer size, comfortably above [`MIN_BUF_SIZE`].
pub const DEFAULT_MSIZE: u32 = 8192;

bitflags! {
    /// Bits in `Qid.typ`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append-only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive-use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channels"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication files"]
        const AUTH      = 0x08;
        #[doc = "Type bit for non-backed-up files"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// Bits in `Stat.mode` / `Topen`'s open mode byte.
pub mod dm {
    /// Mode bit for directories.
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append-only files.
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive-use files.
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channels.
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication files.
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files.
    pub const TMP: u32 = 0x04000000;
    /// Owner read permission.
    pub const READ: u32 = 0x4;
    /// Owner write permission.
    pub const WRITE: u32 = 0x2;
    /// Owner execute permission.
    pub const EXEC: u32 = 0x1;
}

/// `Topen`/`Tcreate` mode byte: the low two bits select the I/O direction,
/// the high bits are flags.
pub mod om {
    /// Open for read.
    pub const READ: u8 = 0;
    /// Open for write.
    pub const WRITE: u8 = 1;
    /// Open for read and write.
    pub const RDWR: u8 = 2;
    /// Open for execute (checked like read, but against the execute bit).
    pub const EXEC: u8 = 3;
    /// Or'ed in: truncate the file before use.
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in: remove the file when the fid that opened it is clunked.
    pub const RCLOSE: u8 = 0x40;
}

/// Server-assigned unique identity of a file: type, version, and path.
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Directory, append-only, exclusive-use, etc.
    pub typ: QidType,
    /// Incremented whenever the file is modified.
    pub version: u32,
    /// Unique among all files on this connection for the life of the path.
    pub path: u64,
}

/// The on-wire file metadata record.
///
/// Fields use sentinel ("don't touch") values when carried in a `Twstat`
/// to mean "leave this field unchanged": all-ones for integral fields,
/// the empty string for text fields. See [`crate::wstat`].
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type; opaque to this implementation, round-tripped as-is.
    pub typ: u16,
    /// Server subtype; opaque to this implementation, round-tripped as-is.
    pub dev: u32,
    /// This file's qid.
    pub qid: Qid,
    /// Permission bits plus the `dm::*` type bits.
    pub mode: u32,
    /// Last access time, POSIX seconds.
    pub atime: u32,
    /// Last modification time, POSIX seconds.
    pub mtime: u32,
    /// File length in bytes.
    pub length: u64,
    /// Last path element (the file's own name).
    pub name: String,
    /// Owner name.
    pub uid: String,
    /// Group name.
    pub gid: String,
    /// Name of the user who last modified the file.
    pub muid: String,
}

impl Stat {
    /// All-sentinel stat: every field means "don't touch" when used in a
    /// `Twstat`.
    pub fn unset() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::empty(),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// The encoded size of this stat's body, not counting the leading
    /// 2-byte size prefix written by [`crate::serialize`].
    pub fn size(&self) -> u16 {
        (2 + 2 + 4 + self.qid.encoded_len() + 4 + 4 + 4 + 8
            + 2 + self.name.len()
            + 2 + self.uid.len()
            + 2 + self.gid.len()
            + 2 + self.muid.len()) as u16
    }
}

impl Qid {
    /// Fixed on-wire length of a qid: 1 + 4 + 8 bytes.
    pub fn encoded_len(&self) -> usize {
        13
    }
}

/// Payload carried by `Twrite`/`Rread`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    /// 9P2000 message type tag.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion    = 100,
        Rversion    = 101,
        Tauth       = 102,
        Rauth       = 103,
        Tattach     = 104,
        Rattach     = 105,
        // Terror is illegal, never sent on the wire.
        Rerror      = 107,
        Tflush      = 108,
        Rflush      = 109,
        Twalk       = 110,
        Rwalk       = 111,
        Topen       = 112,
        Ropen       = 113,
        Tcreate     = 114,
        Rcreate     = 115,
        Tread       = 116,
        Rread       = 117,
        Twrite      = 118,
        Rwrite      = 119,
        Tclunk      = 120,
        Rclunk      = 121,
        Tremove     = 122,
        Rremove     = 123,
        Tstat       = 124,
        Rstat       = 125,
        Twstat      = 126,
        Rwstat      = 127,
    }
}

impl MsgType {
    /// Whether this is a client-originated (`T`) message.
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// Whether this is a server-originated (`R`) message.
    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::Tversion { .. } => MsgType::Tversion,
            FCall::Rversion { .. } => MsgType::Rversion,
            FCall::Tauth { .. } => MsgType::Tauth,
            FCall::Rauth { .. } => MsgType::Rauth,
            FCall::Tattach { .. } => MsgType::Tattach,
            FCall::Rattach { .. } => MsgType::Rattach,
            FCall::Rerror { .. } => MsgType::Rerror,
            FCall::Tflush { .. } => MsgType::Tflush,
            FCall::Rflush => MsgType::Rflush,
            FCall::Twalk { .. } => MsgType::Twalk,
            FCall::Rwalk { .. } => MsgType::Rwalk,
            FCall::Topen { .. } => MsgType::Topen,
            FCall::Ropen { .. } => MsgType::Ropen,
            FCall::Tcreate { .. } => MsgType::Tcreate,
            FCall::Rcreate { .. } => MsgType::Rcreate,
            FCall::Tread { .. } => MsgType::Tread,
            FCall::Rread { .. } => MsgType::Rread,
            FCall::Twrite { .. } => MsgType::Twrite,
            FCall::Rwrite { .. } => MsgType::Rwrite,
            FCall::Tclunk { .. } => MsgType::Tclunk,
            FCall::Rclunk => MsgType::Rclunk,
            FCall::Tremove { .. } => MsgType::Tremove,
            FCall::Rremove => MsgType::Rremove,
            FCall::Tstat { .. } => MsgType::Tstat,
            FCall::Rstat { .. } => MsgType::Rstat,
            FCall::Twstat { .. } => MsgType::Twstat,
            FCall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A decoded 9P2000 message body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    Tauth { afid: u32, uname: String, aname: String },
    Rauth { aqid: Qid },
    Tattach { fid: u32, afid: u32, uname: String, aname: String },
    Rattach { qid: Qid },
    Rerror { ename: String },
    Tflush { oldtag: u16 },
    Rflush,
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { wqids: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    Tcreate { fid: u32, name: String, perm: u32, mode: u8 },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Data },
    Twrite { fid: u32, offset: u64, data: Data },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Stat },
    Twstat { fid: u32, stat: Stat },
    Rwstat,
}

impl FCall {
    /// The fid(s) this message references, for routing by the connection.
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::Twalk { fid, .. } => vec![fid],
            FCall::Topen { fid, .. } => vec![fid],
            FCall::Tcreate { fid, .. } => vec![fid],
            FCall::Tread { fid, .. } => vec![fid],
            FCall::Twrite { fid, .. } => vec![fid],
            FCall::Tclunk { fid } => vec![fid],
            FCall::Tremove { fid } => vec![fid],
            FCall::Tstat { fid } => vec![fid],
            FCall::Twstat { fid, .. } => vec![fid],
            FCall::Tattach { afid, .. } if afid != NOFID => vec![afid],
            _ => Vec::new(),
        }
    }

    /// The newfid this message introduces, if any.
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            FCall::Tauth { afid, .. } => Some(afid),
            FCall::Tattach { fid, .. } => Some(fid),
            FCall::Twalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }
}

/// Envelope for 9P2000 messages: the client-chosen tag plus the body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen by the client; the reply carries the same tag.
    pub tag: u16,
    /// The message body.
    pub body: FCall,
}
