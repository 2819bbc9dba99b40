//! Conversions between `std::fs` metadata and the wire `Stat`/`Qid` types.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use p9srv::fcall::{dm, Qid, QidType, Stat};

pub fn qid_from_metadata(meta: &Metadata) -> Qid {
    let typ = if meta.is_dir() { QidType::DIR } else { QidType::FILE };
    Qid { typ, version: 0, path: meta.ino() }
}

/// Builds a full stat record for `path`'s `meta`. `name` is the entry's
/// own filename, not its full path (the root's name is conventionally
/// empty in 9P2000).
pub fn stat_from_metadata(name: &str, meta: &Metadata) -> Stat {
    let mut mode = (meta.permissions().mode()) & 0o777;
    if meta.is_dir() {
        mode |= dm::DIR;
    }
    Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_metadata(meta),
        mode,
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        length: if meta.is_dir() { 0 } else { meta.len() },
        name: name.to_owned(),
        uid: user_name(meta.uid()),
        gid: group_name(meta.gid()),
        muid: String::new(),
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "/".to_owned())
}

/// Resolves a uid to a login name, falling back to its decimal form when
/// the local user database has no entry (common with containerized
/// uid-mapping setups).
pub fn user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

pub fn group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string())
}

/// Looks up a uid by login name, accepting a bare numeric string as a
/// fallback for names the local user database doesn't know either.
pub fn uid_for_name(name: &str) -> Option<nix::unistd::Uid> {
    if let Ok(user) = nix::unistd::User::from_name(name) {
        return user.map(|u| u.uid);
    }
    name.parse::<u32>().ok().map(nix::unistd::Uid::from_raw)
}

pub fn gid_for_name(name: &str) -> Option<nix::unistd::Gid> {
    if let Ok(group) = nix::unistd::Group::from_name(name) {
        return group.map(|g| g.gid);
    }
    name.parse::<u32>().ok().map(nix::unistd::Gid::from_raw)
}
