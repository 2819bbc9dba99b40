//! Wstat demultiplexer (§4.7): splits one `Twstat` into independent
//! typed sub-requests and joins their replies.

use crate::error::string;
use crate::fcall::Stat;

/// One of the typed operations a `Twstat` can carry. A single `Twstat`
/// may decompose into more than one of these (e.g. a rename that also
/// changes the mode).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubRequest {
    Utimes { atime: u32, mtime: u32 },
    Chown { uid: String, gid: String },
    Rename { old_path: String, new_name: String },
    Truncate { size: u64 },
    Chmod { mode: u32 },
    /// Emitted when every field in the stat is the sentinel value: a
    /// bare "flush this file to durable storage" request.
    Sync,
}

impl SubRequest {
    /// The default `Rerror` text if nothing answers this sub-request,
    /// per the table in §4.7.
    pub fn default_error(&self) -> &'static str {
        match self {
            SubRequest::Sync => string::ENOSYS_SYNC,
            _ => string::EACCES,
        }
    }
}

/// Inspects an incoming `Twstat` stat record and emits the sub-requests
/// its non-sentinel fields imply.
pub fn demultiplex(current_path: &str, stat: &Stat) -> Vec<SubRequest> {
    let unset = Stat::unset();
    let mut reqs = Vec::new();

    if stat.atime != unset.atime || stat.mtime != unset.mtime {
        reqs.push(SubRequest::Utimes { atime: stat.atime, mtime: stat.mtime });
    }
    if !stat.uid.is_empty() || !stat.gid.is_empty() {
        reqs.push(SubRequest::Chown { uid: stat.uid.clone(), gid: stat.gid.clone() });
    }
    let current_name = current_path.rsplit('/').next().unwrap_or(current_path);
    if !stat.name.is_empty() && stat.name != current_name {
        reqs.push(SubRequest::Rename {
            old_path: current_path.to_owned(),
            new_name: stat.name.clone(),
        });
    }
    if stat.length != unset.length {
        reqs.push(SubRequest::Truncate { size: stat.length });
    }
    if stat.mode != unset.mode {
        reqs.push(SubRequest::Chmod { mode: stat.mode });
    }

    if reqs.is_empty() {
        reqs.push(SubRequest::Sync);
    }
    reqs
}

/// Aggregates the replies to a demultiplexed `Twstat`: `Rwstat` if at
/// least one sub-request succeeded, else `Rerror` with the last failure.
pub fn aggregate(replies: &[Result<(), String>]) -> Result<(), String> {
    let mut last_error = None;
    for reply in replies {
        if reply.is_ok() {
            return Ok(());
        }
        if let Err(e) = reply {
            last_error = Some(e.clone());
        }
    }
    Err(last_error.unwrap_or_else(|| string::EACCES.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Qid, QidType};

    fn unset_with(f: impl FnOnce(&mut Stat)) -> Stat {
        let mut s = Stat::unset();
        f(&mut s);
        s
    }

    #[test]
    fn all_sentinel_emits_one_sync() {
        let stat = Stat::unset();
        let reqs = demultiplex("/a", &stat);
        assert_eq!(reqs, vec![SubRequest::Sync]);
    }

    #[test]
    fn name_only_change_emits_one_rename() {
        let stat = unset_with(|s| s.name = "b".to_owned());
        let reqs = demultiplex("/a", &stat);
        assert_eq!(
            reqs,
            vec![SubRequest::Rename { old_path: "/a".to_owned(), new_name: "b".to_owned() }]
        );
    }

    #[test]
    fn same_name_is_not_a_rename() {
        let stat = unset_with(|s| s.name = "a".to_owned());
        let reqs = demultiplex("/a", &stat);
        assert_eq!(reqs, vec![SubRequest::Sync]);
    }

    #[test]
    fn mode_and_length_together_emit_two_sub_requests() {
        let stat = unset_with(|s| {
            s.mode = 0o644;
            s.length = 10;
        });
        let reqs = demultiplex("/a", &stat);
        assert_eq!(
            reqs,
            vec![SubRequest::Truncate { size: 10 }, SubRequest::Chmod { mode: 0o644 }]
        );
    }

    #[test]
    fn aggregate_succeeds_if_any_sub_reply_succeeded() {
        let replies = vec![Err("permission denied".to_owned()), Ok(())];
        assert_eq!(aggregate(&replies), Ok(()));
    }

    #[test]
    fn aggregate_fails_with_the_last_error_when_all_fail() {
        let replies = vec![Err("first".to_owned()), Err("second".to_owned())];
        assert_eq!(aggregate(&replies), Err("second".to_owned()));
    }

    #[test]
    fn qid_field_changes_alone_do_not_trigger_a_sub_request() {
        let stat = unset_with(|s| s.qid = Qid { typ: QidType::FILE, version: 0, path: 5 });
        let reqs = demultiplex("/a", &stat);
        assert_eq!(reqs, vec![SubRequest::Sync]);
    }
}
