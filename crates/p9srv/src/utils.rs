use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Joins a cleaned absolute path (`base`) with a single walk element,
/// resolving `.` and `..` the way the protocol's walk semantics require
/// (§4.6), without touching the filesystem.
pub fn join(base: &str, elem: &str) -> String {
    if elem == "." || elem.is_empty() {
        return base.to_owned();
    }
    if elem == ".." {
        return match base.rfind('/') {
            Some(0) | None => "/".to_owned(),
            Some(i) => base[..i].to_owned(),
        };
    }
    if base == "/" {
        format!("/{elem}")
    } else {
        format!("{base}/{elem}")
    }
}
