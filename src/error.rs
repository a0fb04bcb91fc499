use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Client table is full, or the stream descriptor could not be built.
    TooManyClients,
    /// A writer is already attached to the stream.
    WriterAlreadyActive,
    /// Malformed or out-of-protocol request (bad id, writer seek, overwrite, gap).
    InvalidRequest,
    /// Requested offset falls before the first segment, or a seek walked off
    /// either end of the stream.
    NoData,
    /// The stream directory could not be created.
    AccessDenied,
    /// Datagram that does not decode as a broker message.
    Protocol(&'static str),
    /// Errno from the server that maps to none of the variants above.
    Server(i32),
}

impl Error {
    /// POSIX errno carried in ERROR replies for this kind of failure.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::TooManyClients => libc::EMFILE,
            Error::WriterAlreadyActive => libc::EPERM,
            Error::InvalidRequest => libc::EINVAL,
            Error::NoData => libc::ENODATA,
            Error::AccessDenied => libc::EACCES,
            Error::Protocol(_) => libc::EPROTO,
            Error::Server(code) => *code,
        }
    }

    /// Inverse of [`errno`](Self::errno), used by the client stub to rebuild
    /// the error kind out of an ERROR reply.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::EMFILE => Error::TooManyClients,
            libc::EPERM => Error::WriterAlreadyActive,
            libc::EINVAL => Error::InvalidRequest,
            libc::ENODATA => Error::NoData,
            libc::EACCES => Error::AccessDenied,
            code => Error::Server(code),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::TooManyClients => write!(f, "too many clients"),
            Error::WriterAlreadyActive => write!(f, "writer already active"),
            Error::InvalidRequest => write!(f, "invalid request"),
            Error::NoData => write!(f, "no data at requested offset"),
            Error::AccessDenied => write!(f, "stream directory not accessible"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Server(code) => write!(f, "server error: errno {code}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_round_trips_for_protocol_errors() {
        for err in [
            Error::TooManyClients,
            Error::WriterAlreadyActive,
            Error::InvalidRequest,
            Error::NoData,
            Error::AccessDenied,
        ] {
            let code = err.errno();
            assert_eq!(Error::from_errno(code).errno(), code);
        }
    }

    #[test]
    fn unknown_errno_is_preserved() {
        let err = Error::from_errno(libc::ENOSPC);
        assert!(matches!(err, Error::Server(code) if code == libc::ENOSPC));
    }
}
