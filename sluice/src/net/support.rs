use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Network level errors are split into the retryable and the fatal. `Wait`
/// means the operation cannot make progress until the socket becomes ready
/// again or more bytes arrive; everything else closes the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The peer closed its end of the connection.
    Closed,
    /// The payload could not be parsed as the detected protocol.
    Malformed,
    /// No protocol matched the inbound bytes.
    Unidentified,
    /// A reply did not fit the connection's write buffer.
    WriteOverrun,
    /// An internal invariant was violated; the connection is abandoned.
    Invariant,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::Interrupted => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Convenience checks used by the reactor to fold results.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetError::Fatal(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);

        let err: NetError = io::Error::from(io::ErrorKind::Interrupted).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_has_failed() {
        let ok: NetResult<()> = Ok(());
        let wait: NetResult<()> = Err(NetError::Wait);
        let fatal: NetResult<()> = Err(NetError::Fatal(ErrorKind::Malformed));

        assert!(!ok.has_failed());
        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
    }
}
