use std::fmt;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Component level errors. Each variant maps onto a distinct negative
/// integer code; code 0 is reserved for success.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    InvalidParam,
    QueueFull,
    QueueEmpty,
    PoolExhausted,
    TableFull,
    DuplicateSession,
    NoSuchSession,
    UnknownProtocol,
    MalformedPacket,
    BufferOverrun,
}

pub const SUCCESS: i32 = 0;

impl Error {
    #[inline]
    pub fn code(self) -> i32 {
        match self {
            Error::InvalidParam => -1,
            Error::QueueFull => -2,
            Error::QueueEmpty => -3,
            Error::PoolExhausted => -4,
            Error::TableFull => -5,
            Error::DuplicateSession => -6,
            Error::NoSuchSession => -7,
            Error::UnknownProtocol => -8,
            Error::MalformedPacket => -9,
            Error::BufferOverrun => -10,
        }
    }
}

#[inline]
pub fn is_success(code: i32) -> bool {
    code == SUCCESS
}

/// Human readable description for an error code, including codes produced
/// by foreign feeds. Unknown codes get a fixed fallback string.
pub fn error_string(code: i32) -> &'static str {
    match code {
        SUCCESS => "success",
        -1 => "invalid parameter",
        -2 => "queue full",
        -3 => "queue empty",
        -4 => "pool exhausted",
        -5 => "session table full",
        -6 => "duplicate session",
        -7 => "no such session",
        -8 => "unknown protocol",
        -9 => "malformed packet",
        -10 => "buffer overrun",
        _ => "unrecognized error code",
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(error_string(self.code()))
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_distinct_and_negative() {
        let all = [
            Error::InvalidParam,
            Error::QueueFull,
            Error::QueueEmpty,
            Error::PoolExhausted,
            Error::TableFull,
            Error::DuplicateSession,
            Error::NoSuchSession,
            Error::UnknownProtocol,
            Error::MalformedPacket,
            Error::BufferOverrun,
        ];

        for (i, err) in all.iter().enumerate() {
            assert!(err.code() < 0);

            for other in &all[i + 1..] {
                assert_ne!(err.code(), other.code());
            }
        }
    }

    #[test]
    fn test_error_string_round_trip() {
        assert_eq!(error_string(Error::QueueFull.code()), "queue full");
        assert_eq!(format!("{}", Error::TableFull), "session table full");
        assert_eq!(error_string(-12345), "unrecognized error code");
    }

    #[test]
    fn test_is_success() {
        assert!(is_success(0));
        assert!(!is_success(Error::InvalidParam.code()));
    }
}
