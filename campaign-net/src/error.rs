use num_enum::TryFromPrimitiveError;
use thiserror::Error;

use crate::msg::MessageType;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out")]
    TimedOut,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("handshake failed, got: {0}")]
    HandshakeFailed(String),
    #[error("unexpected message: expected {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("io error: {0}")]
    IoError(String),

    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("unknown message code: {0}")]
    UnknownMsgCode(#[from] TryFromPrimitiveError<MessageType>),

    #[error("core error: {0}")]
    CoreError(#[from] campaign_core::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::IoError(e.to_string()),
        }
    }
}

impl From<Error> for campaign_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::CoreError(e) => e,
            Error::Rejected(reason) => campaign_core::Error::MalformedOutput(reason),
            Error::TimedOut => campaign_core::Error::TimedOut("waiting for the runner".to_string()),
            e => campaign_core::Error::IoError(e.to_string()),
        }
    }
}
