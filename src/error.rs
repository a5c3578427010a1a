use thiserror::Error;

/// Errors from decoding a RESP frame off the wire.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown type prefix byte {0:#04x}")]
    UnknownPrefix(u8),
    #[error("malformed integer in RESP frame")]
    MalformedInteger,
    #[error("line did not end in CRLF")]
    MissingCrlf,
    #[error("connection closed mid-frame")]
    ShortRead,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to the client as a `-ERR ...` (or `-WRONGTYPE ...`) reply.
/// The exact `Display` text is part of the wire contract.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdTooSmall,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdNotMonotonic,
    #[error("ERR {0}")]
    Generic(String),
    #[error("ERR no such key")]
    NoSuchKey,
}

impl CommandError {
    pub fn generic(msg: impl Into<String>) -> Self {
        CommandError::Generic(msg.into())
    }
}

/// Errors from decoding the RDB snapshot subset in §4.4.
#[derive(Error, Debug)]
pub enum RdbError {
    #[error("invalid RDB header")]
    InvalidHeader,
    #[error("unsupported RDB value type {0:#04x}")]
    UnsupportedValueType(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the primary/replica handshake dance.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
