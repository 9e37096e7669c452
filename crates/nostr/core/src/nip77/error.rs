use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip77Error {
    #[error("invalid negentropy protocol version byte: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("unsupported negentropy protocol version requested: {0:#04x}")]
    UnsupportedProtocolVersion(u8),

    #[error("empty negentropy message")]
    EmptyMessage,

    #[error("invalid mode: {0}")]
    InvalidMode(u64),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("varint decode error: {0}")]
    VarintDecode(String),

    #[error("invalid bound: {0}")]
    InvalidBound(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("storage already sealed")]
    AlreadySealed,

    #[error("storage not sealed")]
    NotSealed,

    #[error("duplicate item in storage")]
    DuplicateItem,

    #[error("frame size limit too small: {0} (minimum 4096)")]
    FrameSizeLimitTooSmall(usize),

    #[error("already initiated")]
    AlreadyInitiated,
}

pub type Result<T> = std::result::Result<T, Nip77Error>;
