use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetcapError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("defragmentation failed: {0}")]
    Defrag(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("record emission failed: {0}")]
    Record(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetcapError>;
