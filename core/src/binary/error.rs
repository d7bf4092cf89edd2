use thiserror::Error;

#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("Unexpected end of binary data")]
    UnexpectedEof,
    #[error("Received empty data where payload was expected")]
    EmptyData,
    #[error("Invalid content marker: {0}")]
    InvalidContentMarker(u8),
    #[error("Data is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Zlib decompression error: {0}")]
    Zlib(String),
    #[error("Node nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("Leftover data after decoding: {0} bytes")]
    LeftoverData(usize),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
