use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Payload too large for a CAN frame")]
    PayloadTooLarge,

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Invalid CAN identifier")]
    InvalidId,

    #[error("Truncated packet payload")]
    Truncated,
}
