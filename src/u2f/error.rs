use std::io::Error as IoError;

use base64::DecodeError;
use ring::error::{KeyRejected, Unspecified};
use serde_json::Error as JsonError;

use crate::u2f::proto::der::DerError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("DER: {0}")]
    Der(#[from] DerError),
    #[error("Certificate: {0}")]
    CertParse(String),
    #[error("Registration format: {0}")]
    Format(String),
    #[error("Validation: {0}")]
    Validation(String),
    #[error("Crypto: {0}")]
    Crypto(String),
    #[error("Base64: {0}")]
    Base64(#[from] DecodeError),
    #[error("JSON: {0}")]
    Json(#[from] JsonError),
    #[error("I/O: {0}")]
    Io(#[from] IoError),
}

impl From<Unspecified> for Error {
    fn from(_: Unspecified) -> Self {
        Error::Crypto("Unspecified".to_string())
    }
}

impl From<KeyRejected> for Error {
    fn from(e: KeyRejected) -> Self {
        Error::Crypto(format!("Key rejected: {}", e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
