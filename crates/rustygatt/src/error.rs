//! Error types for the rustygatt library
//!
//! `GattError` covers every failure a session call reports synchronously. Remote
//! outcomes arrive later as a [`GattStatus`](crate::gatt::GattStatus) on the callback.

use crate::gatt::types::AttributeKey;
use thiserror::Error;

/// Failure to hand a request to the peripheral service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The service cannot accept another write right now
    #[error("Write request busy")]
    Busy,

    #[error("Peripheral service channel error: {0}")]
    Channel(String),
}

/// Errors returned synchronously by session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Session is closed")]
    Closed,

    #[error("Client is not registered with the peripheral service")]
    NotRegistered,

    #[error("Already connecting or connected")]
    AlreadyConnecting,

    #[error("Attribute not found: {0}")]
    AttributeNotFound(AttributeKey),

    #[error("Attribute {0} does not permit this operation")]
    NotPermitted(AttributeKey),

    #[error("Attribute value too long: {len} bytes (max {max})")]
    ValueTooLong { len: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Another attribute operation is outstanding")]
    DeviceBusy,

    #[error("Write request busy after {attempts} attempts")]
    WriteRequestBusy { attempts: u32 },

    #[error("A reliable write is already in progress")]
    ReliableWriteInProgress,

    #[error("No reliable write in progress")]
    NoReliableWrite,

    #[error("Submission failed: {0}")]
    Submit(SubmitError),
}

impl From<SubmitError> for GattError {
    fn from(err: SubmitError) -> Self {
        GattError::Submit(err)
    }
}
