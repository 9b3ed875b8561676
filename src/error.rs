//! Crate-wide error taxonomy.
//!
//! Only configuration and device-startup failures are fatal (they abort the
//! caller). Every other error kind named in the specification (filter design
//! and runtime errors, queue overflow, clock regression, sink I/O, subscriber
//! callback failures) is handled in place by logging and degrading; it never
//! surfaces as a `CoreError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("device startup failed: {0}")]
    DeviceStartup(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("sink registration rejected: {0}")]
    SinkRegistration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
