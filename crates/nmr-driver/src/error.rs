// SPDX-License-Identifier: AGPL-3.0-only
//! Error types for spectrometer control and acquisition

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, NmrError>;

/// Errors that can occur while programming or reading the spectrometer
#[derive(Debug, Error)]
pub enum NmrError {
    /// Requested timing cannot be realised; raised before any register write
    #[error("Configuration error: {reason}")]
    Config {
        /// What was rejected
        reason: String,
    },

    /// A hardware completion flag was not observed within its bound
    #[error("Hardware timeout: {operation} not complete after {duration_ms}ms")]
    HardwareTimeout {
        /// Operation that was being awaited
        operation: String,
        /// Bound that elapsed, in milliseconds
        duration_ms: u64,
    },

    /// Number of captured samples differs from the number requested
    #[error("Data integrity error: captured {captured} samples, requested {requested}")]
    DataIntegrity {
        /// Samples actually delivered
        captured: usize,
        /// Samples the sequence was programmed for
        requested: usize,
    },

    /// Auxiliary bus transaction failed after all retries
    #[error("{bus} transaction failed: {reason}")]
    Bus {
        /// Bus name (`i2c`, `spi`)
        bus: &'static str,
        /// Reason for failure
        reason: String,
    },

    /// Sequencer asked to perform a transition its state does not allow
    #[error("Sequencer in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Acquisition stopped through its cancel token
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Physical memory window could not be mapped
    #[error("Mapping failed: {reason}")]
    Mapping {
        /// Reason for failure
        reason: String,
    },

    /// Register offset outside the mapped window
    #[error("Register access out of bounds: offset={offset:#x}, limit={limit:#x}")]
    OutOfBounds {
        /// Offending byte offset
        offset: usize,
        /// Window size
        limit: usize,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl NmrError {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a hardware timeout error
    pub fn timeout(operation: impl Into<String>, bound: std::time::Duration) -> Self {
        Self::HardwareTimeout {
            operation: operation.into(),
            duration_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a data integrity error
    pub fn integrity(captured: usize, requested: usize) -> Self {
        Self::DataIntegrity {
            captured,
            requested,
        }
    }

    /// Create a bus error
    pub fn bus(bus: &'static str, reason: impl Into<String>) -> Self {
        Self::Bus {
            bus,
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a mapping error
    pub fn mapping(reason: impl Into<String>) -> Self {
        Self::Mapping {
            reason: reason.into(),
        }
    }

    /// Whether the error only invalidates the current acquisition.
    ///
    /// Configuration and integrity failures leave the hardware usable and the
    /// accumulator untouched, so a multi-scan run skips the scan and goes on.
    /// Everything else aborts the run; after a timeout the caller must
    /// re-initialise the system before retrying.
    pub fn is_iteration_local(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::DataIntegrity { .. })
    }
}
