use std::io;

use thiserror::Error;

use crate::id::FateId;
use crate::status::TxStatus;

#[derive(Error, Debug)]
pub enum FateError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backing store failed persistently. Transient hiccups are retried
    /// inside the store and never surface as this variant.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("No transaction with id {0}")]
    NotFound(FateId),

    #[error("{id} has status {actual}, operation requires {required}")]
    WrongStatus {
        id: FateId,
        required: String,
        actual: TxStatus,
    },

    /// The reservation this handle was issued under has been claimed by a
    /// newer owner (the previous holder was declared dead).
    #[error("Reservation on {0} was taken over by another owner")]
    LostReservation(FateId),

    /// The transaction row was deleted; the reservation handle is dead.
    #[error("{0} has been deleted, reservation can no longer be used")]
    Deleted(FateId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Interrupted by shutdown")]
    Interrupted,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FateError>;

impl FateError {
    pub fn wrong_status(id: FateId, required: impl Into<String>, actual: TxStatus) -> Self {
        FateError::WrongStatus {
            id,
            required: required.into(),
            actual,
        }
    }

    /// True for the two reservation-guard failures a worker handles by
    /// abandoning its current loop iteration rather than reporting.
    pub fn is_reservation_loss(&self) -> bool {
        matches!(
            self,
            FateError::LostReservation(_) | FateError::Deleted(_)
        )
    }
}
