//! Error kinds for the motion control core (spec §7).
//!
//! `OverErrorStep` is deliberately absent here: it is recovered locally by
//! the step compressor (counted in `error_count`, never returned), so it has
//! no `Result::Err` representation.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreError {
    #[error("encoded message exceeds the wire size budget")]
    MessageTooLarge,

    #[error("received message id has no entry in the data dictionary")]
    UnknownMessage,

    #[error("malformed frame: {0}")]
    BadFrame(#[from] klipper_proto::Error),

    #[error("timed out waiting for an ack or a pulled message")]
    Timeout,

    #[error("serial queue has been shut down")]
    QueueClosed,

    #[error("clock model queried before the first ack was received")]
    ClockNotReady,
}
