use thiserror::Error;

use crate::staging::UpdatePolicy;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("Allocation size must be non-zero")]
    ZeroSizedAllocation,
    #[error("Resource index {0} does not refer to a live resource")]
    InvalidResourceIndex(usize),
    #[error("Frame count {0} is invalid, between 1 and 255 frames are supported")]
    InvalidFrameCount(usize),
    #[error("`{operation}` is not supported by the {policy:?} update policy")]
    InvalidUpdatePolicy {
        policy: UpdatePolicy,
        operation: &'static str,
    },
    #[error("Data of {actual} bytes does not match the registered size of {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Staging store is full: {requested} bytes requested, {available} bytes available")]
    StagingFull { requested: u64, available: u64 },
    #[error("Failed to create device resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Failed to transfer data to the device: {0}")]
    TransferFailed(String),
    #[error("Failed to map memory: {0}")]
    FailedToMap(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<V, E = AllocationError> = ::std::result::Result<V, E>;
