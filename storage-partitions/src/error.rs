// SPDX-License-Identifier: GPL-3.0-only

use storage_types::OperationError;
use thiserror::Error;

/// Errors returned through a [`StorageHandle`](crate::StorageHandle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Partition controller is not running")]
    ControllerStopped,

    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl ControlError {
    /// A busy device; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Operation(e) if e.is_retryable())
    }
}
