// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

/// How long a whole-disk record waits for a child partition to claim it.
pub const DEFAULT_WAITER_TIMEOUT: Duration = Duration::from_millis(3000);

/// A completed record that is neither accepted nor discarded yet.
///
/// The timer itself lives with whoever drives the registry; it reports back
/// with the generation so an expiry for a replaced waiter is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWaiter {
    pub generation: u64,
}
