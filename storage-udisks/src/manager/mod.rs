// SPDX-License-Identifier: GPL-3.0-only

mod connection;
mod signals;

pub use connection::{ServiceConnection, UDisks2ManagerProxy};
pub use signals::{ServiceSignal, ServiceSignalStream};
