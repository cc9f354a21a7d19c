// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use zbus::{
    Connection,
    zvariant::{self, Value},
};
use zbus_macros::proxy;

use super::signals::{self, ServiceSignalStream};
use crate::error::{Result, ServiceError};

#[proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2/Manager",
    interface = "org.freedesktop.UDisks2.Manager"
)]
pub trait UDisks2Manager {
    fn get_block_devices(
        &self,
        options: HashMap<String, Value<'_>>,
    ) -> zbus::Result<Vec<zvariant::OwnedObjectPath>>;
}

/// The process-wide link to UDisks2 on the system bus.
///
/// Constructed once at startup and handed to whatever needs to talk to the
/// service. Cloning shares the underlying connection.
#[derive(Clone, Debug)]
pub struct ServiceConnection {
    connection: Connection,
}

impl ServiceConnection {
    pub async fn system() -> Result<Self> {
        let connection = Connection::system()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    /// Get a reference to the D-Bus connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Subscribe to object, property and job signals of the service.
    ///
    /// Subscribe before enumerating so that nothing announced in between is
    /// lost; duplicates are harmless to the registry.
    pub async fn signals(&self) -> Result<ServiceSignalStream> {
        signals::subscribe(&self.connection).await
    }
}
