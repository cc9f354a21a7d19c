// SPDX-License-Identifier: GPL-3.0-only

//! Calls into UDisks2, behind a trait so the monitor can be driven by a fake.

use std::collections::HashMap;

use futures::future::BoxFuture;
use storage_types::{FormatOptions, OperationKind};
use udisks2::{block::BlockProxy, encrypted::EncryptedProxy, filesystem::FilesystemProxy};
use zbus::fdo::PropertiesProxy;
use zbus::names::InterfaceName;
use zbus::zvariant::Value;

use crate::dbus::properties::{PropertyMap, property_map};
use crate::error::{Result, ServiceError};
use crate::interfaces::{Interface, UDISKS2_SERVICE};
use crate::manager::{ServiceConnection, UDisks2ManagerProxy};

/// A privileged operation on one UDisks2 object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Mount {
        object_path: String,
    },
    Unmount {
        object_path: String,
    },
    Lock {
        object_path: String,
    },
    Unlock {
        object_path: String,
        passphrase: String,
    },
    Format {
        object_path: String,
        filesystem_type: String,
        options: FormatOptions,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Mount { .. } => OperationKind::Mount,
            Self::Unmount { .. } => OperationKind::Unmount,
            Self::Lock { .. } => OperationKind::Lock,
            Self::Unlock { .. } => OperationKind::Unlock,
            Self::Format { .. } => OperationKind::Format,
        }
    }

    pub fn object_path(&self) -> &str {
        match self {
            Self::Mount { object_path }
            | Self::Unmount { object_path }
            | Self::Lock { object_path }
            | Self::Unlock { object_path, .. }
            | Self::Format { object_path, .. } => object_path,
        }
    }
}

pub trait StorageBackend: Send + Sync {
    /// Object paths of every block device the service knows about.
    fn block_devices(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// `GetAll` for one interface. An interface the object does not carry
    /// yields an empty map.
    fn properties(
        &self,
        object_path: String,
        interface: Interface,
    ) -> BoxFuture<'_, Result<PropertyMap>>;

    fn call(&self, request: OperationRequest) -> BoxFuture<'_, Result<()>>;
}

#[derive(Clone)]
pub struct UDisksBackend {
    service: ServiceConnection,
}

impl UDisksBackend {
    pub fn new(service: ServiceConnection) -> Self {
        Self { service }
    }

    async fn get_all(&self, object_path: String, interface: Interface) -> Result<PropertyMap> {
        let proxy = PropertiesProxy::builder(self.service.connection())
            .destination(UDISKS2_SERVICE)?
            .path(object_path)?
            .build()
            .await?;

        match proxy
            .get_all(InterfaceName::from_static_str_unchecked(interface.name()))
            .await
        {
            Ok(properties) => Ok(property_map(&properties)),
            Err(e) => {
                let error = ServiceError::from(e);
                if error.is_missing_interface() {
                    Ok(PropertyMap::new())
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn perform(&self, request: OperationRequest) -> Result<()> {
        let connection = self.service.connection();

        match request {
            OperationRequest::Mount { object_path } => {
                let proxy = FilesystemProxy::builder(connection)
                    .path(object_path)?
                    .build()
                    .await?;
                proxy
                    .mount(HashMap::new())
                    .await?;
            }
            OperationRequest::Unmount { object_path } => {
                let proxy = FilesystemProxy::builder(connection)
                    .path(object_path)?
                    .build()
                    .await?;
                proxy
                    .unmount(HashMap::new())
                    .await?;
            }
            OperationRequest::Lock { object_path } => {
                let proxy = EncryptedProxy::builder(connection)
                    .path(object_path)?
                    .build()
                    .await?;
                proxy
                    .lock(HashMap::new())
                    .await?;
            }
            OperationRequest::Unlock {
                object_path,
                passphrase,
            } => {
                let proxy = EncryptedProxy::builder(connection)
                    .path(object_path)?
                    .build()
                    .await?;
                proxy
                    .unlock(&passphrase, HashMap::new())
                    .await?;
            }
            OperationRequest::Format {
                object_path,
                filesystem_type,
                options,
            } => {
                let proxy = BlockProxy::builder(connection)
                    .path(object_path)?
                    .build()
                    .await?;

                let mut format_options = HashMap::new();
                if options.erase {
                    format_options.insert("erase", Value::from("zero"));
                }
                if let Some(label) = options.label.as_deref()
                    && !label.is_empty()
                {
                    format_options.insert("label", Value::from(label));
                }
                if let Some(passphrase) = options.encrypt_passphrase.as_deref()
                    && !passphrase.is_empty()
                {
                    format_options.insert("encrypt.passphrase", Value::from(passphrase));
                }
                if options.take_ownership {
                    format_options.insert("take-ownership", Value::from(true));
                }

                proxy
                    .format(filesystem_type.as_str(), format_options)
                    .await?;
            }
        }

        Ok(())
    }
}

impl StorageBackend for UDisksBackend {
    fn block_devices(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let manager = UDisks2ManagerProxy::new(self.service.connection()).await?;
            let paths = manager.get_block_devices(HashMap::new()).await?;
            Ok(paths.iter().map(|p| p.as_str().to_string()).collect())
        })
    }

    fn properties(
        &self,
        object_path: String,
        interface: Interface,
    ) -> BoxFuture<'_, Result<PropertyMap>> {
        Box::pin(self.get_all(object_path, interface))
    }

    fn call(&self, request: OperationRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.perform(request))
    }
}
