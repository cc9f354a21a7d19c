// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::pin::Pin;

use futures::StreamExt;
use futures::stream::Stream;
use futures::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zbus::{
    Connection, MatchRule, Message, MessageStream,
    message::Type as MessageType,
    zvariant::{OwnedObjectPath, OwnedValue},
};

use crate::dbus::properties::{PropertyMap, property_map};
use crate::error::Result;
use crate::interfaces::{JOB_INTERFACE, UDISKS2_ROOT};

const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// A notification from the storage service, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceSignal {
    InterfacesAdded {
        object_path: String,
        interfaces: HashMap<String, PropertyMap>,
    },
    InterfacesRemoved {
        object_path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        object_path: String,
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
    JobCompleted {
        object_path: String,
        success: bool,
        message: String,
    },
}

pub struct ServiceSignalStream {
    receiver: mpsc::Receiver<ServiceSignal>,
}

impl ServiceSignalStream {
    pub fn from_receiver(receiver: mpsc::Receiver<ServiceSignal>) -> Self {
        Self { receiver }
    }
}

impl Stream for ServiceSignalStream {
    type Item = ServiceSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// All UDisks2 signals go through a single match rule so they are delivered
/// in the order the service emitted them. A job's `Completed` must never
/// overtake its `InterfacesAdded`.
pub(super) async fn subscribe(connection: &Connection) -> Result<ServiceSignalStream> {
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .path_namespace(UDISKS2_ROOT)?
        .build();

    let mut stream = MessageStream::for_match_rule(rule, connection, None).await?;
    let (sender, receiver) = mpsc::channel(256);

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!("Failed to receive storage service signal: {e}");
                    continue;
                }
            };

            let Some(signal) = decode(&message) else {
                continue;
            };

            if let Err(e) = sender.send(signal).await {
                warn!("Storage signal receiver dropped: {e}");
                break;
            }
        }
        debug!("Storage service signal stream ended");
    });

    Ok(ServiceSignalStream { receiver })
}

fn decode(message: &Message) -> Option<ServiceSignal> {
    let header = message.header();
    let interface = header.interface()?.as_str().to_string();
    let member = header.member()?.as_str().to_string();
    let object_path = header.path()?.as_str().to_string();
    let body = message.body();

    let decoded = match (interface.as_str(), member.as_str()) {
        (OBJECT_MANAGER, "InterfacesAdded") => body
            .deserialize::<(OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>)>()
            .map(|(path, interfaces)| ServiceSignal::InterfacesAdded {
                object_path: path.as_str().to_string(),
                interfaces: interfaces
                    .iter()
                    .map(|(name, props)| (name.clone(), property_map(props)))
                    .collect(),
            }),
        (OBJECT_MANAGER, "InterfacesRemoved") => body
            .deserialize::<(OwnedObjectPath, Vec<String>)>()
            .map(|(path, interfaces)| ServiceSignal::InterfacesRemoved {
                object_path: path.as_str().to_string(),
                interfaces,
            }),
        (PROPERTIES, "PropertiesChanged") => body
            .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
            .map(
                |(interface, changed, invalidated)| ServiceSignal::PropertiesChanged {
                    object_path,
                    interface,
                    changed: property_map(&changed),
                    invalidated,
                },
            ),
        (JOB_INTERFACE, "Completed") => {
            body.deserialize::<(bool, String)>()
                .map(|(success, message)| ServiceSignal::JobCompleted {
                    object_path,
                    success,
                    message,
                })
        }
        _ => return None,
    };

    match decoded {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("Failed to parse {interface}.{member} signal: {e}");
            None
        }
    }
}
