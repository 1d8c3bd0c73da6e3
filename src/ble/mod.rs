//! The transport seam between the compatibility test and a Bluetooth stack.
//!
//! [`BleTransport`] is the collaborator the session drives: connect, discover,
//! read, write, subscribe and disconnect, keyed by a transport-level device
//! id. [`BtleplugTransport`] implements it over `btleplug`; tests use an
//! in-memory scripted transport.

mod btleplug_backend;
#[cfg(test)]
pub(crate) mod fake;

pub use self::btleplug_backend::BtleplugTransport;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Result, types::DeviceInfo};

/// Receiver of raw notification payloads for one characteristic
///
/// The stream ends when the transport drops the subscription or the link.
pub type NotificationStream = mpsc::UnboundedReceiver<Vec<u8>>;

/// Bluetooth Low Energy central operations needed to test a bike
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Scan for devices advertising any of `services`
    async fn scan(&self, services: &[Uuid], duration: Duration) -> Result<Vec<DeviceInfo>>;

    /// Connect to a device found by a previous scan
    async fn connect(&self, device_id: &str, timeout: Duration) -> Result<()>;

    /// Discover GATT services and characteristics, returning the service UUIDs
    async fn discover_services(&self, device_id: &str) -> Result<Vec<Uuid>>;

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Enable notifications and stream their payloads
    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    /// Disable notifications
    async fn unsubscribe(&self, device_id: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Disconnect; fails with [`BikeError::AlreadyDisconnected`] when the
    /// link is already down
    ///
    /// [`BikeError::AlreadyDisconnected`]: crate::BikeError::AlreadyDisconnected
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Whether the link is up
    async fn is_connected(&self, device_id: &str) -> bool;
}
