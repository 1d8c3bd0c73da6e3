use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BleTransport, NotificationStream};
use crate::{
    error::{BikeError, Result},
    types::{ConnectionParams, DeviceInfo},
    SCAN_SERVICE_UUIDS,
};

/// [`BleTransport`] backed by the platform Bluetooth stack
pub struct BtleplugTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    forwarders: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Create a transport on the platform Bluetooth manager
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            forwarders: Mutex::new(HashMap::new()),
        })
    }

    /// Scan for indoor bikes advertising any supported protocol service
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`BikeError::Ble`] for other Bluetooth-related errors.
    pub async fn scan_for_bikes(&self, params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        self.scan(
            &SCAN_SERVICE_UUIDS,
            Duration::from_millis(params.scan_timeout_ms),
        )
        .await
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BikeError::DeviceNotFound("no Bluetooth adapter".to_string()))
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| BikeError::DeviceNotFound(device_id.to_string()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                BikeError::Transport(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })
    }

    async fn device_info(peripheral: &Peripheral) -> DeviceInfo {
        let id = peripheral.id().to_string();
        match peripheral.properties().await {
            Ok(Some(properties)) => DeviceInfo {
                id,
                name: properties.local_name.unwrap_or_default(),
                address: Some(properties.address.to_string()),
                rssi: properties.rssi.unwrap_or(0),
                advertised_services: properties.services,
            },
            _ => DeviceInfo::new(id, String::new()),
        }
    }

    async fn stop_forwarder(&self, device_id: &str, characteristic: Uuid) {
        if let Some(handle) = self
            .forwarders
            .lock()
            .await
            .remove(&(device_id.to_string(), characteristic))
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan(&self, services: &[Uuid], duration: Duration) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for {} service(s)...", services.len());

        let central = self.central().await?;
        central
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;

        tokio::time::sleep(duration).await;

        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let device = Self::device_info(&peripheral).await;
            if !services.is_empty()
                && !device
                    .advertised_services
                    .iter()
                    .any(|uuid| services.contains(uuid))
            {
                continue;
            }

            info!(
                "Found device: {} ({}) protocols {:?}",
                device.name,
                device.id,
                device.advertised_protocols()
            );
            self.peripherals
                .lock()
                .await
                .insert(device.id.clone(), peripheral);
            devices.push(device);
        }

        info!("Scan completed. Found {} device(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, device_id: &str, connect_timeout: Duration) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        info!("Connecting to device: {device_id}");

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = connect_timeout.as_millis() as u64;
        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| BikeError::Timeout { timeout_ms })?
            .map_err(|e| BikeError::ConnectionFailed(e.to_string()))?;

        info!("Successfully connected to {device_id}");
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.discover_services().await?;

        let services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        debug!("Discovered {} service(s) on {device_id}", services.len());
        Ok(services)
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        let value = peripheral.read(&characteristic).await?;
        debug!("Read {}: {:02X?}", characteristic.uuid, value);
        Ok(value)
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        debug!("Writing {}: {:02X?}", characteristic.uuid, data);
        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| BikeError::Transport(format!("write failed: {e}")))
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        peripheral.subscribe(&target).await?;
        let mut notifications = peripheral.notifications().await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic && sender.send(notification.value).is_err()
                {
                    break;
                }
            }
        });

        if let Some(previous) = self
            .forwarders
            .lock()
            .await
            .insert((device_id.to_string(), characteristic), handle)
        {
            previous.abort();
        }

        debug!("Subscribed to {characteristic} on {device_id}");
        Ok(receiver)
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.stop_forwarder(device_id, characteristic).await;

        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;

        let keys: Vec<(String, Uuid)> = self
            .forwarders
            .lock()
            .await
            .keys()
            .filter(|(id, _)| id == device_id)
            .cloned()
            .collect();
        for (_, characteristic) in keys {
            self.stop_forwarder(device_id, characteristic).await;
        }

        if !peripheral.is_connected().await? {
            return Err(BikeError::AlreadyDisconnected);
        }

        if let Err(e) = peripheral.disconnect().await {
            warn!("Disconnect from {device_id} failed: {e}");
            return Err(e.into());
        }

        info!("Disconnected from {device_id}");
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        match self.peripheral(device_id).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
