//! A [`Transport`] over the Nordic UART service of a BLE peripheral.
//!
//! The JBD Bluetooth dongles expose the BMS serial port as a Nordic UART service: requests
//! are written to one characteristic and replies arrive as notifications on another, split
//! across as many notifications as the MTU requires.

use anyhow::anyhow;
use bluest::Adapter;
use bluest::AdvertisingDevice;
use bluest::Characteristic;
use bluest::Device;
use bluest::Uuid;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::error::TransportError;
use crate::transport::{MtuExchange, Transport};

pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notify: Characteristic,
}

impl BleTransport {
    pub const DEFAULT_DEVICE_NAME: &'static str = "xiaoxiang BMS";
    const NORDIC_UART_SERVICE_ID: &'static str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    const NORDIC_UART_WRITE_CHARACTERISTIC_ID: &'static str =
        "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    const NORDIC_UART_NOTIFY_CHARACTERISTIC_ID: &'static str =
        "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
    const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
    const CONNECT_RETRIES: u32 = 2;
    /// ATT header bytes on top of the largest write
    const ATT_OVERHEAD: u16 = 3;

    /// Discover the peripheral advertising `ble_device_name` and connect to its UART service.
    pub async fn connect(ble_device_name: &str) -> anyhow::Result<Self> {
        let adapter = bluest::Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        let device = timeout(Self::DISCOVERY_TIMEOUT, Self::discover_device(ble_device_name, &adapter))
            .await
            .map_err(|_| anyhow!("Device not found"))??;

        adapter.connect_device(&device.device).await?;
        log::info!("Connected to {ble_device_name}");

        let nordic_uart_service = device
            .device
            .discover_services_with_uuid(Self::uuid(Self::NORDIC_UART_SERVICE_ID)?)
            .await?
            .first()
            .ok_or(anyhow!("The specified device does not support the Nordic UART service."))?
            .clone();
        let write = nordic_uart_service
            .discover_characteristics_with_uuid(Self::uuid(Self::NORDIC_UART_WRITE_CHARACTERISTIC_ID)?)
            .await?
            .first()
            .ok_or(anyhow!("The specified device does not support the Nordic UART write characterstic."))?
            .clone();
        let notify = nordic_uart_service
            .discover_characteristics_with_uuid(Self::uuid(Self::NORDIC_UART_NOTIFY_CHARACTERISTIC_ID)?)
            .await?
            .first()
            .ok_or(anyhow!("The specified device does not support the Nordic UART notify characterstic."))?
            .clone();

        Ok(Self { adapter, device: device.device, write, notify })
    }

    /// Subscribe to inbound bytes. Feed the stream to [`crate::BmsSession::pump`].
    pub async fn notifications(
        &self,
    ) -> anyhow::Result<impl Stream<Item = Result<Vec<u8>, bluest::Error>> + Send + Unpin + '_> {
        self.try_connect().await?;
        Ok(self.notify.notify().await?)
    }

    /// Disconnect from the peripheral
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }

    async fn discover_device(name: &str, adapter: &Adapter) -> anyhow::Result<AdvertisingDevice> {
        let required_services = [Self::uuid(Self::NORDIC_UART_SERVICE_ID)?];
        let mut adapter_events = adapter.scan(&required_services).await?;
        while let Some(device) = timeout(Self::DISCOVERY_TIMEOUT, adapter_events.next())
            .await
            .map_err(|_| anyhow!("Device not found"))?
        {
            let device_name = device.device.name_async().await?;
            log::debug!("Discovered {device_name}");
            if device_name == name {
                return Ok(device);
            }
        }

        Err(anyhow!("Device not found"))
    }

    async fn try_connect(&self) -> anyhow::Result<()> {
        if !self.device.is_connected().await {
            let mut retries = Self::CONNECT_RETRIES;
            loop {
                match self.adapter.connect_device(&self.device).await {
                    Ok(()) => return Ok(()),
                    Err(err) if retries > 0 => {
                        log::warn!("Failed to connect: {err}");
                        retries -= 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }

    fn uuid(id: &str) -> anyhow::Result<Uuid> {
        Ok(Uuid::parse_str(id)?)
    }
}

impl Transport for BleTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.device.is_connected().await {
            return Err(TransportError::Disconnected);
        }
        self.write
            .write(bytes)
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))
    }
}

/// The OS negotiates the ATT MTU on connection; this reports what it settled on.
impl MtuExchange for BleTransport {
    fn current_mtu(&self) -> Option<u16> {
        let len = self.write.max_write_len().ok()?;
        u16::try_from(len).ok()?.checked_add(Self::ATT_OVERHEAD)
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
        let current = self
            .current_mtu()
            .ok_or_else(|| TransportError::MtuExchange("MTU not reported".to_string()))?;
        Ok(current.min(mtu))
    }
}
