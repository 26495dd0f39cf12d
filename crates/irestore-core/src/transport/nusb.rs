//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{DeviceConnector, DeviceFilter, TransportError, UsbTransport};
use crate::protocol::constants::*;
use crate::protocol::{DeviceIdentity, DeviceMode};

/// nusb-based bootloader transport.
pub struct NusbTransport {
    device: Device,
    control: Interface,
    /// Separate bulk interface on recovery variants 3 and 4.
    bulk: Option<Interface>,
    mode: DeviceMode,
    serial: Option<String>,
}

impl NusbTransport {
    /// Open the first bootloader-mode device matching `filter`.
    #[instrument(level = "info", fields(ecid = ?filter.ecid))]
    pub fn open(filter: &DeviceFilter) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::UnableToConnect(e.to_string()))?
            .find(|d| is_bootloader_device(d) && matches_filter(d, filter))
            .ok_or(TransportError::NoDevice { ecid: filter.ecid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: DeviceInfo) -> Result<Self, TransportError> {
        let pid = device_info.product_id();
        let mode = DeviceMode::from_product_id(pid);
        let serial = device_info.serial_number().map(String::from);

        info!(
            product_id = %format!("{:04X}", pid),
            mode = %mode,
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::UnableToConnect(e.to_string()))?;

        let active = device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active != Some(USB_CONFIGURATION) {
            device
                .set_configuration(USB_CONFIGURATION)
                .wait()
                .map_err(|e| TransportError::UnableToConnect(format!("set configuration: {e}")))?;
        }

        let control = device
            .claim_interface(CONTROL_INTERFACE)
            .wait()
            .map_err(|e| {
                TransportError::UnableToConnect(format!(
                    "claim interface {CONTROL_INTERFACE}: {e}"
                ))
            })?;

        let bulk = if mode.needs_bulk_interface() {
            let iface = device.claim_interface(BULK_INTERFACE).wait().map_err(|e| {
                TransportError::UnableToConnect(format!("claim interface {BULK_INTERFACE}: {e}"))
            })?;
            iface
                .set_alt_setting(BULK_ALT_SETTING)
                .wait()
                .map_err(|e| TransportError::UnableToConnect(format!("set alt setting: {e}")))?;
            Some(iface)
        } else {
            None
        };

        info!(
            mode = %mode,
            bulk_interface = bulk.is_some(),
            "Device opened successfully"
        );

        Ok(Self {
            device,
            control,
            bulk,
            mode,
            serial,
        })
    }

    fn bulk_interface(&self) -> &Interface {
        self.bulk.as_ref().unwrap_or(&self.control)
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let (control_type, recipient) = split_request_type(request_type);
        self.control
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;
        Ok(data.len())
    }

    #[instrument(level = "trace", skip(self))]
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (control_type, recipient) = split_request_type(request_type);
        let data = self
            .control
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    length: length.min(u16::MAX as usize) as u16,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;
        trace!(bytes_read = data.len(), "Control IN complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_send(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .bulk_interface()
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::UsbStatus(e.to_string()))?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        let completion = ep.transfer_blocking(buf, timeout);
        let written = completion.actual_len;
        completion
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout))?;

        debug!(bytes_written = written, "Bulk write complete");
        Ok(written)
    }

    #[instrument(skip(self))]
    fn bulk_receive(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .bulk_interface()
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|e| TransportError::UsbStatus(e.to_string()))?;

        // IN requests must be a multiple of the max packet size.
        let packet = ep.max_packet_size().max(1);
        let len = max_len.div_ceil(packet) * packet;
        let mut buf = Buffer::new(len);
        buf.set_requested_len(len);

        let data = ep
            .transfer_blocking(buf, timeout)
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout))?;

        debug!(bytes_read = data.len(), "Bulk read complete");
        Ok(data[..data.len().min(max_len)].to_vec())
    }

    fn reset(&self) -> Result<(), TransportError> {
        info!("Resetting USB device");
        self.device
            .reset()
            .wait()
            .map_err(|e| TransportError::UsbStatus(e.to_string()))
    }

    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }

    fn is_connected(&self) -> bool {
        // nusb has no liveness query; failed transfers report Disconnected.
        true
    }
}

/// Device discovery over nusb.
#[derive(Debug, Default)]
pub struct NusbConnector;

impl NusbConnector {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceConnector for NusbConnector {
    type Transport = NusbTransport;

    fn probe(&mut self, filter: &DeviceFilter) -> Result<DeviceMode, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::UnableToConnect(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() != APPLE_VENDOR_ID {
                continue;
            }
            let mode = DeviceMode::from_product_id(device_info.product_id());
            match mode {
                // Normal-mode serials carry the UDID, not the ECID.
                DeviceMode::Normal => return Ok(mode),
                m if m.is_bootloader() && matches_filter(&device_info, filter) => return Ok(m),
                _ => {}
            }
        }

        Err(TransportError::NoDevice { ecid: filter.ecid })
    }

    fn open(&mut self, filter: &DeviceFilter) -> Result<NusbTransport, TransportError> {
        NusbTransport::open(filter)
    }
}

fn is_bootloader_device(device_info: &DeviceInfo) -> bool {
    device_info.vendor_id() == APPLE_VENDOR_ID
        && BOOTLOADER_PIDS.contains(&device_info.product_id())
}

fn matches_filter(device_info: &DeviceInfo, filter: &DeviceFilter) -> bool {
    if filter.ecid.is_none() {
        return true;
    }
    let identity = DeviceIdentity::parse(device_info.serial_number().unwrap_or_default());
    filter.matches(&identity)
}

fn split_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    (control_type, recipient)
}

fn map_transfer_error(e: TransferError, timeout: Duration) -> TransportError {
    match e {
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        TransferError::Stall => TransportError::Pipe,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::UsbStatus(other.to_string()),
    }
}
