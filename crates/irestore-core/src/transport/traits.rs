//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for a single open bootloader handle
//! and the `DeviceConnector` trait for finding and opening devices,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

use crate::protocol::constants::REQ_DIRECTION_IN;
use crate::protocol::{DeviceIdentity, DeviceMode};
use crate::retry::{Attempt, RetryError, RetryPolicy, retry_with_backoff};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No matching device found (ECID filter: {ecid:?})")]
    NoDevice { ecid: Option<u64> },

    #[error("Unable to connect: {0}")]
    UnableToConnect(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Endpoint stalled")]
    Pipe,

    #[error("USB transfer failed: {0}")]
    UsbStatus(String),

    #[error("Short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors that only mean "not there yet" while waiting for re-enumeration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NoDevice { .. } | TransportError::Disconnected
        )
    }
}

/// Selects which physical device to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub ecid: Option<u64>,
}

impl DeviceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn ecid(ecid: u64) -> Self {
        Self { ecid: Some(ecid) }
    }

    /// Devices without an ECID (WTF) only match an unfiltered search.
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match self.ecid {
            Some(want) => identity.has_ecid() && identity.ecid == want,
            None => true,
        }
    }
}

/// Abstract bootloader transport.
///
/// One value owns one open device handle. It is valid only while the device
/// stays in the mode it was opened in; a mode change requires reopening.
pub trait UsbTransport: Send {
    /// Host-to-device control transfer. Returns bytes written.
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Device-to-host control transfer of up to `length` bytes.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Direction-dispatched control transfer, routed by bit 7 of `request_type`.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        if request_type & REQ_DIRECTION_IN != 0 {
            let data = self.control_in(request_type, request, value, index, buf.len(), timeout)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        } else {
            self.control_out(request_type, request, value, index, buf, timeout)
        }
    }

    /// Write to a bulk OUT endpoint. Returns bytes written.
    fn bulk_send(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from a bulk IN endpoint.
    fn bulk_receive(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// USB port reset. The device re-enumerates afterwards.
    fn reset(&self) -> Result<(), TransportError>;

    /// Mode the handle was opened against.
    fn mode(&self) -> DeviceMode;

    /// Raw serial descriptor string.
    fn serial(&self) -> Option<String>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;
}

/// Finds and opens devices.
pub trait DeviceConnector {
    type Transport: UsbTransport;

    /// Report the mode of the matching device without claiming it.
    fn probe(&mut self, filter: &DeviceFilter) -> Result<DeviceMode, TransportError>;

    /// Open the matching device.
    fn open(&mut self, filter: &DeviceFilter) -> Result<Self::Transport, TransportError>;

    /// Open with bounded retries while the device is absent.
    ///
    /// Claim or permission failures are not retried.
    fn open_with_retry(
        &mut self,
        filter: &DeviceFilter,
        policy: &RetryPolicy,
    ) -> Result<Self::Transport, RetryError<TransportError>> {
        retry_with_backoff(policy, |_| match self.open(filter) {
            Ok(transport) => Attempt::Ready(transport),
            Err(e) if e.is_transient() => Attempt::Retry(e),
            Err(e) => Attempt::Abort(e),
        })
    }
}
