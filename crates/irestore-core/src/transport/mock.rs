//! Mock USB transport for testing.
//!
//! `MockTransport` simulates enough of iBoot and the DFU boot ROM to drive
//! the command protocol and the restore state machine without hardware:
//! an environment store, getenv responses, upload buffers, the DFU
//! state/status registers and a log of every operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::{DeviceConnector, DeviceFilter, TransportError, UsbTransport};
use crate::protocol::constants::*;
use crate::protocol::{DeviceMode, ParsedCommand, decode_response};

/// One observed transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    /// A bootloader command (vendor control OUT, request 0).
    Command(String),
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        len: usize,
    },
    ControlIn {
        request_type: u8,
        request: u8,
        length: usize,
    },
    BulkOut {
        endpoint: u8,
        len: usize,
    },
    BulkIn {
        endpoint: u8,
    },
    Reset,
}

impl MockOp {
    /// Anything that actually crossed the bus.
    pub fn is_transfer(&self) -> bool {
        !matches!(self, MockOp::Reset)
    }
}

#[derive(Debug)]
struct MockDevice {
    mode: DeviceMode,
    serial: Option<String>,
    env: HashMap<String, String>,
    saved: bool,
    /// When false, getenv answers with an empty buffer.
    echo_env: bool,
    response: Option<Vec<u8>>,
    uploads: Vec<Vec<u8>>,
    dfu_state: u8,
    dfu_status: u8,
    console: VecDeque<Vec<u8>>,
    fail_command: Option<String>,
    fail_bulk: bool,
    ops: Vec<MockOp>,
    connected: bool,
}

/// Mock transport for unit testing protocol and state machine logic.
///
/// Clones share the same simulated device, so a test can keep one handle
/// for inspection while the code under test owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    pub fn new(mode: DeviceMode) -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice {
                mode,
                serial: None,
                env: HashMap::new(),
                saved: false,
                echo_env: true,
                response: None,
                uploads: Vec::new(),
                dfu_state: DFU_STATE_IDLE,
                dfu_status: DFU_STATUS_OK,
                console: VecDeque::new(),
                fail_command: None,
                fail_bulk: false,
                ops: Vec::new(),
                connected: true,
            })),
        }
    }

    /// Recovery-mode mock with a typical iBoot serial string.
    pub fn recovery() -> Self {
        Self::new(DeviceMode::Recovery(2)).with_serial(
            "CPID:8930 CPRV:20 CPFM:03 SCEP:01 BDID:02 ECID:0000000000001234 IBFL:03 NONC:deadbeef",
        )
    }

    pub fn with_serial(self, serial: &str) -> Self {
        self.dev().serial = Some(serial.to_string());
        self
    }

    fn dev(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        self.dev().mode = mode;
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.dev().env.insert(name.to_string(), value.to_string());
    }

    /// Current value in the simulated environment.
    pub fn env(&self, name: &str) -> Option<String> {
        self.dev().env.get(name).cloned()
    }

    pub fn is_saved(&self) -> bool {
        self.dev().saved
    }

    /// Make getenv answer with an empty buffer, like older iBoots.
    pub fn set_echo_env(&self, echo: bool) {
        self.dev().echo_env = echo;
    }

    /// Queue console output for `bulk_receive`.
    pub fn queue_console(&self, data: &[u8]) {
        self.dev().console.push_back(data.to_vec());
    }

    /// Commands starting with `prefix` stall the endpoint.
    pub fn fail_on_command(&self, prefix: &str) {
        self.dev().fail_command = Some(prefix.to_string());
    }

    pub fn fail_bulk(&self) {
        self.dev().fail_bulk = true;
    }

    pub fn set_dfu_state(&self, state: u8) {
        self.dev().dfu_state = state;
    }

    pub fn set_dfu_status(&self, status: u8) {
        self.dev().dfu_status = status;
    }

    pub fn dfu_state(&self) -> u8 {
        self.dev().dfu_state
    }

    /// Get all captured operations.
    pub fn ops(&self) -> Vec<MockOp> {
        self.dev().ops.clone()
    }

    /// Only the bootloader commands, in order.
    pub fn commands(&self) -> Vec<String> {
        self.dev()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Command(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payloads received, one entry per upload.
    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.dev().uploads.clone()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.dev().connected = false;
    }

    fn check_connected(dev: &MockDevice) -> Result<(), TransportError> {
        if dev.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn handle_command(dev: &mut MockDevice, text: &str) {
        match ParsedCommand::parse(text) {
            ParsedCommand::Getenv(name) => {
                let value = if dev.echo_env {
                    dev.env.get(&name).cloned().unwrap_or_default()
                } else {
                    String::new()
                };
                let mut buf = value.into_bytes();
                buf.push(0);
                dev.response = Some(buf);
            }
            ParsedCommand::Setenv { name, value } => {
                dev.env.insert(name, value);
                dev.saved = false;
            }
            ParsedCommand::Saveenv => dev.saved = true,
            _ => {}
        }
    }
}

impl UsbTransport for MockTransport {
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut dev = self.dev();
        Self::check_connected(&dev)?;

        match (request_type, request) {
            (REQ_VENDOR_OUT, 0) => {
                let text = decode_response(data);
                dev.ops.push(MockOp::Command(text.clone()));
                if let Some(prefix) = &dev.fail_command
                    && text.starts_with(prefix.as_str())
                {
                    return Err(TransportError::Pipe);
                }
                Self::handle_command(&mut dev, &text);
                return Ok(data.len());
            }
            (REQ_VENDOR_IFACE_OUT, 0) => dev.uploads.push(Vec::new()),
            (REQ_DFU_OUT, DFU_DNLOAD) if !data.is_empty() => {
                if value == 0 || dev.uploads.is_empty() {
                    dev.uploads.push(Vec::new());
                }
                if let Some(upload) = dev.uploads.last_mut() {
                    upload.extend_from_slice(data);
                }
            }
            (REQ_DFU_OUT, DFU_CLRSTATUS) | (REQ_DFU_OUT, DFU_ABORT) => {
                dev.dfu_state = DFU_STATE_IDLE;
            }
            _ => {}
        }

        dev.ops.push(MockOp::ControlOut {
            request_type,
            request,
            value,
            len: data.len(),
        });
        Ok(data.len())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut dev = self.dev();
        Self::check_connected(&dev)?;
        dev.ops.push(MockOp::ControlIn {
            request_type,
            request,
            length,
        });

        let mut data = match (request_type, request) {
            (REQ_VENDOR_IN, 0) => dev.response.take().unwrap_or_else(|| vec![0]),
            (REQ_DFU_IN, DFU_GETSTATE) => vec![dev.dfu_state],
            (REQ_DFU_IN, DFU_GETSTATUS) => vec![0, 0, 0, 0, dev.dfu_status, 0],
            _ => Vec::new(),
        };
        data.truncate(length);
        Ok(data)
    }

    fn bulk_send(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut dev = self.dev();
        Self::check_connected(&dev)?;
        dev.ops.push(MockOp::BulkOut {
            endpoint,
            len: data.len(),
        });
        if dev.fail_bulk {
            return Err(TransportError::Pipe);
        }
        if dev.uploads.is_empty() {
            dev.uploads.push(Vec::new());
        }
        if let Some(upload) = dev.uploads.last_mut() {
            upload.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn bulk_receive(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut dev = self.dev();
        Self::check_connected(&dev)?;
        dev.ops.push(MockOp::BulkIn { endpoint });
        match dev.console.pop_front() {
            Some(mut chunk) => {
                chunk.truncate(max_len);
                Ok(chunk)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        let mut dev = self.dev();
        Self::check_connected(&dev)?;
        dev.ops.push(MockOp::Reset);
        Ok(())
    }

    fn mode(&self) -> DeviceMode {
        self.dev().mode
    }

    fn serial(&self) -> Option<String> {
        self.dev().serial.clone()
    }

    fn is_connected(&self) -> bool {
        self.dev().connected
    }
}

/// Scripted device discovery for state machine tests.
///
/// Each `probe` consumes the next mode from the script; once the script
/// runs out the last mode sticks.
#[derive(Debug)]
pub struct MockConnector {
    script: VecDeque<DeviceMode>,
    /// Serial strings handed out by successive opens.
    serials: VecDeque<String>,
    current: Option<DeviceMode>,
    probes: u32,
    opens: u32,
    device: MockTransport,
}

impl MockConnector {
    pub fn new(device: MockTransport) -> Self {
        let current = Some(device.mode());
        Self {
            script: VecDeque::new(),
            serials: VecDeque::new(),
            current,
            probes: 0,
            opens: 0,
            device,
        }
    }

    pub fn with_script(device: MockTransport, modes: impl IntoIterator<Item = DeviceMode>) -> Self {
        Self {
            script: modes.into_iter().collect(),
            serials: VecDeque::new(),
            current: None,
            probes: 0,
            opens: 0,
            device,
        }
    }

    /// Each successful open takes the next serial string, as a device that
    /// re-enumerates with a new nonce would. Once the queue runs out the
    /// last serial sticks.
    pub fn with_serials<'s>(mut self, serials: impl IntoIterator<Item = &'s str>) -> Self {
        self.serials.extend(serials.into_iter().map(str::to_string));
        self
    }

    pub fn probe_count(&self) -> u32 {
        self.probes
    }

    pub fn open_count(&self) -> u32 {
        self.opens
    }

    pub fn device(&self) -> &MockTransport {
        &self.device
    }
}

impl DeviceConnector for MockConnector {
    type Transport = MockTransport;

    fn probe(&mut self, filter: &DeviceFilter) -> Result<DeviceMode, TransportError> {
        self.probes += 1;
        if let Some(mode) = self.script.pop_front() {
            self.current = Some(mode);
        }
        match self.current {
            Some(mode) => {
                self.device.set_mode(mode);
                Ok(mode)
            }
            None => Err(TransportError::NoDevice { ecid: filter.ecid }),
        }
    }

    fn open(&mut self, filter: &DeviceFilter) -> Result<MockTransport, TransportError> {
        self.opens += 1;
        match self.current {
            Some(mode) if mode.is_bootloader() => {
                let mut dev = self.device.dev();
                dev.connected = true;
                if let Some(serial) = self.serials.pop_front() {
                    dev.serial = Some(serial);
                }
                drop(dev);
                Ok(self.device.clone())
            }
            Some(mode) => Err(TransportError::UnableToConnect(format!(
                "device is in {mode} mode"
            ))),
            None => Err(TransportError::NoDevice { ecid: filter.ecid }),
        }
    }
}
