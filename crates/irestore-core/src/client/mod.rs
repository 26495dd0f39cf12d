//! Command/environment protocol client.
//!
//! `RecoveryClient` owns one open transport and speaks iBoot's command
//! protocol on top of it: NUL-terminated text commands over vendor control
//! transfers, environment reads, and buffer/file uploads. Every command is
//! surfaced to the event hub before and after transmission.

mod upload;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventAction, EventHub, EventKind, HubEvent};
use crate::protocol::constants::*;
use crate::protocol::{DeviceIdentity, DeviceMode, ParsedCommand, decode_response, encode_command};
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Command must be a single line: {0:?}")]
    InvalidCommand(String),

    #[error("Uploads are not supported in {0} mode")]
    UnsupportedMode(DeviceMode),

    #[error("Unexpected DFU state {state}")]
    DfuState { state: u8 },

    #[error("DFU status {status} after {polls} polls")]
    DfuStatus { status: u8, polls: u32 },

    #[error("Malformed {what} response: {len} bytes")]
    MalformedResponse { what: &'static str, len: usize },

    #[error("Failed to open {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Bootloader protocol client over one transport session.
pub struct RecoveryClient<T: UsbTransport> {
    transport: T,
    hub: EventHub<RecoveryClient<T>>,
    identity: DeviceIdentity,
    timeout: Duration,
    status_poll: Duration,
}

impl<T: UsbTransport> RecoveryClient<T> {
    /// Wrap an open transport with no subscribers.
    pub fn new(transport: T) -> Self {
        Self::with_hub(transport, EventHub::new())
    }

    /// Wrap an open transport and announce the connection to `hub`.
    pub fn with_hub(transport: T, hub: EventHub<Self>) -> Self {
        let identity = DeviceIdentity::parse(&transport.serial().unwrap_or_default());
        let mut client = Self {
            transport,
            hub,
            identity,
            timeout: Duration::from_millis(USB_TIMEOUT_MS),
            status_poll: Duration::from_millis(DFU_STATUS_POLL_INTERVAL_MS),
        };
        let mode = client.mode();
        debug!(mode = %mode, identity = %client.identity, "Client connected");
        client.dispatch(HubEvent::Connected { mode });
        client
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Interval between DFU GETSTATUS polls.
    pub fn set_status_poll_interval(&mut self, interval: Duration) {
        self.status_poll = interval;
    }

    pub fn mode(&self) -> DeviceMode {
        self.transport.mode()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register a handler, replacing any existing one for `kind`.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&mut Self, &HubEvent) -> EventAction + Send + 'static,
    {
        self.hub.subscribe(kind, handler);
    }

    pub fn unsubscribe(&mut self, kind: EventKind) {
        self.hub.unsubscribe(kind);
    }

    /// Deliver `event` to its handler. No borrow of the hub is held while
    /// the handler runs, so it may call back into this client.
    fn dispatch(&mut self, event: HubEvent) -> EventAction {
        let Some(mut handler) = self.hub.checkout(event.kind()) else {
            return EventAction::Proceed;
        };
        let action = handler.call(self, &event);
        self.hub.restore(handler);
        action
    }

    /// Surface a command to the pre-command handler and transmit it unless
    /// vetoed. Returns whether it went out.
    fn begin_command(&mut self, text: &str) -> Result<bool, ClientError> {
        if text.contains(['\n', '\r']) {
            return Err(ClientError::InvalidCommand(text.to_string()));
        }
        if self.dispatch(HubEvent::PreCommand {
            text: text.to_string(),
        }) == EventAction::Halt
        {
            debug!(command = %text, "Command suppressed by pre-command handler");
            return Ok(false);
        }

        let frame = encode_command(text);
        self.transport
            .control_out(REQ_VENDOR_OUT, 0, 0, 0, &frame, self.timeout)?;
        debug!(command = %text, "Command sent");
        Ok(true)
    }

    fn end_command(&mut self, text: &str) {
        self.dispatch(HubEvent::PostCommand {
            text: text.to_string(),
            command: ParsedCommand::parse(text),
        });
    }

    /// Send one command line.
    ///
    /// A pre-command handler returning `Halt` suppresses the transfer and
    /// this returns `Ok(())` without touching the device.
    #[instrument(level = "debug", skip(self))]
    pub fn send_command(&mut self, text: &str) -> Result<(), ClientError> {
        if self.begin_command(text)? {
            self.end_command(text);
        }
        Ok(())
    }

    /// Read a bootloader environment variable. `None` when unset or when the
    /// request was vetoed.
    pub fn getenv(&mut self, name: &str) -> Result<Option<String>, ClientError> {
        let text = format!("getenv {name}");
        if !self.begin_command(&text)? {
            return Ok(None);
        }
        let response =
            self.transport
                .control_in(REQ_VENDOR_IN, 0, 0, 0, ENV_RESPONSE_LEN, self.timeout)?;
        let value = decode_response(&response);
        self.end_command(&text);

        debug!(name, value = %value, "getenv");
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    pub fn setenv(&mut self, name: &str, value: &str) -> Result<(), ClientError> {
        self.send_command(&format!("setenv {name} {value}"))
    }

    pub fn saveenv(&mut self) -> Result<(), ClientError> {
        self.send_command("saveenv")
    }

    pub fn reboot(&mut self) -> Result<(), ClientError> {
        info!("Rebooting device");
        self.send_command("reboot")
    }

    /// USB port reset; invalidates this session.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.transport.reset()?;
        Ok(())
    }

    /// One-byte return value of the last command.
    pub fn getret(&mut self) -> Result<u8, ClientError> {
        let data = self
            .transport
            .control_in(REQ_VENDOR_IN, 0, 0, 0, 1, self.timeout)?;
        Ok(data.first().copied().unwrap_or(0))
    }

    /// Raw control transfer on the session handle.
    pub fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ClientError> {
        Ok(self
            .transport
            .control_transfer(request_type, request, value, index, buf, timeout)?)
    }

    /// Drain console output from the bulk IN endpoint, delivering each chunk
    /// as a Received event. Stops on timeout, an empty read, or a handler
    /// returning `Halt`.
    pub fn receive(&mut self) -> Result<(), ClientError> {
        let timeout = Duration::from_millis(RECEIVE_TIMEOUT_MS);
        loop {
            match self
                .transport
                .bulk_receive(BULK_IN_ENDPOINT, RECEIVE_CHUNK_SIZE, timeout)
            {
                Ok(data) if !data.is_empty() => {
                    if self.dispatch(HubEvent::Received { data }) == EventAction::Halt {
                        return Ok(());
                    }
                }
                Ok(_) | Err(TransportError::Timeout { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run a newline-separated command script. Blank lines and lines
    /// starting with `#` are skipped; console output is drained after each.
    pub fn execute_script(&mut self, script: &str) -> Result<(), ClientError> {
        for line in script.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.send_command(line)?;
            self.receive()?;
        }
        Ok(())
    }

    /// Clear a DFU error state.
    pub fn reset_counters(&mut self) -> Result<(), ClientError> {
        if self.mode().is_dfu_like() {
            self.transport
                .control_out(REQ_DFU_OUT, DFU_CLRSTATUS, 0, 0, &[], self.timeout)?;
        }
        Ok(())
    }

    /// Zero-length DNLOAD telling the loaded stage the transfer is over.
    pub fn signal_transfer_done(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.transport
            .control_out(REQ_DFU_OUT, DFU_DNLOAD, 0, 0, &[], timeout)?;
        Ok(())
    }

    /// End a DFU transfer: zero-length DNLOAD, three status reads, reset.
    pub fn finish_transfer(&mut self) -> Result<(), ClientError> {
        self.signal_transfer_done(self.timeout)?;
        for _ in 0..3 {
            if let Err(e) = self.dfu_status() {
                warn!(error = %e, "GETSTATUS failed while finishing transfer");
            }
        }
        self.reset()
    }

    /// Release the session, notifying the Disconnected handler.
    pub fn close(mut self) {
        self.dispatch(HubEvent::Disconnected);
        debug!(mode = %self.mode(), "Client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockOp, MockTransport};
    use std::sync::{Arc, Mutex};

    fn client() -> (RecoveryClient<MockTransport>, MockTransport) {
        let mock = MockTransport::recovery();
        (RecoveryClient::new(mock.clone()), mock)
    }

    #[test]
    fn test_identity_from_serial() {
        let (client, _) = client();
        assert_eq!(client.identity().ecid, 0x1234);
        assert_eq!(client.identity().ap_nonce, Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_getret_reads_one_byte() {
        let (mut client, mock) = client();
        assert_eq!(client.getret().unwrap(), 0);

        mock.set_env("auto-boot", "true");
        client.send_command("getenv auto-boot").unwrap();
        assert_eq!(client.getret().unwrap(), b't');

        let reads: Vec<MockOp> = mock
            .ops()
            .into_iter()
            .filter(|op| matches!(op, MockOp::ControlIn { .. }))
            .collect();
        assert_eq!(
            reads,
            vec![
                MockOp::ControlIn {
                    request_type: REQ_VENDOR_IN,
                    request: 0,
                    length: 1,
                };
                2
            ]
        );
    }

    #[test]
    fn test_reset_counters_clears_dfu_error() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        mock.set_dfu_state(DFU_STATE_ERROR);
        let mut dfu = RecoveryClient::new(mock.clone());
        dfu.reset_counters().unwrap();
        assert_eq!(mock.dfu_state(), DFU_STATE_IDLE);
        assert!(mock.ops().contains(&MockOp::ControlOut {
            request_type: REQ_DFU_OUT,
            request: DFU_CLRSTATUS,
            value: 0,
            len: 0,
        }));

        // Nothing to clear in recovery.
        let (mut recovery, mock) = client();
        recovery.reset_counters().unwrap();
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_send_command_frame() {
        let (mut client, mock) = client();
        client.send_command("bgcolor 0 0 0").unwrap();
        assert_eq!(mock.commands(), vec!["bgcolor 0 0 0"]);
    }

    #[test]
    fn test_multiline_command_rejected() {
        let (mut client, mock) = client();
        let err = client.send_command("saveenv\nreboot").unwrap_err();
        assert!(matches!(err, ClientError::InvalidCommand(_)));
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_pre_command_veto_suppresses_transfer() {
        let (mut client, mock) = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        client.subscribe(EventKind::PreCommand, move |_, ev| {
            let HubEvent::PreCommand { text } = ev else {
                return EventAction::Proceed;
            };
            if text.starts_with('/') {
                seen_in.lock().unwrap().push(text.clone());
                EventAction::Halt
            } else {
                EventAction::Proceed
            }
        });

        client.send_command("/upload iBEC.img3").unwrap();
        assert!(mock.ops().iter().all(|op| !op.is_transfer()));
        assert!(mock.ops().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["/upload iBEC.img3".to_string()]);

        // Ordinary commands still go through.
        client.send_command("saveenv").unwrap();
        assert_eq!(mock.commands(), vec!["saveenv"]);
    }

    #[test]
    fn test_vetoed_getenv_returns_none() {
        let (mut client, mock) = client();
        mock.set_env("build-version", "9A405");
        client.subscribe(EventKind::PreCommand, |_, _| EventAction::Halt);
        assert_eq!(client.getenv("build-version").unwrap(), None);
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_post_command_carries_parsed_variant() {
        let (mut client, mock) = client();
        mock.set_env("auto-boot", "true");
        let parsed = Arc::new(Mutex::new(Vec::new()));
        let parsed_in = parsed.clone();
        client.subscribe(EventKind::PostCommand, move |_, ev| {
            if let HubEvent::PostCommand { command, .. } = ev {
                parsed_in.lock().unwrap().push(command.clone());
            }
            EventAction::Proceed
        });

        assert_eq!(client.getenv("auto-boot").unwrap().as_deref(), Some("true"));
        client.reboot().unwrap();
        assert_eq!(
            *parsed.lock().unwrap(),
            vec![
                ParsedCommand::Getenv("auto-boot".into()),
                ParsedCommand::Reboot
            ]
        );
    }

    #[test]
    fn test_handler_may_reenter_client() {
        let (mut client, mock) = client();
        mock.set_env("build-version", "9A405");
        let fetched = Arc::new(Mutex::new(None));
        let fetched_in = fetched.clone();
        // A post-command handler that reacts to "reboot" by issuing its own command.
        client.subscribe(EventKind::PostCommand, move |c, ev| {
            if let HubEvent::PostCommand {
                command: ParsedCommand::Reboot,
                ..
            } = ev
            {
                *fetched_in.lock().unwrap() = c.getenv("build-version").unwrap();
            }
            EventAction::Proceed
        });

        client.reboot().unwrap();
        assert_eq!(fetched.lock().unwrap().as_deref(), Some("9A405"));
        assert_eq!(mock.commands(), vec!["reboot", "getenv build-version"]);
        // Handler is still registered after the nested call.
        client.send_command("reboot").unwrap();
        assert_eq!(mock.commands().len(), 4);
    }

    #[test]
    fn test_setenv_saveenv_then_getenv() {
        let (mut client, mock) = client();
        mock.set_env("auto-boot", "true");
        client.setenv("auto-boot", "false").unwrap();
        client.saveenv().unwrap();
        assert!(mock.is_saved());
        assert_eq!(client.getenv("auto-boot").unwrap().as_deref(), Some("false"));
    }

    #[test]
    fn test_getenv_missing_is_none() {
        let (mut client, _) = client();
        assert_eq!(client.getenv("radio-error").unwrap(), None);
    }

    #[test]
    fn test_transport_error_propagates() {
        let (mut client, mock) = client();
        mock.fail_on_command("ramdisk");
        let err = client.send_command("ramdisk").unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Pipe)));
    }

    #[test]
    fn test_receive_and_script() {
        let (mut client, mock) = client();
        mock.queue_console(b"] ");
        mock.queue_console(b"ok\n");
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_in = received.clone();
        client.subscribe(EventKind::Received, move |_, ev| {
            if let HubEvent::Received { data } = ev {
                received_in.lock().unwrap().extend_from_slice(data);
            }
            EventAction::Proceed
        });

        client
            .execute_script("# setup\nsetenv auto-boot false\n\nsaveenv\n")
            .unwrap();
        assert_eq!(mock.commands(), vec!["setenv auto-boot false", "saveenv"]);
        assert_eq!(*received.lock().unwrap(), b"] ok\n".to_vec());
    }

    #[test]
    fn test_close_fires_disconnected() {
        let (mut client, _) = client();
        let closed = Arc::new(Mutex::new(false));
        let closed_in = closed.clone();
        client.subscribe(EventKind::Disconnected, move |_, _| {
            *closed_in.lock().unwrap() = true;
            EventAction::Proceed
        });
        client.close();
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_finish_transfer_resets() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        let mut client = RecoveryClient::new(mock.clone());
        client.finish_transfer().unwrap();
        let ops = mock.ops();
        assert_eq!(ops.last(), Some(&MockOp::Reset));
        let status_reads = ops
            .iter()
            .filter(|op| matches!(op, MockOp::ControlIn { request: DFU_GETSTATUS, .. }))
            .count();
        assert_eq!(status_reads, 3);
    }
}
