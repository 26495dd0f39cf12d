//! Buffer and file uploads.
//!
//! Recovery mode takes data over bulk endpoint 0x04 in 32 KiB packets after
//! a vendor request opens the transfer. DFU and WTF take 2 KiB DNLOAD
//! control transfers; the final block carries the DFU trailer and a CRC-32
//! over everything sent, and each block must reach status 5 before the
//! next one goes out.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;
use std::thread;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::{ClientError, RecoveryClient};
use crate::events::HubEvent;
use crate::protocol::constants::*;
use crate::transport::{TransportError, UsbTransport};

impl<T: UsbTransport> RecoveryClient<T> {
    /// Upload an in-memory buffer. `notify_completion` finishes a DFU
    /// transfer and resets the device; it has no effect in recovery mode.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn send_buffer(&mut self, data: &[u8], notify_completion: bool) -> Result<(), ClientError> {
        self.upload(&mut Cursor::new(data), data.len() as u64, notify_completion)
    }

    /// Stream a file through the upload path one packet at a time.
    pub fn send_file(&mut self, path: &Path, notify_completion: bool) -> Result<(), ClientError> {
        let file = File::open(path).map_err(|source| ClientError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let total = file.metadata()?.len();
        info!(path = %path.display(), bytes = total, "Sending file");
        self.upload(&mut BufReader::new(file), total, notify_completion)
    }

    fn upload<R: Read>(
        &mut self,
        reader: &mut R,
        total: u64,
        notify_completion: bool,
    ) -> Result<(), ClientError> {
        let mode = self.mode();
        if mode.is_recovery() {
            self.upload_recovery(reader, total)
        } else if mode.is_dfu_like() {
            self.upload_dfu(reader, total, notify_completion)
        } else {
            Err(ClientError::UnsupportedMode(mode))
        }
    }

    fn upload_recovery<R: Read>(&mut self, reader: &mut R, total: u64) -> Result<(), ClientError> {
        self.transport
            .control_out(REQ_VENDOR_IFACE_OUT, 0, 0, 0, &[], self.timeout)?;

        let mut packet = vec![0u8; RECOVERY_PACKET_SIZE];
        let mut sent = 0u64;
        while sent < total {
            let n = read_packet(reader, &mut packet)?;
            if n == 0 {
                break;
            }
            let written = self
                .transport
                .bulk_send(BULK_OUT_ENDPOINT, &packet[..n], self.timeout)?;
            if written != n {
                return Err(TransportError::ShortTransfer {
                    expected: n,
                    actual: written,
                }
                .into());
            }
            sent += n as u64;
            self.report_progress(sent, total);
        }

        check_complete(sent, total)
    }

    fn upload_dfu<R: Read>(
        &mut self,
        reader: &mut R,
        total: u64,
        notify_completion: bool,
    ) -> Result<(), ClientError> {
        self.ensure_dfu_idle()?;

        let packets = total.div_ceil(DFU_PACKET_SIZE as u64);
        let mut hasher = crc32fast::Hasher::new();
        let mut packet = Vec::with_capacity(DFU_PACKET_SIZE + DFU_TRAILER.len() + 4);
        let mut sent = 0u64;

        for index in 0..packets {
            packet.clear();
            packet.resize(DFU_PACKET_SIZE, 0);
            let n = read_packet(reader, &mut packet)?;
            packet.truncate(n);
            if n == 0 {
                break;
            }
            hasher.update(&packet);

            if index + 1 == packets {
                hasher.update(&DFU_TRAILER);
                // iBoot's CRC skips the final inversion.
                let crc = !hasher.clone().finalize();
                let mut crc_bytes = [0u8; 4];
                LittleEndian::write_u32(&mut crc_bytes, crc);
                packet.extend_from_slice(&DFU_TRAILER);
                packet.extend_from_slice(&crc_bytes);
            }

            let written = self.transport.control_out(
                REQ_DFU_OUT,
                DFU_DNLOAD,
                index as u16,
                0,
                &packet,
                self.timeout,
            )?;
            if written != packet.len() {
                return Err(TransportError::ShortTransfer {
                    expected: packet.len(),
                    actual: written,
                }
                .into());
            }

            self.wait_dfu_status()?;
            sent += n as u64;
            self.report_progress(sent, total);
        }

        check_complete(sent, total)?;

        if notify_completion {
            self.notify_dfu_complete(packets as u16)?;
        }
        Ok(())
    }

    fn ensure_dfu_idle(&mut self) -> Result<(), ClientError> {
        let data = self
            .transport
            .control_in(REQ_DFU_IN, DFU_GETSTATE, 0, 0, 1, self.timeout)?;
        let &[state] = data.as_slice() else {
            return Err(ClientError::MalformedResponse {
                what: "DFU state",
                len: data.len(),
            });
        };

        match state {
            DFU_STATE_IDLE => Ok(()),
            DFU_STATE_ERROR => {
                warn!("DFU error state, issuing CLRSTATUS");
                self.transport
                    .control_out(REQ_DFU_OUT, DFU_CLRSTATUS, 0, 0, &[], self.timeout)?;
                Err(ClientError::DfuState { state })
            }
            other => {
                warn!(state = other, "Unexpected DFU state, issuing ABORT");
                self.transport
                    .control_out(REQ_DFU_OUT, DFU_ABORT, 0, 0, &[], self.timeout)?;
                Err(ClientError::DfuState { state })
            }
        }
    }

    /// DFU GETSTATUS; returns the state byte.
    pub(super) fn dfu_status(&mut self) -> Result<u8, ClientError> {
        let data = self.transport.control_in(
            REQ_DFU_IN,
            DFU_GETSTATUS,
            0,
            0,
            DFU_STATUS_LEN,
            self.timeout,
        )?;
        if data.len() != DFU_STATUS_LEN {
            return Err(ClientError::MalformedResponse {
                what: "DFU status",
                len: data.len(),
            });
        }
        Ok(data[4])
    }

    fn wait_dfu_status(&mut self) -> Result<(), ClientError> {
        let mut status = self.dfu_status()?;
        let mut polls = 0;
        while status != DFU_STATUS_OK {
            if polls >= DFU_STATUS_POLLS {
                return Err(ClientError::DfuStatus { status, polls });
            }
            thread::sleep(self.status_poll);
            polls += 1;
            status = self.dfu_status()?;
        }
        Ok(())
    }

    fn notify_dfu_complete(&mut self, packets: u16) -> Result<(), ClientError> {
        debug!(packets, "Notifying DFU completion");
        self.transport
            .control_out(REQ_DFU_OUT, DFU_DNLOAD, packets, 0, &[], self.timeout)?;
        for _ in 0..2 {
            self.dfu_status()?;
        }
        self.reset()
    }

    fn report_progress(&mut self, sent: u64, total: u64) {
        let percent = if total > 0 {
            sent as f64 / total as f64 * 100.0
        } else {
            100.0
        };
        debug!(sent, total, "Sent {:.1}%", percent);
        self.dispatch(HubEvent::Progress {
            sent,
            total,
            percent,
            label: "Uploading",
        });
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_packet<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn check_complete(sent: u64, total: u64) -> Result<(), ClientError> {
    if sent == total {
        Ok(())
    } else {
        Err(ClientError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {sent} of {total} bytes"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::events::{EventAction, EventKind};
    use crate::protocol::DeviceMode;
    use crate::transport::{MockOp, MockTransport};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_recovery_upload_packets_and_progress() {
        let mock = MockTransport::recovery();
        let mut client = RecoveryClient::new(mock.clone());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_in = progress.clone();
        client.subscribe(EventKind::Progress, move |_, ev| {
            if let HubEvent::Progress { sent, .. } = ev {
                progress_in.lock().unwrap().push(*sent);
            }
            EventAction::Proceed
        });

        let data = payload(RECOVERY_PACKET_SIZE * 2 + 100);
        client.send_buffer(&data, false).unwrap();

        assert_eq!(mock.uploads(), vec![data.clone()]);
        let bulk: Vec<usize> = mock
            .ops()
            .iter()
            .filter_map(|op| match op {
                MockOp::BulkOut { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(bulk, vec![RECOVERY_PACKET_SIZE, RECOVERY_PACKET_SIZE, 100]);
        assert_eq!(
            *progress.lock().unwrap(),
            vec![
                RECOVERY_PACKET_SIZE as u64,
                2 * RECOVERY_PACKET_SIZE as u64,
                data.len() as u64
            ]
        );
    }

    #[test]
    fn test_dfu_upload_appends_trailer_and_crc() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        let mut client = RecoveryClient::new(mock.clone());
        let data = payload(DFU_PACKET_SIZE + 10);
        client.send_buffer(&data, false).unwrap();

        let uploaded = &mock.uploads()[0];
        assert_eq!(uploaded.len(), data.len() + 16);
        assert_eq!(&uploaded[..data.len()], data.as_slice());
        assert_eq!(&uploaded[data.len()..data.len() + 12], &DFU_TRAILER);

        // CRC over payload and trailer, without the final inversion.
        let mut h = crc32fast::Hasher::new();
        h.update(&data);
        h.update(&DFU_TRAILER);
        let expected = !h.finalize();
        let tail = &uploaded[data.len() + 12..];
        assert_eq!(LittleEndian::read_u32(tail), expected);
        assert!(!mock.ops().contains(&MockOp::Reset));
    }

    #[test]
    fn test_dfu_notify_resets() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        let mut client = RecoveryClient::new(mock.clone());
        client.send_buffer(&payload(100), true).unwrap();
        let ops = mock.ops();
        assert!(ops.contains(&MockOp::ControlOut {
            request_type: REQ_DFU_OUT,
            request: DFU_DNLOAD,
            value: 1,
            len: 0,
        }));
        assert_eq!(ops.last(), Some(&MockOp::Reset));
    }

    #[test]
    fn test_dfu_error_state_clears_and_fails() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        mock.set_dfu_state(DFU_STATE_ERROR);
        let mut client = RecoveryClient::new(mock.clone());
        let err = client.send_buffer(b"abc", false).unwrap_err();
        assert!(matches!(err, ClientError::DfuState { state: 10 }));
        assert_eq!(mock.dfu_state(), DFU_STATE_IDLE);
        assert!(mock.uploads().is_empty());
    }

    #[test]
    fn test_dfu_status_poll_bounded() {
        let mock = MockTransport::new(DeviceMode::Dfu);
        mock.set_dfu_status(4);
        let mut client = RecoveryClient::new(mock.clone());
        client.set_status_poll_interval(Duration::ZERO);
        let err = client.send_buffer(b"abc", false).unwrap_err();
        assert!(matches!(
            err,
            ClientError::DfuStatus {
                status: 4,
                polls: DFU_STATUS_POLLS
            }
        ));
    }

    #[test]
    fn test_short_bulk_failure_aborts() {
        let mock = MockTransport::recovery();
        mock.fail_bulk();
        let mut client = RecoveryClient::new(mock.clone());
        let err = client.send_buffer(&payload(10), false).unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Pipe)));
    }

    #[test]
    fn test_send_file_streams() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = payload(RECOVERY_PACKET_SIZE + 7);
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let mock = MockTransport::recovery();
        let mut client = RecoveryClient::new(mock.clone());
        client.send_file(file.path(), false).unwrap();
        assert_eq!(mock.uploads(), vec![data]);
    }

    #[test]
    fn test_send_file_missing() {
        let mut client = RecoveryClient::new(MockTransport::recovery());
        let err = client
            .send_file(Path::new("/nonexistent/iBEC.img3"), false)
            .unwrap_err();
        assert!(matches!(err, ClientError::File { .. }));
    }

    #[test]
    fn test_normal_mode_upload_unsupported() {
        let mut client = RecoveryClient::new(MockTransport::new(DeviceMode::Normal));
        assert!(matches!(
            client.send_buffer(b"x", false),
            Err(ClientError::UnsupportedMode(DeviceMode::Normal))
        ));
    }
}
