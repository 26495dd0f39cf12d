//! Error taxonomy shared by every layer.

use std::fmt;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::client::ClientError;
use crate::lockdown::ChannelError;
use crate::manifest::ManifestError;
use crate::state::RestoreState;
use crate::transport::TransportError;
use crate::tss::TssError;

/// Coarse error classification reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoDevice,
    UnableToConnect,
    Timeout,
    UsbTransferFailure,
    MalformedBuildIdentity,
    ComponentNotFound,
    ServerRejected,
    NetworkError,
    DeviceUnreachable,
    ProtocolViolation,
    Aborted,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NoDevice { .. } => ErrorKind::NoDevice,
            TransportError::UnableToConnect(_) => ErrorKind::UnableToConnect,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            TransportError::Pipe
            | TransportError::UsbStatus(_)
            | TransportError::ShortTransfer { .. }
            | TransportError::Disconnected
            | TransportError::Io(_) => ErrorKind::UsbTransferFailure,
        }
    }
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(e) => e.kind(),
            ClientError::InvalidCommand(_) => ErrorKind::Configuration,
            ClientError::UnsupportedMode(_)
            | ClientError::DfuState { .. }
            | ClientError::DfuStatus { .. }
            | ClientError::MalformedResponse { .. } => ErrorKind::ProtocolViolation,
            ClientError::File { .. } => ErrorKind::ComponentNotFound,
            ClientError::Io(_) => ErrorKind::UsbTransferFailure,
        }
    }
}

impl TssError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TssError::MalformedBuildIdentity(_) | TssError::ChipMismatch { .. } => {
                ErrorKind::MalformedBuildIdentity
            }
            TssError::Network(_) => ErrorKind::NetworkError,
            TssError::ServerRejected { .. } => ErrorKind::ServerRejected,
            TssError::MalformedResponse(_) | TssError::Plist(_) => ErrorKind::ProtocolViolation,
            TssError::NotPresent(_) => ErrorKind::ComponentNotFound,
        }
    }
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedBuildIdentity
    }
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Manifest(e) => e.kind(),
            _ => ErrorKind::ComponentNotFound,
        }
    }
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Unavailable => ErrorKind::DeviceUnreachable,
            ChannelError::NoDevice => ErrorKind::NoDevice,
            ChannelError::Protocol(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Orchestrator-level error.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Tss(#[from] TssError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Device did not reappear after {attempts} attempts")]
    DeviceUnreachable { attempts: u32 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Component {0} not found")]
    ComponentNotFound(String),

    #[error("Restore aborted")]
    Aborted,

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl RestoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RestoreError::Transport(e) => e.kind(),
            RestoreError::Client(e) => e.kind(),
            RestoreError::Tss(e) => e.kind(),
            RestoreError::Manifest(e) => e.kind(),
            RestoreError::Archive(e) => e.kind(),
            RestoreError::Channel(e) => e.kind(),
            RestoreError::DeviceUnreachable { .. } => ErrorKind::DeviceUnreachable,
            RestoreError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            RestoreError::ComponentNotFound(_) => ErrorKind::ComponentNotFound,
            RestoreError::Aborted => ErrorKind::Aborted,
            RestoreError::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

/// Terminal failure of a restore session: the state it failed in and why.
#[derive(Error, Debug)]
#[error("Restore failed in state {state}: {error}")]
pub struct RestoreFailure {
    pub state: RestoreState,
    #[source]
    pub error: RestoreError,
}

impl RestoreFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_pass_through_layers() {
        let e = RestoreError::from(ClientError::from(TransportError::Pipe));
        assert_eq!(e.kind(), ErrorKind::UsbTransferFailure);

        let e = RestoreError::from(TssError::ServerRejected {
            status: 94,
            message: String::new(),
        });
        assert_eq!(e.kind(), ErrorKind::ServerRejected);

        let e = RestoreError::from(TransportError::NoDevice { ecid: Some(1) });
        assert_eq!(e.kind(), ErrorKind::NoDevice);
    }

    #[test]
    fn test_failure_display() {
        let f = RestoreFailure {
            state: RestoreState::StagingComponents,
            error: RestoreError::ComponentNotFound("RestoreRamDisk".into()),
        };
        assert_eq!(
            f.to_string(),
            "Restore failed in state StagingComponents: Component RestoreRamDisk not found"
        );
        assert_eq!(f.kind(), ErrorKind::ComponentNotFound);
    }
}
