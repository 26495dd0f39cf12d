//! irestore-core: iOS restore over USB in Rust.
//!
//! Drives a device from whatever mode it is found in (normal, DFU, WTF or
//! recovery) to the point where it boots a restore ramdisk.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: USB constants, device modes, identity strings, command frames
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Client**: Bootloader command channel and uploads
//! - **Events**: Per-connection event hub and session observer
//! - **TSS**: Signing ticket requests and responses
//! - **Manifest / Archive**: Build identities and firmware file access
//! - **State**: State machine and per-state handlers
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use irestore_core::archive::ExtractedArchive;
//! use irestore_core::session::{RestoreConfig, RestoreSession};
//! use irestore_core::transport::NusbConnector;
//! use irestore_core::tss::HttpTssTransport;
//!
//! let config = RestoreConfig::default();
//! let signer = HttpTssTransport::new().expect("HTTP client");
//! let mut session = RestoreSession::new(
//!     config,
//!     NusbConnector,
//!     ExtractedArchive::new("firmware"),
//!     signer,
//! );
//! session.run().expect("restore failed");
//! ```

pub mod archive;
pub mod client;
pub mod error;
pub mod events;
pub mod lockdown;
pub mod manifest;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod state;
pub mod transport;
pub mod tss;

// Re-exports for convenience
pub use archive::{ExtractedArchive, FirmwareArchive, MemoryArchive};
pub use client::{ClientError, RecoveryClient};
pub use error::{ErrorKind, RestoreError, RestoreFailure};
pub use events::{LogLevel, NullObserver, RestoreEvent, RestoreObserver, TracingObserver};
pub use lockdown::{NoNormalModeChannel, NormalModeChannel};
pub use manifest::{BuildIdentity, BuildManifest, RestoreBehavior};
pub use protocol::{DeviceIdentity, DeviceMode};
pub use retry::RetryPolicy;
pub use session::{RestoreConfig, RestoreFlags, RestoreSession};
pub use state::RestoreState;
pub use transport::{MockConnector, MockTransport, NusbConnector, TransportError, UsbTransport};
pub use tss::{HttpTssTransport, TssError, TssTransport};
