//! Signing (TSS) client.
//!
//! Builds the personalization request for a build identity and device,
//! exchanges it with the signing server, and reads the boot ticket and
//! per-component blobs out of the answer.

mod request;
mod response;
mod transport;

pub use request::{BasebandParams, TssRequest, build_baseband_request, build_request};
pub use response::{
    SigningTicket, TicketKey, TssResponse, extract_component_blob, extract_ticket, parse_response,
};
pub use transport::{DEFAULT_TSS_URL, HttpTssTransport, TssTransport, send_request};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TssError {
    #[error("Build identity is missing or has a malformed {0}")]
    MalformedBuildIdentity(String),

    #[error("Device chip {device:#x} does not match build identity chip {manifest:#x}")]
    ChipMismatch { device: u32, manifest: u32 },

    #[error("Signing request failed: {0}")]
    Network(String),

    #[error("Signing server rejected the request (status {status}): {message}")]
    ServerRejected { status: i64, message: String },

    #[error("Malformed signing response: {0}")]
    MalformedResponse(String),

    #[error("{0} not present in signing response")]
    NotPresent(String),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),
}
