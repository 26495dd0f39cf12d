//! Protocol module - iBoot/DFU wire definitions.

pub mod command;
pub mod constants;
pub mod identity;
pub mod mode;

pub use command::{ParsedCommand, decode_response, encode_command};
pub use constants::*;
pub use identity::DeviceIdentity;
pub use mode::DeviceMode;
