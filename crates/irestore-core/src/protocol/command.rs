//! Bootloader command parsing and framing.

use super::constants::MAX_COMMAND_LEN;

/// A bootloader command, parsed once at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Getenv(String),
    Setenv { name: String, value: String },
    Saveenv,
    Reboot,
    Other(String),
}

impl ParsedCommand {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (verb, rest) = match text.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (text, ""),
        };

        match verb {
            "getenv" if !rest.is_empty() => ParsedCommand::Getenv(rest.to_string()),
            "setenv" if !rest.is_empty() => {
                let (name, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                ParsedCommand::Setenv {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                }
            }
            "saveenv" => ParsedCommand::Saveenv,
            "reboot" => ParsedCommand::Reboot,
            _ => ParsedCommand::Other(text.to_string()),
        }
    }
}

/// Encode command text for the wire: at most 255 bytes of text followed by NUL.
pub fn encode_command(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let len = bytes.len().min(MAX_COMMAND_LEN);
    let mut frame = Vec::with_capacity(len + 1);
    frame.extend_from_slice(&bytes[..len]);
    frame.push(0);
    frame
}

/// Decode a NUL-terminated response buffer.
pub fn decode_response(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim_end().to_string()
}
