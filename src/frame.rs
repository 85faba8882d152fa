//! Wire framing for the device tunnel.
//!
//! Binary WebSocket messages carry a one-byte tag at offset 0 followed by the
//! payload. Text messages carry ASCII command lines with a case-insensitive
//! verb and whitespace-split arguments.

use bytes::Bytes;
use thiserror::Error;

/// Tag values for binary tunnel frames.
pub const TAG_PROXY_DATA: u8 = 1;
pub const TAG_DEVICE_DATA: u8 = 2;
pub const TAG_OPEN: u8 = 3;
pub const TAG_CLOSE: u8 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty binary frame")]
    Empty,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
}

/// A decoded binary tunnel frame.
///
/// `ProxyData` flows gateway → device (bytes the capture process wrote toward
/// the camera); `DeviceData` flows device → gateway (bytes from the camera).
/// `Open` and `Close` instruct the device to open or drop its camera socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    ProxyData(Bytes),
    DeviceData(Bytes),
    Open,
    Close,
}

impl TunnelFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TunnelFrame::ProxyData(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_PROXY_DATA);
                buf.extend_from_slice(payload);
                buf
            }
            TunnelFrame::DeviceData(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_DEVICE_DATA);
                buf.extend_from_slice(payload);
                buf
            }
            TunnelFrame::Open => vec![TAG_OPEN],
            TunnelFrame::Close => vec![TAG_CLOSE],
        }
    }

    pub fn decode(raw: &[u8]) -> Result<TunnelFrame, FrameError> {
        let (&tag, payload) = raw.split_first().ok_or(FrameError::Empty)?;
        match tag {
            TAG_PROXY_DATA => Ok(TunnelFrame::ProxyData(Bytes::copy_from_slice(payload))),
            TAG_DEVICE_DATA => Ok(TunnelFrame::DeviceData(Bytes::copy_from_slice(payload))),
            TAG_OPEN => Ok(TunnelFrame::Open),
            TAG_CLOSE => Ok(TunnelFrame::Close),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("HELLO requires one or two arguments")]
    BadHello,
    #[error("AUTH requires a device id and a signature")]
    BadAuth,
}

/// Command lines the device may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Hello {
        payload_id: Option<String>,
        device_id: String,
    },
    Auth {
        device_id: String,
        signature_b64: String,
    },
}

impl DeviceCommand {
    /// Parse one text line. `Ok(None)` means the verb is unknown and the line
    /// must be ignored; a known verb with the wrong arity is an error.
    pub fn parse(line: &str) -> Result<Option<DeviceCommand>, CommandError> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = parts.collect();

        if verb.eq_ignore_ascii_case("HELLO") {
            return match args.as_slice() {
                [device_id] => Ok(Some(DeviceCommand::Hello {
                    payload_id: None,
                    device_id: (*device_id).to_string(),
                })),
                [payload_id, device_id] => Ok(Some(DeviceCommand::Hello {
                    payload_id: Some((*payload_id).to_string()),
                    device_id: (*device_id).to_string(),
                })),
                _ => Err(CommandError::BadHello),
            };
        }

        if verb.eq_ignore_ascii_case("AUTH") {
            return match args.as_slice() {
                [device_id, signature_b64] => Ok(Some(DeviceCommand::Auth {
                    device_id: (*device_id).to_string(),
                    signature_b64: (*signature_b64).to_string(),
                })),
                _ => Err(CommandError::BadAuth),
            };
        }

        Ok(None)
    }
}

/// Command lines the gateway sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    Ready,
    Challenge(String),
    AuthOk,
    AuthFail(String),
    HelloFail(String),
}

impl std::fmt::Display for GatewayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayCommand::Ready => write!(f, "READY"),
            GatewayCommand::Challenge(nonce) => write!(f, "CHAL {nonce}"),
            GatewayCommand::AuthOk => write!(f, "AUTH_OK"),
            GatewayCommand::AuthFail(reason) => write!(f, "AUTH_FAIL {reason}"),
            GatewayCommand::HelloFail(reason) => write!(f, "HELLO_FAIL {reason}"),
        }
    }
}
