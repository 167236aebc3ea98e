//! Wire message carried by a control channel.
//!
//! Each queue entry holds one message:
//!
//! ```text
//! [mtype: c_long = 1][tag: i32][size: u32][payload: size bytes, max 8000]
//! ```
//!
//! Structured messages carry UTF-8 JSON with tag [`IpcConfig::JSON_TAG`].

use crate::config::IpcConfig;
use crate::error::{ProcwardError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One discrete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub tag: i32,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    pub fn new(tag: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Serialize `value` into a JSON-tagged message.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let message = Self::new(IpcConfig::JSON_TAG, serde_json::to_vec(value)?);
        message.check_size()?;
        Ok(message)
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.tag != IpcConfig::JSON_TAG {
            return Err(ProcwardError::Json {
                message: format!("message tag {} is not a JSON payload", self.tag),
                source: None,
            });
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Reject payloads that cannot fit in one queue entry.
    pub fn check_size(&self) -> Result<()> {
        if self.payload.len() > IpcConfig::MAX_PAYLOAD_SIZE {
            return Err(ProcwardError::PayloadTooLarge {
                size: self.payload.len(),
                max: IpcConfig::MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }
}
