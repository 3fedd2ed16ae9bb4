//! Length-prefixed framing for the shared-buffer transport.
//!
//! A frame is a 4-byte little-endian payload length followed by the JSON-encoded payload. The
//! buffer never grows: a frame that does not fit is an encoding error for the in-flight call.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SqlAccessError;

const LENGTH_PREFIX: usize = 4;

/// How requests and replies travel between callers and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Values move through the command channel.
    #[default]
    Direct,
    /// Values are serialized into a fixed-size buffer owned by each worker.
    SharedBuffer { capacity: usize },
}

/// Fixed-capacity frame buffer shared by one worker and its current caller.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Box<[u8]>,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Serialize `value` into the buffer, replacing the previous frame.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::Encoding`] if serialization fails or the frame exceeds the
    /// capacity.
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<usize, SqlAccessError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| SqlAccessError::Encoding(format!("cannot encode frame: {err}")))?;
        let total = LENGTH_PREFIX + payload.len();
        if total > self.capacity() {
            return Err(SqlAccessError::Encoding(format!(
                "frame of {total} bytes exceeds shared buffer capacity of {} bytes",
                self.capacity()
            )));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| SqlAccessError::Encoding("frame length overflows u32".into()))?;
        self.bytes[..LENGTH_PREFIX].copy_from_slice(&len.to_le_bytes());
        self.bytes[LENGTH_PREFIX..total].copy_from_slice(&payload);
        Ok(total)
    }

    /// Decode the current frame.
    ///
    /// # Errors
    /// Returns [`SqlAccessError::Encoding`] for a truncated or malformed frame.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, SqlAccessError> {
        let prefix: [u8; LENGTH_PREFIX] = self
            .bytes
            .get(..LENGTH_PREFIX)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SqlAccessError::Encoding("buffer smaller than a frame header".into()))?;
        let len = u32::from_le_bytes(prefix) as usize;
        let payload = self
            .bytes
            .get(LENGTH_PREFIX..LENGTH_PREFIX + len)
            .ok_or_else(|| SqlAccessError::Encoding(format!("frame length {len} out of bounds")))?;
        serde_json::from_slice(payload)
            .map_err(|err| SqlAccessError::Encoding(format!("cannot decode frame: {err}")))
    }
}
