//! Persisted configuration record for a log device.

use std::convert::TryInto;
use std::ops::Range;

use uuid::Uuid;

use crate::types::{MareaError, Result};

pub const PACKED_LOG_DEVICE_CONFIG_SIZE: usize = 64;
pub const CONFIG_TAG_LOG_DEVICE: u32 = 2;

const CFG_TAG: Range<usize> = 0..4;
const CFG_PAD0: Range<usize> = 4..6;
const CFG_PAGES_PER_BLOCK_LOG2: Range<usize> = 6..8;
const CFG_BLOCK_0_OFFSET: Range<usize> = 8..16;
const CFG_PHYSICAL_SIZE: Range<usize> = 16..24;
const CFG_LOGICAL_SIZE: Range<usize> = 24..32;
const CFG_UUID: Range<usize> = 32..48;
const CFG_PAD1: Range<usize> = 48..64;

/// Caller-facing options for provisioning a log device.
#[derive(Clone, Debug)]
pub struct LogDeviceConfigOptions {
    /// The capacity in bytes of the log.
    pub log_size: u64,
    /// Unique identifier for the log; generated when absent.
    pub uuid: Option<Uuid>,
    /// log2 of the number of 4KiB pages per flush block.
    pub pages_per_block_log2: Option<u16>,
}

pub const DEFAULT_PAGES_PER_BLOCK_LOG2: u16 = 1;

/// Fixed 64-byte on-storage form of a log device's configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackedLogDeviceConfig {
    pub pages_per_block_log2: u16,
    /// Offset of flush block 0 relative to this structure.
    pub block_0_offset: i64,
    pub physical_size: u64,
    /// Logical size of the log; excludes block headers.
    pub logical_size: u64,
    pub uuid: Uuid,
}

const _: () = assert!(CFG_PAD1.end == PACKED_LOG_DEVICE_CONFIG_SIZE);

impl PackedLogDeviceConfig {
    pub fn from_options(
        options: &LogDeviceConfigOptions,
        block_0_offset: i64,
        physical_size: u64,
    ) -> Self {
        Self {
            pages_per_block_log2: options
                .pages_per_block_log2
                .unwrap_or(DEFAULT_PAGES_PER_BLOCK_LOG2),
            block_0_offset,
            physical_size,
            logical_size: options.log_size,
            uuid: options.uuid.unwrap_or_else(Uuid::new_v4),
        }
    }

    pub fn pages_per_block(&self) -> u64 {
        1u64 << self.pages_per_block_log2
    }

    pub fn block_size(&self) -> u64 {
        4 * 1024 * self.pages_per_block()
    }

    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PACKED_LOG_DEVICE_CONFIG_SIZE {
            return Err(MareaError::Invalid("log config buffer too small"));
        }
        let buf = &mut dst[..PACKED_LOG_DEVICE_CONFIG_SIZE];
        buf.fill(0);
        buf[CFG_TAG].copy_from_slice(&CONFIG_TAG_LOG_DEVICE.to_le_bytes());
        buf[CFG_PAGES_PER_BLOCK_LOG2].copy_from_slice(&self.pages_per_block_log2.to_le_bytes());
        buf[CFG_BLOCK_0_OFFSET].copy_from_slice(&self.block_0_offset.to_le_bytes());
        buf[CFG_PHYSICAL_SIZE].copy_from_slice(&self.physical_size.to_le_bytes());
        buf[CFG_LOGICAL_SIZE].copy_from_slice(&self.logical_size.to_le_bytes());
        buf[CFG_UUID].copy_from_slice(self.uuid.as_bytes());
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PACKED_LOG_DEVICE_CONFIG_SIZE {
            return Err(MareaError::Decode("log config truncated"));
        }
        let buf = &src[..PACKED_LOG_DEVICE_CONFIG_SIZE];
        let tag = u32::from_le_bytes(buf[CFG_TAG].try_into().unwrap());
        if tag != CONFIG_TAG_LOG_DEVICE {
            return Err(MareaError::Decode("log config has wrong tag"));
        }
        if buf[CFG_PAD0].iter().any(|b| *b != 0) || buf[CFG_PAD1].iter().any(|b| *b != 0) {
            return Err(MareaError::Decode("log config reserved bytes non-zero"));
        }
        let pages_per_block_log2 =
            u16::from_le_bytes(buf[CFG_PAGES_PER_BLOCK_LOG2].try_into().unwrap());
        let block_0_offset = i64::from_le_bytes(buf[CFG_BLOCK_0_OFFSET].try_into().unwrap());
        let physical_size = u64::from_le_bytes(buf[CFG_PHYSICAL_SIZE].try_into().unwrap());
        let logical_size = u64::from_le_bytes(buf[CFG_LOGICAL_SIZE].try_into().unwrap());
        let uuid = Uuid::from_bytes(buf[CFG_UUID].try_into().unwrap());
        Ok(Self {
            pages_per_block_log2,
            block_0_offset,
            physical_size,
            logical_size,
            uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let options = LogDeviceConfigOptions {
            log_size: 1 << 20,
            uuid: Some(Uuid::new_v4()),
            pages_per_block_log2: Some(3),
        };
        let config = PackedLogDeviceConfig::from_options(&options, 4096, (1 << 20) + 8192);
        let mut buf = [0u8; PACKED_LOG_DEVICE_CONFIG_SIZE];
        config.encode(&mut buf).unwrap();
        let decoded = PackedLogDeviceConfig::decode(&buf).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.pages_per_block(), 8);
        assert_eq!(decoded.block_size(), 8 * 4096);
    }

    #[test]
    fn decode_rejects_bad_tag() {
        let mut buf = [0u8; PACKED_LOG_DEVICE_CONFIG_SIZE];
        buf[0] = 0xFF;
        assert!(matches!(
            PackedLogDeviceConfig::decode(&buf),
            Err(MareaError::Decode(_))
        ));
    }
}
