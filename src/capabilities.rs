//! Hardware capability record (§6 input). A plain value threaded explicitly
//! through construction — never read from a process-wide mutable location,
//! per the "no global capability singleton" design note.

use crate::errors::{CResult, CompilerError};
use serde::{Deserialize, Serialize};

pub const CAPABILITIES_TAG: [u8; 4] = *b"CAPN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinogradBlockSizes {
    pub one_by_one: u32,
    pub one_by_three: u32,
    pub three_by_one: u32,
    pub three_by_three: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub version: (u32, u32, u32),
    pub total_sram_bytes: u32,
    pub num_srams: u32,
    pub num_engines: u32,
    pub igs_per_engine: u32,
    pub ogs_per_engine: u32,
    pub macs_per_og: u32,
    pub max_ple_size: u32,
    pub winograd_block_sizes: WinogradBlockSizes,
    pub supported_block_configs: Vec<(u32, u32)>,
    pub supports_nchw: bool,
}

impl HardwareCapabilities {
    /// A representative capability set for an 8-SRAM-lane, 8-engine part;
    /// used by tests and as a documented default for callers without a
    /// real blob handy.
    pub fn reference() -> Self {
        Self {
            version: (1, 0, 0),
            total_sram_bytes: 1024 * 1024,
            num_srams: 4,
            num_engines: 8,
            igs_per_engine: 2,
            ogs_per_engine: 2,
            macs_per_og: 8,
            max_ple_size: 64 * 1024,
            winograd_block_sizes: WinogradBlockSizes {
                one_by_one: 1,
                one_by_three: 3,
                three_by_one: 3,
                three_by_three: 4,
            },
            supported_block_configs: vec![(8, 8), (16, 16), (8, 32), (32, 8)],
            supports_nchw: false,
        }
    }

    /// SRAM bytes available per lane, which is the unit the allocator works
    /// in (§4.E: "one logical pool of size total_sram / num_srams").
    pub fn sram_bytes_per_lane(&self) -> u32 {
        if self.num_srams == 0 {
            0
        } else {
            self.total_sram_bytes / self.num_srams
        }
    }

    pub fn total_macs_per_cycle(&self) -> u32 {
        self.num_engines * self.igs_per_engine * self.ogs_per_engine * self.macs_per_og
    }

    /// Parses the versioned binary blob from §6:
    /// `{tag: [u8;4]="CAPN", major: u32, minor: u32, patch: u32, ...fields}`.
    /// Only the header is validated bit-exactly here; the remaining fields
    /// are read in the declared order via little-endian `u32`s (and a
    /// trailing byte for `supports_nchw`), matching the "all multi-byte
    /// integers are little-endian" rule from §6.
    pub fn parse(bytes: &[u8]) -> CResult<Self> {
        let mut cursor = 0usize;
        let read_u32 = |bytes: &[u8], cursor: &mut usize| -> CResult<u32> {
            let slice = bytes
                .get(*cursor..*cursor + 4)
                .ok_or_else(|| CompilerError::ParseException("capability blob truncated".into()))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(slice.try_into().unwrap()))
        };

        if bytes.len() < 4 || bytes[0..4] != CAPABILITIES_TAG {
            return Err(CompilerError::ParseException(
                "capability blob missing CAPN tag".into(),
            ));
        }
        cursor += 4;
        let major = read_u32(bytes, &mut cursor)?;
        let minor = read_u32(bytes, &mut cursor)?;
        let patch = read_u32(bytes, &mut cursor)?;

        let total_sram_bytes = read_u32(bytes, &mut cursor)?;
        let num_srams = read_u32(bytes, &mut cursor)?;
        let num_engines = read_u32(bytes, &mut cursor)?;
        let igs_per_engine = read_u32(bytes, &mut cursor)?;
        let ogs_per_engine = read_u32(bytes, &mut cursor)?;
        let macs_per_og = read_u32(bytes, &mut cursor)?;
        let max_ple_size = read_u32(bytes, &mut cursor)?;
        let w1 = read_u32(bytes, &mut cursor)?;
        let w2 = read_u32(bytes, &mut cursor)?;
        let w3 = read_u32(bytes, &mut cursor)?;
        let w4 = read_u32(bytes, &mut cursor)?;
        let num_block_configs = read_u32(bytes, &mut cursor)?;
        let mut supported_block_configs = Vec::with_capacity(num_block_configs as usize);
        for _ in 0..num_block_configs {
            let w = read_u32(bytes, &mut cursor)?;
            let h = read_u32(bytes, &mut cursor)?;
            supported_block_configs.push((w, h));
        }
        let nchw_byte = *bytes
            .get(cursor)
            .ok_or_else(|| CompilerError::ParseException("capability blob truncated (nchw flag)".into()))?;

        Ok(Self {
            version: (major, minor, patch),
            total_sram_bytes,
            num_srams,
            num_engines,
            igs_per_engine,
            ogs_per_engine,
            macs_per_og,
            max_ple_size,
            winograd_block_sizes: WinogradBlockSizes {
                one_by_one: w1,
                one_by_three: w2,
                three_by_one: w3,
                three_by_three: w4,
            },
            supported_block_configs,
            supports_nchw: nchw_byte != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_capabilities_are_internally_consistent() {
        let caps = HardwareCapabilities::reference();
        assert!(caps.sram_bytes_per_lane() > 0);
        assert!(caps.total_macs_per_cycle() > 0);
    }
}
