//! Module I: the global buffer registry and DRAM offset assignment.
//!
//! Grounded directly on `BufferManager.hpp`'s `CompilerBufferInfo` / the
//! `first_fit_allocation::FirstFitAllocation` free function.

use crate::errors::{CResult, CompilerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const INVALID_OFFSET: u32 = 0xFFFF_FFFF;
/// `BufferManager::AddCommandStream` always lands at this well-known id.
pub const COMMAND_STREAM_BUFFER_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferType {
    Input,
    Output,
    ConstantDma,
    ConstantControlUnit,
    Intermediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferLocation {
    None,
    Dram,
    Sram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferInfo {
    pub id: u32,
    pub buffer_type: BufferType,
    pub offset: u32,
    pub size: u32,
    pub location: BufferLocation,
    pub constant_data: Vec<u8>,
    pub source_operation_id: Option<u32>,
    pub source_operation_output_index: Option<u32>,
    pub lifetime_start: u32,
    pub lifetime_end: u32,
    pub debug_name: String,
    pub alignment: u32,
}

impl BufferInfo {
    fn new(id: u32, buffer_type: BufferType, size: u32, location: BufferLocation) -> Self {
        Self {
            id,
            buffer_type,
            offset: INVALID_OFFSET,
            size,
            location,
            constant_data: Vec::new(),
            source_operation_id: None,
            source_operation_output_index: None,
            lifetime_start: INVALID_OFFSET,
            lifetime_end: INVALID_OFFSET,
            debug_name: String::new(),
            alignment: 1,
        }
    }
}

/// Minimal description of a buffer for the first-fit scan.
#[derive(Debug, Clone, Copy)]
pub struct LifetimeBuffer {
    pub lifetime_start: u32,
    pub lifetime_end: u32,
    pub size: u32,
}

/// First-fit placement: scans candidate addresses `0, alignment, 2*alignment, ...`
/// and accepts the smallest one that doesn't overlap, in both lifetime and
/// address range, any buffer already placed. Input order is preserved in the
/// output (`result[i]` is buffer `i`'s offset).
pub fn first_fit_allocation(buffers: &[LifetimeBuffer], alignment: u32) -> Vec<u32> {
    let mut placed: Vec<(u32, u32, u32, u32)> = Vec::with_capacity(buffers.len()); // (start_addr, end_addr, lifetime_start, lifetime_end)
    let mut result = Vec::with_capacity(buffers.len());

    for buf in buffers {
        let mut candidate: u32 = 0;
        loop {
            let candidate_end = candidate + buf.size;
            let overlaps = placed.iter().any(|&(s, e, ls, le)| {
                let space_overlap = candidate < e && s < candidate_end;
                let time_overlap = buf.lifetime_start < le && ls < buf.lifetime_end;
                space_overlap && time_overlap
            });
            if !overlaps {
                break;
            }
            candidate += alignment;
        }
        placed.push((candidate, candidate + buf.size, buf.lifetime_start, buf.lifetime_end));
        result.push(candidate);
    }
    result
}

/// Deterministic-order buffer registry. Uses a `BTreeMap` (rather than a
/// `HashMap`) specifically so `allocate()` iterates buffers in a fixed
/// order regardless of hash seed, which §8 property 6 (command-stream
/// determinism) depends on.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: BTreeMap<u32, BufferInfo>,
    next_dram_id: u32,
    next_sram_id: u32,
    constant_dma_data: Vec<u8>,
    constant_control_unit_data: Vec<u8>,
    allocated: bool,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            next_dram_id: 1,
            next_sram_id: 1,
            ..Default::default()
        }
    }

    fn alloc_dram_id(&mut self) -> u32 {
        let id = self.next_dram_id;
        self.next_dram_id += 1;
        id
    }

    pub fn add_dram(&mut self, buffer_type: BufferType, size: u32) -> u32 {
        let id = self.alloc_dram_id();
        self.buffers
            .insert(id, BufferInfo::new(id, buffer_type, size, BufferLocation::Dram));
        id
    }

    pub fn add_dram_constant(&mut self, buffer_type: BufferType, data: Vec<u8>) -> u32 {
        let id = self.alloc_dram_id();
        let mut info = BufferInfo::new(id, buffer_type, data.len() as u32, BufferLocation::Dram);
        info.constant_data = data;
        self.buffers.insert(id, info);
        id
    }

    pub fn add_dram_input(&mut self, size: u32, source_op_id: u32) -> u32 {
        let id = self.alloc_dram_id();
        let mut info = BufferInfo::new(id, BufferType::Input, size, BufferLocation::Dram);
        info.source_operation_id = Some(source_op_id);
        self.buffers.insert(id, info);
        id
    }

    pub fn add_sram(&mut self, size: u32, offset: u32) -> u32 {
        let id = self.next_sram_id;
        self.next_sram_id += 1;
        let mut info = BufferInfo::new(id, BufferType::Intermediate, size, BufferLocation::Sram);
        info.offset = offset;
        self.buffers.insert(id, info);
        id
    }

    pub fn add_command_stream(&mut self, bytes: Vec<u8>) {
        let mut info = BufferInfo::new(
            COMMAND_STREAM_BUFFER_ID,
            BufferType::ConstantControlUnit,
            bytes.len() as u32,
            BufferLocation::Dram,
        );
        info.constant_data = bytes;
        self.buffers.insert(COMMAND_STREAM_BUFFER_ID, info);
    }

    pub fn change_to_output(&mut self, id: u32, source_op_id: u32, out_idx: u32) -> CResult<()> {
        let info = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| CompilerError::internal("change_to_output: unknown buffer id"))?;
        info.buffer_type = BufferType::Output;
        info.source_operation_id = Some(source_op_id);
        info.source_operation_output_index = Some(out_idx);
        Ok(())
    }

    pub fn change_buffer_alignment(&mut self, id: u32, alignment: u32) -> CResult<()> {
        let info = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| CompilerError::internal("change_buffer_alignment: unknown buffer id"))?;
        info.alignment = alignment;
        Ok(())
    }

    pub fn set_debug_name(&mut self, id: u32, name: impl Into<String>) {
        if let Some(info) = self.buffers.get_mut(&id) {
            info.debug_name = name.into();
        }
    }

    /// Grows `[lifetime_start, lifetime_end)` to cover `[start, end)`.
    pub fn mark_buffer_used_at_time(&mut self, id: u32, start: u32, end: u32) -> CResult<()> {
        let info = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| CompilerError::internal("mark_buffer_used_at_time: unknown buffer id"))?;
        info.lifetime_start = info.lifetime_start.min(start);
        info.lifetime_end = info.lifetime_end.max(end);
        Ok(())
    }

    pub fn get_sram_offset(&self, id: u32) -> u32 {
        self.buffers
            .get(&id)
            .filter(|b| b.location == BufferLocation::Sram)
            .map(|b| b.offset)
            .unwrap_or(0)
    }

    pub fn buffers(&self) -> &BTreeMap<u32, BufferInfo> {
        &self.buffers
    }

    pub fn constant_dma_data(&self) -> &[u8] {
        &self.constant_dma_data
    }

    pub fn constant_control_unit_data(&self) -> &[u8] {
        &self.constant_control_unit_data
    }

    /// Lays out all Intermediate DRAM buffers via first-fit, concatenates
    /// constant payloads into the two constant-data blobs, and assigns
    /// offsets. Call once, after every buffer has been registered.
    pub fn allocate(&mut self) -> CResult<()> {
        let alignment = 16; // one brick-group row's worth of bytes; matches tensor::BRICK_GROUP.c.

        // 1. Intermediates, in ascending-id (i.e. BTreeMap iteration) order.
        let intermediate_ids: Vec<u32> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.buffer_type == BufferType::Intermediate && b.location == BufferLocation::Dram)
            .map(|(&id, _)| id)
            .collect();
        let lifetime_bufs: Vec<LifetimeBuffer> = intermediate_ids
            .iter()
            .map(|id| {
                let b = &self.buffers[id];
                LifetimeBuffer {
                    lifetime_start: if b.lifetime_start == INVALID_OFFSET { 0 } else { b.lifetime_start },
                    lifetime_end: if b.lifetime_end == INVALID_OFFSET { u32::MAX } else { b.lifetime_end },
                    size: b.size,
                }
            })
            .collect();
        let offsets = first_fit_allocation(&lifetime_bufs, alignment);
        for (id, offset) in intermediate_ids.into_iter().zip(offsets) {
            self.buffers.get_mut(&id).unwrap().offset = offset;
        }

        // 2. Constant payloads, concatenated in id order; each buffer's own
        // alignment (default 1, overridable via change_buffer_alignment) is
        // respected within its own blob.
        self.constant_dma_data.clear();
        self.constant_control_unit_data.clear();
        for (_, b) in self.buffers.iter_mut() {
            match b.buffer_type {
                BufferType::ConstantDma => {
                    pad_to_alignment(&mut self.constant_dma_data, b.alignment);
                    b.offset = self.constant_dma_data.len() as u32;
                    self.constant_dma_data.extend_from_slice(&b.constant_data);
                }
                BufferType::ConstantControlUnit => {
                    pad_to_alignment(&mut self.constant_control_unit_data, b.alignment);
                    b.offset = self.constant_control_unit_data.len() as u32;
                    self.constant_control_unit_data.extend_from_slice(&b.constant_data);
                }
                BufferType::Input | BufferType::Output => {
                    b.offset = 0;
                }
                BufferType::Intermediate => {}
            }
        }

        self.allocated = true;
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }
}

fn pad_to_alignment(buf: &mut Vec<u8>, alignment: u32) {
    let alignment = alignment.max(1) as usize;
    let rem = buf.len() % alignment;
    if rem != 0 {
        buf.resize(buf.len() + (alignment - rem), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_address_after_lifetime_ends() {
        let buffers = vec![
            LifetimeBuffer { lifetime_start: 0, lifetime_end: 2, size: 100 },
            LifetimeBuffer { lifetime_start: 2, lifetime_end: 4, size: 100 },
        ];
        let offsets = first_fit_allocation(&buffers, 16);
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 0); // disjoint lifetimes -> same address reused
    }

    #[test]
    fn first_fit_keeps_overlapping_lifetimes_disjoint_in_space() {
        let buffers = vec![
            LifetimeBuffer { lifetime_start: 0, lifetime_end: 4, size: 100 },
            LifetimeBuffer { lifetime_start: 1, lifetime_end: 2, size: 50 },
        ];
        let offsets = first_fit_allocation(&buffers, 16);
        assert!(offsets[1] >= offsets[0] + 100 || offsets[0] >= offsets[1] + 50);
    }

    #[test]
    fn allocate_assigns_offsets_and_concatenates_constants() {
        let mut bm = BufferManager::new();
        let c1 = bm.add_dram_constant(BufferType::ConstantDma, vec![1, 2, 3]);
        let c2 = bm.add_dram_constant(BufferType::ConstantDma, vec![4, 5]);
        bm.allocate().unwrap();
        assert_eq!(bm.buffers()[&c1].offset, 0);
        assert!(bm.buffers()[&c2].offset >= 3);
        assert!(bm.constant_dma_data().len() >= 5);
    }
}
