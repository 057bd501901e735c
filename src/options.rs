//! §6 input: compilation and estimation options. Plain structs, no
//! environment reads — the parsing of CLI/JSON forms of these is the
//! excluded "compilation option parsing" collaborator's job.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationOptions {
    pub enable_winograd: bool,
    pub strict_precision: bool,
    pub activation_compression_savings: f32,
    pub block_config_mask: u32,
    pub enable_intermediate_compression: bool,
    pub dump_ram: bool,
    pub dump_sram: bool,
    pub dump_dram: bool,
    /// Worker-pool size for the weight encoder (§5). `None` defaults to the
    /// host's available parallelism, mirroring
    /// `compilation_options.thread_count`.
    pub thread_count: Option<usize>,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            enable_winograd: true,
            strict_precision: false,
            activation_compression_savings: 0.0,
            block_config_mask: u32::MAX,
            enable_intermediate_compression: false,
            dump_ram: false,
            dump_sram: false,
            dump_dram: false,
            thread_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EstimationOptions {
    pub activation_compression_savings: f32,
    pub use_winograd: bool,
}
