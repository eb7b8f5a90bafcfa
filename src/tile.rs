//! Tile / tile-component / resolution / subband / code-block model.
//!
//! Built identically by the encoder (from `EncodeParams`) and the decoder
//! (from parsed markers), so packet iteration and code-block addressing
//! agree on both sides by construction. Code-blocks carry the Tier-1
//! state for whichever direction is running.

use crate::bit_plane_coder::EncodedBlock;
use crate::config::{CblkStyle, ColorTransform, ProgressionOrder, QuantizationStyle};
use crate::geometry::{
    codeblock_grid, codeblock_rect, precinct_band_rect, precinct_grid, precinct_rect,
    resolution_rect, subband_rect, GridGeometry, Rect, SubbandKind,
};
use crate::image::ComponentInfo;
use crate::quantization::{band_norm, derived_step, max_bitplanes, StepSize};

/// Per-component coding and quantization parameters (COD/COC + QCD/QCC).
#[derive(Debug, Clone)]
pub struct CompCoding {
    pub levels: u8,
    pub cblk_w_exp: u8,
    pub cblk_h_exp: u8,
    pub cblk_style: CblkStyle,
    pub reversible: bool,
    /// Per-resolution precinct exponents; empty means 2^15 everywhere.
    pub precincts: Vec<(u8, u8)>,
    pub quant_style: QuantizationStyle,
    pub guard_bits: u8,
    /// Signalled step sizes in subband order: LL first, then HL/LH/HH per
    /// resolution level from coarse to fine. Derived style carries one.
    pub step_sizes: Vec<StepSize>,
    /// ROI max-shift for this component (RGN), 0 when absent.
    pub roi_shift: u8,
}

impl CompCoding {
    pub fn precinct_exps(&self, r: u8) -> (u8, u8) {
        self.precincts
            .get(r as usize)
            .copied()
            .unwrap_or((15, 15))
    }

    pub fn uses_ht(&self) -> bool {
        self.cblk_style
            .intersects(CblkStyle::HT_FAST | CblkStyle::HT_ONLY)
    }
}

/// Everything the pipeline needs to know about the codestream being
/// built or consumed.
#[derive(Debug, Clone)]
pub struct CodingParams {
    pub grid: GridGeometry,
    pub components: Vec<ComponentInfo>,
    pub progression: ProgressionOrder,
    pub num_layers: u16,
    pub mct: ColorTransform,
    pub comp: Vec<CompCoding>,
    pub use_sop: bool,
    pub use_eph: bool,
    /// Part 15 capability: present when any code-block is HT coded.
    pub cap: Option<u32>,
    pub cpf: Option<u16>,
    pub comment: Option<String>,
}

impl CodingParams {
    pub fn uses_ht(&self) -> bool {
        self.comp.iter().any(|c| c.uses_ht())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    /// Band-domain rectangle.
    pub rect: Rect,
    /// Encoder output, populated by Tier-1.
    pub enc: Option<EncodedBlock>,
    /// Cumulative pass count included through each layer (encoder side).
    pub layer_passes: Vec<u32>,

    // Decoder-side packet state.
    pub included: bool,
    /// Layer at which the block was first included (valid once
    /// `included`).
    pub first_layer: u16,
    pub lblock: u8,
    pub zero_planes: u32,
    pub passes_total: u32,
    /// Passes and bytes actually applied (layers within the decode
    /// constraint); parsing beyond it keeps the header state consistent
    /// without growing these.
    pub passes_used: u32,
    /// Concatenated codeword bytes across applied layers.
    pub data: Vec<u8>,
    /// Codeword segment lengths, merged across layers so each entry is a
    /// complete terminated segment (the final one may still be open).
    pub seg_lens: Vec<usize>,
    /// True while the last entry of `seg_lens` continues in a later layer.
    pub seg_open: bool,
    /// Decoded coefficients.
    pub coeffs: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct Precinct {
    /// Band-domain region.
    pub rect: Rect,
    pub cb_gx0: u32,
    pub cb_gx1: u32,
    pub cb_gy0: u32,
    pub cb_gy1: u32,
    pub blocks: Vec<CodeBlock>,
}

impl Precinct {
    pub fn grid_w(&self) -> u32 {
        self.cb_gx1.saturating_sub(self.cb_gx0)
    }

    pub fn grid_h(&self) -> u32 {
        self.cb_gy1.saturating_sub(self.cb_gy0)
    }
}

#[derive(Debug, Clone)]
pub struct Band {
    pub kind: SubbandKind,
    /// 1-based decomposition level of the band (LL carries the total).
    pub lev: u8,
    pub rect: Rect,
    pub step: StepSize,
    /// Actual quantization step (1.0 on the reversible path).
    pub delta: f64,
    /// Bit-plane budget Tier-1 may walk.
    pub mb: u8,
    /// Squared (step x basis norm) weight for distortion accounting.
    pub weight: f64,
    pub precincts: Vec<Precinct>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub level: u8,
    pub rect: Rect,
    pub ppx: u8,
    pub ppy: u8,
    pub num_px: u32,
    pub num_py: u32,
    pub bands: Vec<Band>,
}

impl Resolution {
    pub fn num_precincts(&self) -> u32 {
        self.num_px * self.num_py
    }
}

#[derive(Debug, Clone)]
pub struct TileComp {
    pub comp: usize,
    pub rect: Rect,
    pub levels: u8,
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone)]
pub struct TileModel {
    pub index: u32,
    pub rect: Rect,
    pub components: Vec<TileComp>,
}

/// Signalled subband order: LL, then HL/LH/HH per resolution level.
pub fn band_index(levels: u8, lev: u8, kind: SubbandKind) -> usize {
    match kind {
        SubbandKind::LL => 0,
        _ => {
            let r = levels - lev + 1;
            let base = 1 + 3 * (r as usize - 1);
            match kind {
                SubbandKind::HL => base,
                SubbandKind::LH => base + 1,
                _ => base + 2,
            }
        }
    }
}

/// Step size, bit-plane budget and distortion weight for one subband.
fn resolve_band(
    cc: &CompCoding,
    info: &ComponentInfo,
    kind: SubbandKind,
    lev: u8,
) -> (StepSize, f64, u8, f64) {
    let rb = info.bit_depth + kind.gain();
    let idx = band_index(cc.levels, lev, kind);
    let step = match cc.quant_style {
        QuantizationStyle::None => cc.step_sizes.get(idx).copied().unwrap_or(StepSize {
            exponent: rb,
            mantissa: 0,
        }),
        QuantizationStyle::ScalarExpounded => {
            cc.step_sizes.get(idx).copied().unwrap_or_default()
        }
        QuantizationStyle::ScalarDerived => {
            let base = cc.step_sizes.first().copied().unwrap_or_default();
            derived_step(base, cc.levels, lev)
        }
    };
    let delta = if cc.reversible { 1.0 } else { step.value(rb) };
    let mb = max_bitplanes(step.exponent, cc.guard_bits) + cc.roi_shift;
    let norm = band_norm(cc.reversible, kind, lev);
    let weight = (delta * norm) * (delta * norm);
    (step, delta, mb, weight)
}

/// Mallat-buffer offset of a band within its tile-component buffer: the
/// low-pass counts of the parent level decide where the quadrant starts.
pub(crate) fn band_offsets(tc_rect: &Rect, band: &Band) -> (usize, usize) {
    if band.lev == 0 {
        return (0, 0);
    }
    let xs = crate::dwt::level_intervals(tc_rect.x0, tc_rect.width(), band.lev);
    let ys = crate::dwt::level_intervals(tc_rect.y0, tc_rect.height(), band.lev);
    let (px0, pw) = xs[band.lev as usize - 1];
    let (py0, ph) = ys[band.lev as usize - 1];
    let lw = crate::geometry::low_count(px0, px0 + pw) as usize;
    let lh = crate::geometry::low_count(py0, py0 + ph) as usize;
    match band.kind {
        SubbandKind::LL => (0, 0),
        SubbandKind::HL => (lw, 0),
        SubbandKind::LH => (0, lh),
        SubbandKind::HH => (lw, lh),
    }
}

/// Construct the full partition skeleton of one tile.
pub fn build_tile(params: &CodingParams, tile_index: u32) -> TileModel {
    let rect = params.grid.tile_rect(tile_index);
    let mut components = Vec::with_capacity(params.components.len());
    for (ci, info) in params.components.iter().enumerate() {
        let cc = &params.comp[ci];
        let tc_rect =
            params
                .grid
                .tile_component_rect(tile_index, info.dx as u32, info.dy as u32);
        let n = cc.levels;
        let mut resolutions = Vec::with_capacity(n as usize + 1);
        for r in 0..=n {
            let res_rect = resolution_rect(&tc_rect, n, r);
            let (ppx, ppy) = cc.precinct_exps(r);
            let (num_px, num_py) = precinct_grid(&res_rect, ppx, ppy);
            let kinds: &[SubbandKind] = if r == 0 {
                &[SubbandKind::LL]
            } else {
                &[SubbandKind::HL, SubbandKind::LH, SubbandKind::HH]
            };
            let lev = if r == 0 { n } else { n - r + 1 };
            let mut bands = Vec::with_capacity(kinds.len());
            for &kind in kinds {
                let band_rect = if r == 0 && n == 0 {
                    tc_rect
                } else {
                    subband_rect(&tc_rect, lev.max(1), kind)
                };
                let (step, delta, mb, weight) = resolve_band(cc, info, kind, lev);
                // Code-block size, clamped to the precinct partition.
                let (pbx, pby) = if r == 0 { (ppx, ppy) } else { (ppx - 1, ppy - 1) };
                let cbw = cc.cblk_w_exp.min(pbx);
                let cbh = cc.cblk_h_exp.min(pby);
                let mut precincts = Vec::with_capacity((num_px * num_py) as usize);
                for py in 0..num_py {
                    for px in 0..num_px {
                        let p_res = precinct_rect(&res_rect, ppx, ppy, px, py);
                        let p_band = precinct_band_rect(&p_res, &band_rect, r);
                        let (gx0, gx1, gy0, gy1) = codeblock_grid(&p_band, cbw, cbh);
                        let mut blocks =
                            Vec::with_capacity(((gx1 - gx0) * (gy1 - gy0)) as usize);
                        for gy in gy0..gy1 {
                            for gx in gx0..gx1 {
                                blocks.push(CodeBlock {
                                    rect: codeblock_rect(&p_band, cbw, cbh, gx, gy),
                                    ..CodeBlock::default()
                                });
                            }
                        }
                        precincts.push(Precinct {
                            rect: p_band,
                            cb_gx0: gx0,
                            cb_gx1: gx1,
                            cb_gy0: gy0,
                            cb_gy1: gy1,
                            blocks,
                        });
                    }
                }
                bands.push(Band {
                    kind,
                    lev,
                    rect: band_rect,
                    step,
                    delta,
                    mb,
                    weight,
                    precincts,
                });
            }
            resolutions.push(Resolution {
                level: r,
                rect: res_rect,
                ppx,
                ppy,
                num_px,
                num_py,
                bands,
            });
        }
        components.push(TileComp {
            comp: ci,
            rect: tc_rect,
            levels: n,
            resolutions,
        });
    }
    TileModel {
        index: tile_index,
        rect,
        components,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;

    fn simple_params(w: u32, h: u32, levels: u8) -> CodingParams {
        let p = EncodeParams {
            decomposition_levels: levels,
            ..EncodeParams::default()
        };
        crate::encoder::coding_params(
            &crate::image::ImageBuffer::new_gray(w, h, 8),
            &p,
        )
        .unwrap()
    }

    #[test]
    fn test_band_index_order() {
        assert_eq!(band_index(3, 3, SubbandKind::LL), 0);
        assert_eq!(band_index(3, 3, SubbandKind::HL), 1);
        assert_eq!(band_index(3, 3, SubbandKind::HH), 3);
        assert_eq!(band_index(3, 2, SubbandKind::HL), 4);
        assert_eq!(band_index(3, 1, SubbandKind::HH), 9);
    }

    #[test]
    fn test_build_tile_structure() {
        let params = simple_params(64, 48, 3);
        let tile = build_tile(&params, 0);
        assert_eq!(tile.components.len(), 1);
        let tc = &tile.components[0];
        assert_eq!(tc.resolutions.len(), 4);
        assert_eq!(tc.resolutions[0].bands.len(), 1);
        assert_eq!(tc.resolutions[3].bands.len(), 3);
        // Subband areas together cover the tile-component.
        let total: usize = tc
            .resolutions
            .iter()
            .flat_map(|r| r.bands.iter())
            .map(|b| b.rect.area())
            .sum();
        assert_eq!(total, tc.rect.area());
        // Every code-block sits inside its band.
        for res in &tc.resolutions {
            assert_eq!(res.num_precincts(), 1);
            for band in &res.bands {
                for p in &band.precincts {
                    for blk in &p.blocks {
                        assert!(!blk.rect.is_empty());
                        assert_eq!(blk.rect.intersect(&band.rect), blk.rect);
                    }
                }
            }
        }
    }

    #[test]
    fn test_block_count_respects_cblk_size() {
        let mut params = simple_params(256, 256, 0);
        params.comp[0].cblk_w_exp = 6;
        params.comp[0].cblk_h_exp = 6;
        let tile = build_tile(&params, 0);
        let band = &tile.components[0].resolutions[0].bands[0];
        assert_eq!(band.precincts[0].blocks.len(), 16);
        assert_eq!(band.precincts[0].grid_w(), 4);
    }
}
