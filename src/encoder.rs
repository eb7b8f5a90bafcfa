//! Encode pipeline orchestration.
//!
//! image -> tile split -> DC shift -> color transform -> DWT -> quantize
//! -> Tier-1 -> PCRD-opt -> Tier-2 packets -> marker emission. Tiles run
//! end-to-end in parallel; code-blocks within a tile are a second
//! parallelism grain. Rate control runs once over all tiles' pass lists
//! and the final byte assembly is serial.

use rayon::prelude::*;

use crate::bit_plane_coder::BlockEncoder;
use crate::config::{
    CancelToken, ColorTransform, EncodeParams, HtMode, LayerTarget, QuantizationStyle,
    WaveletFilter,
};
use crate::dwt::{forward_2d_53, forward_2d_97};
use crate::error::J2kError;
use crate::geometry::{GridGeometry, SubbandKind};
use crate::image::ImageBuffer;
use crate::mct::{dc_shift, forward_ict, forward_rct};
use crate::packet::{emit_packet, PacketCtx, PrecinctEncState};
use crate::progression::packet_sequence;
use crate::quantization::{band_norm, quantize, StepSize};
use crate::rate_control::{allocate_layers, BlockHull};
use crate::stream_writer::StreamWriter;
use crate::tile::{band_offsets, build_tile, CodingParams, CompCoding, TileComp, TileModel};
use crate::writer::{write_eoc, write_main_header, write_tile_part, PCAP_HT};

/// Estimated per-included-block header overhead used by rate control.
const BLOCK_HEADER_OVERHEAD: usize = 4;

/// Distill user-facing `EncodeParams` into the signalled coding
/// parameters. Shared with the marker writer and the tile builder.
pub fn coding_params(
    image: &ImageBuffer,
    params: &EncodeParams,
) -> Result<CodingParams, J2kError> {
    image.validate()?;
    params.validate(image.components.len())?;

    let grid = GridGeometry {
        xsiz: image.width,
        ysiz: image.height,
        xosiz: 0,
        yosiz: 0,
        xtsiz: if params.tile_width == 0 {
            image.width
        } else {
            params.tile_width
        },
        ytsiz: if params.tile_height == 0 {
            image.height
        } else {
            params.tile_height
        },
        xtosiz: 0,
        ytosiz: 0,
    };

    let n = params.decomposition_levels;
    let reversible = params.is_reversible();
    let cblk_style = params.wire_cblk_style();
    let mut comp = Vec::with_capacity(image.components.len());
    for info in &image.components {
        let mut step_sizes = Vec::with_capacity(3 * n as usize + 1);
        let mut push_step = |kind: SubbandKind, lev: u8| {
            let rb = info.bit_depth + kind.gain();
            let step = if reversible {
                StepSize {
                    exponent: rb,
                    mantissa: 0,
                }
            } else {
                let nominal = params.base_step * (1u64 << info.bit_depth) as f64;
                let delta = nominal / band_norm(false, kind, lev);
                StepSize::for_delta(delta, rb)
            };
            step_sizes.push(step);
        };
        push_step(SubbandKind::LL, n);
        for r in 1..=n {
            let lev = n - r + 1;
            push_step(SubbandKind::HL, lev);
            push_step(SubbandKind::LH, lev);
            push_step(SubbandKind::HH, lev);
        }
        if params.quant_style == QuantizationStyle::ScalarDerived {
            step_sizes.truncate(1);
        }
        comp.push(CompCoding {
            levels: n,
            cblk_w_exp: params.cblk_width_exp,
            cblk_h_exp: params.cblk_height_exp,
            cblk_style,
            reversible,
            precincts: params.precinct_exps.clone().unwrap_or_default(),
            quant_style: params.quant_style,
            guard_bits: params.guard_bits,
            step_sizes,
            roi_shift: 0,
        });
    }
    if let Some(roi) = &params.roi {
        let ci = roi.component as usize;
        if ci >= comp.len() {
            return Err(J2kError::InvalidConfiguration(format!(
                "ROI component {ci} out of range"
            )));
        }
        comp[ci].roi_shift = roi.shift;
    }

    let uses_ht = matches!(params.ht, HtMode::Ht | HtMode::HtOnly);
    Ok(CodingParams {
        grid,
        components: image.components.clone(),
        progression: params.progression,
        num_layers: params.num_layers(),
        mct: params.color_transform,
        comp,
        use_sop: params.use_sop,
        use_eph: params.use_eph,
        cap: uses_ht.then_some(PCAP_HT),
        cpf: uses_ht.then_some(params.cpf_profile as u16),
        comment: params.comment.clone(),
    })
}

/// Encode a planar image into a complete SOC..EOC codestream.
pub fn encode(image: &ImageBuffer, params: &EncodeParams) -> Result<Vec<u8>, J2kError> {
    if let WaveletFilter::Arbitrary(_) = params.filter {
        return Err(J2kError::UnsupportedFeature(
            "arbitrary wavelet kernels cannot be signalled in a Part 1 codestream".into(),
        ));
    }
    let cp = coding_params(image, params)?;
    let cancel = &params.cancel;
    let num_tiles = cp.grid.num_tiles();
    log::debug!(
        "encode: {}x{}, {} components, {} tiles, {} layers",
        image.width,
        image.height,
        image.components.len(),
        num_tiles,
        cp.num_layers
    );

    let mut tiles: Vec<TileModel> = (0..num_tiles).map(|t| build_tile(&cp, t)).collect();

    // DWT + quantization + Tier-1, tiles in parallel.
    tiles
        .par_iter_mut()
        .map(|tile| tier1_tile(tile, image, &cp, cancel))
        .collect::<Result<Vec<_>, J2kError>>()?;
    cancel.check()?;

    assign_layers(&mut tiles, &cp, params)?;
    cancel.check()?;

    // Tier-2 packet assembly, tiles in parallel; emission order within a
    // tile follows the progression exactly.
    let bodies: Vec<Vec<u8>> = tiles
        .par_iter_mut()
        .map(|tile| assemble_tile_body(tile, &cp))
        .collect();
    cancel.check()?;

    let mut sw = StreamWriter::new();
    write_main_header(&mut sw, &cp);
    for (t, body) in bodies.iter().enumerate() {
        write_tile_part(&mut sw, t as u16, 0, 1, body);
    }
    write_eoc(&mut sw);
    log::debug!("encode: {} bytes", sw.len());
    Ok(sw.into_bytes())
}

/// Extract tile-component samples, apply DC shift + color transform +
/// DWT + quantization, then encode every code-block.
fn tier1_tile(
    tile: &mut TileModel,
    image: &ImageBuffer,
    cp: &CodingParams,
    cancel: &CancelToken,
) -> Result<(), J2kError> {
    cancel.check()?;
    let mut ibufs: Vec<Vec<i32>> = Vec::with_capacity(tile.components.len());
    for (ci, tc) in tile.components.iter().enumerate() {
        let info = &cp.components[ci];
        let plane = &image.planes[ci];
        let pw = image.comp_width(ci) as usize;
        let rect = tc.rect;
        let mut buf = Vec::with_capacity(rect.area());
        for y in rect.y0..rect.y1 {
            let row = y as usize * pw;
            for x in rect.x0..rect.x1 {
                buf.push(plane[row + x as usize]);
            }
        }
        dc_shift(&mut buf, info.bit_depth, info.signed);
        ibufs.push(buf);
    }

    let same_dims = tile.components.len() >= 3
        && tile.components[1].rect == tile.components[0].rect
        && tile.components[2].rect == tile.components[0].rect;
    match cp.mct {
        ColorTransform::ReversibleRct if same_dims => {
            let (a, rest) = ibufs.split_at_mut(1);
            let (b, c) = rest.split_at_mut(1);
            forward_rct(&mut a[0], &mut b[0], &mut c[0]);
        }
        ColorTransform::ReversibleRct => {
            log::warn!("RCT skipped: first three components differ in sampling");
        }
        _ => {}
    }

    let reversible = cp.comp.iter().all(|c| c.reversible);
    if reversible {
        for (ci, tc) in tile.components.iter_mut().enumerate() {
            cancel.check()?;
            let cc = &cp.comp[ci];
            let rect = tc.rect;
            let (w, h) = (rect.width() as usize, rect.height() as usize);
            if w == 0 || h == 0 {
                continue;
            }
            let mut buf = std::mem::take(&mut ibufs[ci]);
            forward_2d_53(&mut buf, w, h, rect.x0, rect.y0, cc.levels);
            encode_component_blocks(tc, cc, &buf, None, tile.index as usize, ci)?;
        }
    } else {
        let mut fbufs: Vec<Vec<f32>> = ibufs
            .iter()
            .map(|b| b.iter().map(|&v| v as f32).collect())
            .collect();
        if cp.mct == ColorTransform::IrreversibleIct {
            if same_dims {
                let (a, rest) = fbufs.split_at_mut(1);
                let (b, c) = rest.split_at_mut(1);
                forward_ict(&mut a[0], &mut b[0], &mut c[0]);
            } else {
                log::warn!("ICT skipped: first three components differ in sampling");
            }
        }
        for (ci, tc) in tile.components.iter_mut().enumerate() {
            cancel.check()?;
            let cc = &cp.comp[ci];
            let rect = tc.rect;
            let (w, h) = (rect.width() as usize, rect.height() as usize);
            if w == 0 || h == 0 {
                continue;
            }
            forward_2d_97(&mut fbufs[ci], w, h, rect.x0, rect.y0, cc.levels);
            encode_component_blocks(tc, cc, &[], Some(&fbufs[ci]), tile.index as usize, ci)?;
        }
    }
    Ok(())
}

fn encode_component_blocks(
    tc: &mut TileComp,
    cc: &CompCoding,
    ibuf: &[i32],
    fbuf: Option<&[f32]>,
    tile_idx: usize,
    comp_idx: usize,
) -> Result<(), J2kError> {
    let tc_rect = tc.rect;
    let stride = tc_rect.width() as usize;
    let ht = cc.uses_ht();
    let style = cc.cblk_style;
    let roi = cc.roi_shift;

    for res in tc.resolutions.iter_mut() {
        let res_level = res.level as usize;
        for band in res.bands.iter_mut() {
            let (ox, oy) = band_offsets(&tc_rect, band);
            let brect = band.rect;
            let delta = band.delta as f32;
            let fetch = |x: u32, y: u32| -> i32 {
                let bx = ox + (x - brect.x0) as usize;
                let by = oy + (y - brect.y0) as usize;
                let q = match fbuf {
                    Some(f) => quantize(f[by * stride + bx], delta),
                    None => ibuf[by * stride + bx],
                };
                q << roi
            };

            let mb = band.mb;
            let weight = band.weight;
            let kind = band.kind;
            // Gather per-block coefficient copies, then run Tier-1 over
            // the blocks of the whole band in parallel.
            let mut jobs = Vec::new();
            for (pi, p) in band.precincts.iter().enumerate() {
                for (bi, blk) in p.blocks.iter().enumerate() {
                    let (bw, bh) = (blk.rect.width() as usize, blk.rect.height() as usize);
                    let mut coeffs = Vec::with_capacity(bw * bh);
                    for y in blk.rect.y0..blk.rect.y1 {
                        for x in blk.rect.x0..blk.rect.x1 {
                            coeffs.push(fetch(x, y));
                        }
                    }
                    jobs.push((pi, bi, coeffs, bw, bh));
                }
            }
            let encoded: Vec<_> = jobs
                .into_par_iter()
                .map(|(pi, bi, coeffs, bw, bh)| {
                    let r = if ht {
                        crate::ht_block_coder::encode_block(&coeffs, bw, bh, mb, weight)
                    } else {
                        BlockEncoder::encode(&coeffs, bw, bh, kind, style, mb, weight)
                    };
                    (pi, bi, r)
                })
                .collect();
            for (pi, bi, r) in encoded {
                let enc = r.map_err(|e| match e {
                    J2kError::CoefficientOverflow { .. } => J2kError::CoefficientOverflow {
                        tile: tile_idx,
                        component: comp_idx,
                        resolution: res_level,
                    },
                    other => other,
                })?;
                band.precincts[pi].blocks[bi].enc = Some(enc);
            }
        }
    }
    Ok(())
}

/// PCRD-opt across all tiles: translate layer targets to block-byte
/// budgets, pick truncation points, and write them back as per-layer
/// cumulative pass counts.
fn assign_layers(
    tiles: &mut [TileModel],
    cp: &CodingParams,
    params: &EncodeParams,
) -> Result<(), J2kError> {
    let header_len = {
        let mut sw = StreamWriter::new();
        write_main_header(&mut sw, cp);
        sw.len()
    };
    let packets_per_layer: usize = tiles
        .iter()
        .map(|t| {
            t.components
                .iter()
                .flat_map(|c| c.resolutions.iter())
                .map(|r| r.num_precincts() as usize)
                .sum::<usize>()
        })
        .sum();
    let per_packet = 1 + if cp.use_sop { 6 } else { 0 } + if cp.use_eph { 2 } else { 0 };
    let fixed = header_len + tiles.len() * 16 + 2;
    let min_total = fixed + packets_per_layer * cp.num_layers as usize * per_packet;

    let grid_pixels =
        (cp.grid.xsiz - cp.grid.xosiz) as f64 * (cp.grid.ysiz - cp.grid.yosiz) as f64;
    let mut budgets: Vec<Option<usize>> = Vec::with_capacity(params.layer_targets.len());
    for (l, t) in params.layer_targets.iter().enumerate() {
        let bytes = match t {
            LayerTarget::Any => None,
            LayerTarget::Bytes(b) => Some(*b),
            LayerTarget::BitsPerPixel(bpp) => Some((bpp * grid_pixels / 8.0) as usize),
        };
        match bytes {
            None => budgets.push(None),
            Some(b) => {
                let packet_overhead = packets_per_layer * (l + 1) * per_packet;
                let reserved = fixed + packet_overhead;
                if b < reserved {
                    if l + 1 == params.layer_targets.len() {
                        return Err(J2kError::RateControlInfeasible {
                            requested: b,
                            minimum: min_total,
                        });
                    }
                    log::warn!(
                        "layer {l}: target {b} below overhead {reserved}; layer left empty"
                    );
                    budgets.push(Some(0));
                } else {
                    budgets.push(Some(b - reserved));
                }
            }
        }
    }

    let mut hulls = Vec::new();
    for_each_block(tiles, |blk| {
        let hull = blk
            .enc
            .as_ref()
            .map(|e| BlockHull::from_passes(&e.passes))
            .unwrap_or_default();
        hulls.push(hull);
    });
    let cuts = allocate_layers(&hulls, &budgets, BLOCK_HEADER_OVERHEAD);
    let mut idx = 0;
    for_each_block_mut(tiles, |blk| {
        blk.layer_passes = cuts[idx].clone();
        idx += 1;
    });
    Ok(())
}

fn for_each_block(tiles: &[TileModel], mut f: impl FnMut(&crate::tile::CodeBlock)) {
    for tile in tiles {
        for tc in &tile.components {
            for res in &tc.resolutions {
                for band in &res.bands {
                    for p in &band.precincts {
                        for blk in &p.blocks {
                            f(blk);
                        }
                    }
                }
            }
        }
    }
}

fn for_each_block_mut(tiles: &mut [TileModel], mut f: impl FnMut(&mut crate::tile::CodeBlock)) {
    for tile in tiles {
        for tc in &mut tile.components {
            for res in &mut tc.resolutions {
                for band in &mut res.bands {
                    for p in &mut band.precincts {
                        for blk in &mut p.blocks {
                            f(blk);
                        }
                    }
                }
            }
        }
    }
}

/// Tier-2: emit every packet of the tile in progression order.
pub(crate) fn assemble_tile_body(tile: &mut TileModel, cp: &CodingParams) -> Vec<u8> {
    let mut states: Vec<Vec<Vec<Vec<PrecinctEncState>>>> = tile
        .components
        .iter()
        .map(|tc| {
            tc.resolutions
                .iter()
                .map(|res| {
                    res.bands
                        .iter()
                        .map(|band| {
                            band.precincts
                                .iter()
                                .map(|p| PrecinctEncState::new(p, cp.num_layers))
                                .collect()
                        })
                        .collect()
                })
                .collect()
        })
        .collect();

    let sequence = packet_sequence(tile, cp.progression, cp.num_layers);
    let mut body = Vec::new();
    let mut seq = 0u16;
    for pid in sequence {
        let ci = pid.comp as usize;
        let cc = &cp.comp[ci];
        let ctx = PacketCtx {
            style: cc.cblk_style,
            ht: cc.uses_ht(),
            use_sop: cp.use_sop,
            use_eph: cp.use_eph,
        };
        let res = &mut tile.components[ci].resolutions[pid.res as usize];
        let pkt = emit_packet(
            &mut res.bands,
            &mut states[ci][pid.res as usize],
            pid.precinct as usize,
            pid.layer as usize,
            seq,
            &ctx,
        );
        body.extend_from_slice(&pkt);
        seq = seq.wrapping_add(1);
    }
    body
}
