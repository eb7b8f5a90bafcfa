//! Decode pipeline orchestration.
//!
//! bytes -> marker parse -> Tier-2 packet parse -> Tier-1 -> dequantize
//! -> inverse DWT -> inverse color transform -> DC unshift -> image.
//!
//! Everything parsed after the main header is salvage territory: a
//! truncated or damaged tail keeps the packets that survived, and the
//! reconstruction delivers the best image those packets describe.

use rayon::prelude::*;

use crate::bit_plane_coder::BlockDecoder;
use crate::config::{ColorTransform, DecodeParams};
use crate::dwt::{inverse_2d_53, inverse_2d_97};
use crate::error::J2kError;
use crate::geometry::{ceil_div, resolution_rect, Rect};
use crate::image::{ComponentInfo, DecodeMeta, DecodedImage, ImageBuffer};
use crate::marker_code::MarkerCode;
use crate::mct::{dc_unshift, inverse_ict, inverse_rct};
use crate::packet::{parse_packet, PacketCtx, PrecinctDecState};
use crate::parser::Parser;
use crate::progression::{packet_sequence, PacketId};
use crate::quantization::dequantize;
use crate::stream_reader::StreamReader;
use crate::tile::{band_offsets, build_tile, CodingParams, TileModel};

struct TileState {
    model: TileModel,
    states: Vec<Vec<Vec<Vec<PrecinctDecState>>>>,
    sequence: Vec<PacketId>,
    cursor: usize,
}

impl TileState {
    fn new(cp: &CodingParams, index: u32) -> Self {
        let model = build_tile(cp, index);
        let states = model
            .components
            .iter()
            .map(|tc| {
                tc.resolutions
                    .iter()
                    .map(|res| {
                        res.bands
                            .iter()
                            .map(|band| {
                                band.precincts.iter().map(PrecinctDecState::new).collect()
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        let sequence = packet_sequence(&model, cp.progression, cp.num_layers);
        Self {
            model,
            states,
            sequence,
            cursor: 0,
        }
    }
}

/// Decode a codestream, honoring the decode constraints. Input truncated
/// after the main header still yields the image carried by the prefix.
pub fn decode(data: &[u8], dp: &DecodeParams) -> Result<DecodedImage, J2kError> {
    let cancel = &dp.cancel;
    let mut r = StreamReader::new(data);
    let main = Parser::parse_main_header(&mut r)?;
    let cp = main.params;
    let num_tiles = cp.grid.num_tiles() as usize;
    if num_tiles > u16::MAX as usize {
        return Err(J2kError::malformed(0, "tile count exceeds 65535"));
    }
    let max_layers = dp
        .max_layers
        .unwrap_or(cp.num_layers)
        .clamp(1, cp.num_layers);
    log::debug!(
        "decode: {}x{}, {} components, {} tiles, {} of {} layers",
        cp.grid.xsiz,
        cp.grid.ysiz,
        cp.components.len(),
        num_tiles,
        max_layers,
        cp.num_layers
    );

    let mut tiles: Vec<Option<TileState>> = (0..num_tiles).map(|_| None).collect();
    let mut truncated = false;

    'stream: loop {
        cancel.check()?;
        let marker = match r.peek_marker() {
            Ok(m) => m,
            Err(_) => {
                truncated = true;
                break;
            }
        };
        match marker {
            Some(MarkerCode::EndOfCodestream) => break,
            Some(MarkerCode::StartOfTile) => {}
            other => {
                log::warn!("unexpected marker {other:?} between tile-parts");
                truncated = true;
                break;
            }
        }
        let sot_at = r.offset();
        let sot = match Parser::parse_sot(&mut r) {
            Ok(s) => s,
            Err(_) => {
                truncated = true;
                break;
            }
        };
        // Skip optional tile-part header segments down to SOD.
        loop {
            match r.read_marker() {
                Ok(MarkerCode::StartOfData) => break,
                Ok(m) if !m.is_delimiter() => {
                    let ok = r
                        .read_segment_len()
                        .and_then(|len| r.advance(len))
                        .is_ok();
                    if !ok {
                        truncated = true;
                        break 'stream;
                    }
                }
                _ => {
                    truncated = true;
                    break 'stream;
                }
            }
        }

        let body_start = r.offset();
        let body_end = if sot.psot == 0 {
            if data.len() >= 2 && data[data.len() - 2..] == [0xFF, 0xD9] {
                data.len() - 2
            } else {
                data.len()
            }
        } else {
            sot_at + sot.psot as usize
        };
        if body_end > data.len() {
            truncated = true;
        }
        let clipped_end = body_end.min(data.len()).max(body_start);
        let body = &data[body_start..clipped_end];

        let ti = sot.tile_index as usize;
        if ti >= num_tiles {
            log::warn!("tile index {ti} out of range");
            truncated = true;
            break;
        }
        let ts = tiles[ti].get_or_insert_with(|| TileState::new(&cp, ti as u32));

        let mut pos = 0usize;
        while ts.cursor < ts.sequence.len() && pos < body.len() {
            let pid = ts.sequence[ts.cursor];
            let ci = pid.comp as usize;
            let cc = &cp.comp[ci];
            let ctx = PacketCtx {
                style: cc.cblk_style,
                ht: cc.uses_ht(),
                use_sop: cp.use_sop,
                use_eph: cp.use_eph,
            };
            let apply = pid.layer < max_layers;
            let res = &mut ts.model.components[ci].resolutions[pid.res as usize];
            match parse_packet(
                &body[pos..],
                body_start + pos,
                &mut res.bands,
                &mut ts.states[ci][pid.res as usize],
                pid.precinct as usize,
                pid.layer as usize,
                &ctx,
                apply,
            ) {
                Ok(used) => {
                    pos += used;
                    ts.cursor += 1;
                }
                Err(J2kError::TruncatedInput { .. }) => {
                    truncated = true;
                    break 'stream;
                }
                Err(e) => {
                    log::warn!("packet parse failed in tile {ti}: {e}");
                    truncated = true;
                    break 'stream;
                }
            }
        }

        if body_end > data.len() || r.seek(clipped_end).is_err() {
            truncated = true;
            break;
        }
    }

    // Global reduction factor from the resolution constraint.
    let n0 = cp.comp.first().map(|c| c.levels).unwrap_or(0);
    let rmax = dp.max_resolution.unwrap_or(n0).min(n0);
    let d = n0 - rmax;

    // Reconstruct tiles in parallel, then blit serially.
    let results: Vec<Vec<(usize, Rect, Vec<i32>)>> = tiles
        .par_iter()
        .filter_map(|ts| ts.as_ref())
        .map(|ts| reconstruct_tile(&ts.model, &cp, d))
        .collect();
    cancel.check()?;

    let mut out = output_image(&cp, d);
    for tile_samples in results {
        for (ci, rect, samples) in tile_samples {
            let prect = plane_rect(&cp, ci, d);
            let pw = prect.width() as usize;
            for (row, y) in (rect.y0..rect.y1).enumerate() {
                let src = &samples[row * rect.width() as usize..][..rect.width() as usize];
                let dst_off =
                    (y - prect.y0) as usize * pw + (rect.x0 - prect.x0) as usize;
                out.planes[ci][dst_off..dst_off + src.len()].copy_from_slice(src);
            }
        }
    }

    apply_view_constraints(&mut out, &cp, dp, d);

    Ok(DecodedImage {
        image: out,
        meta: DecodeMeta {
            layers: max_layers,
            resolution: rmax,
            truncated,
        },
    })
}

/// Full sampled-grid rectangle of a component, reduced by `d` levels.
fn plane_rect(cp: &CodingParams, ci: usize, d: u8) -> Rect {
    let info = &cp.components[ci];
    let full = Rect {
        x0: ceil_div(cp.grid.xosiz, info.dx as u32),
        y0: ceil_div(cp.grid.yosiz, info.dy as u32),
        x1: ceil_div(cp.grid.xsiz, info.dx as u32),
        y1: ceil_div(cp.grid.ysiz, info.dy as u32),
    };
    let n = cp.comp[ci].levels;
    let dc = d.min(n);
    resolution_rect(&full, n, n - dc)
}

fn output_image(cp: &CodingParams, d: u8) -> ImageBuffer {
    let width = ceil_div(cp.grid.xsiz, 1 << d) - ceil_div(cp.grid.xosiz, 1 << d);
    let height = ceil_div(cp.grid.ysiz, 1 << d) - ceil_div(cp.grid.yosiz, 1 << d);
    let components: Vec<ComponentInfo> = cp.components.clone();
    let planes = (0..components.len())
        .map(|ci| {
            let r = plane_rect(cp, ci, d);
            vec![0i32; r.area()]
        })
        .collect();
    ImageBuffer {
        width,
        height,
        components,
        planes,
    }
}

/// Tier-1 decode + dequantize + inverse DWT + inverse MCT + DC unshift
/// for one tile; returns (component, reduced rect, samples).
fn reconstruct_tile(
    tile: &TileModel,
    cp: &CodingParams,
    d: u8,
) -> Vec<(usize, Rect, Vec<i32>)> {
    let mut int_bufs: Vec<Option<Vec<i32>>> = vec![None; tile.components.len()];
    let mut float_bufs: Vec<Option<Vec<f32>>> = vec![None; tile.components.len()];
    let mut rects: Vec<Rect> = Vec::with_capacity(tile.components.len());

    for (ci, tc) in tile.components.iter().enumerate() {
        let cc = &cp.comp[ci];
        let n = tc.levels;
        let dc = d.min(n);
        let keep = n - dc;
        let out_rect = resolution_rect(&tc.rect, n, keep);
        rects.push(out_rect);
        let (w, h) = (out_rect.width() as usize, out_rect.height() as usize);
        if w == 0 || h == 0 {
            if cc.reversible {
                int_bufs[ci] = Some(Vec::new());
            } else {
                float_bufs[ci] = Some(Vec::new());
            }
            continue;
        }

        let mut ibuf = vec![0i32; w * h];
        let mut fbuf = vec![0f32; w * h];
        let ht = cc.uses_ht();
        let style = cc.cblk_style;
        let roi = cc.roi_shift;
        let tc_rect = tc.rect;

        for res in tc.resolutions.iter().take(keep as usize + 1) {
            for band in res.bands.iter() {
                let (ox, oy) = band_offsets(&tc_rect, band);
                let delta = band.delta as f32;
                let mb = band.mb;
                let kind = band.kind;
                let brect = band.rect;

                // Code-blocks decode independently.
                let decoded: Vec<(Rect, Vec<i32>)> = band
                    .precincts
                    .par_iter()
                    .flat_map_iter(|p| p.blocks.iter())
                    .filter(|blk| blk.included && blk.passes_used > 0)
                    .map(|blk| {
                        let (bw, bh) =
                            (blk.rect.width() as usize, blk.rect.height() as usize);
                        let k =
                            (mb as u32).saturating_sub(blk.zero_planes).min(32) as u8;
                        let coeffs = if ht {
                            crate::ht_block_coder::decode_block(&blk.data, bw, bh, k)
                        } else {
                            BlockDecoder::decode(
                                block_segments(blk),
                                bw,
                                bh,
                                kind,
                                style,
                                k,
                                blk.passes_used,
                            )
                        };
                        (blk.rect, coeffs)
                    })
                    .collect();

                for (rect, coeffs) in decoded {
                    for (i, &q) in coeffs.iter().enumerate() {
                        let q = roi_unshift(q, roi);
                        let x = rect.x0 + (i as u32 % rect.width());
                        let y = rect.y0 + (i as u32 / rect.width());
                        let bx = ox + (x - brect.x0) as usize;
                        let by = oy + (y - brect.y0) as usize;
                        if cc.reversible {
                            ibuf[by * w + bx] = q;
                        } else {
                            fbuf[by * w + bx] = dequantize(q, delta, 0.5);
                        }
                    }
                }
            }
        }

        if cc.reversible {
            inverse_2d_53(&mut ibuf, w, h, out_rect.x0, out_rect.y0, keep);
            int_bufs[ci] = Some(ibuf);
        } else {
            inverse_2d_97(&mut fbuf, w, h, out_rect.x0, out_rect.y0, keep);
            float_bufs[ci] = Some(fbuf);
        }
    }

    let same_dims = rects.len() >= 3 && rects[1] == rects[0] && rects[2] == rects[0];
    match cp.mct {
        ColorTransform::ReversibleRct if same_dims => {
            if let [Some(a), Some(b), Some(c), ..] = &mut int_bufs[..] {
                inverse_rct(a, b, c);
            }
        }
        ColorTransform::IrreversibleIct if same_dims => {
            if let [Some(a), Some(b), Some(c), ..] = &mut float_bufs[..] {
                inverse_ict(a, b, c);
            }
        }
        _ => {}
    }

    let mut out = Vec::with_capacity(tile.components.len());
    for (ci, rect) in rects.into_iter().enumerate() {
        let info = &cp.components[ci];
        let mut samples = match (int_bufs[ci].take(), float_bufs[ci].take()) {
            (Some(i), _) => i,
            (_, Some(f)) => f.iter().map(|v| v.round() as i32).collect(),
            _ => Vec::new(),
        };
        dc_unshift(&mut samples, info.bit_depth, info.signed);
        out.push((ci, rect, samples));
    }
    out
}

/// Split a block's accumulated codeword bytes at the recorded segment
/// boundaries.
pub(crate) fn block_segments(blk: &crate::tile::CodeBlock) -> Vec<&[u8]> {
    if blk.seg_lens.is_empty() {
        return vec![&blk.data[..]];
    }
    let mut segs = Vec::with_capacity(blk.seg_lens.len());
    let mut at = 0usize;
    for &len in &blk.seg_lens {
        let end = (at + len).min(blk.data.len());
        segs.push(&blk.data[at..end]);
        at = end;
    }
    segs
}

/// ROI max-shift reversal: magnitudes that clear the shift threshold are
/// foreground and scale back down; the rest stay as coded.
fn roi_unshift(q: i32, shift: u8) -> i32 {
    if shift == 0 {
        return q;
    }
    let mag = q.unsigned_abs();
    if mag >> shift != 0 {
        let m = (mag >> shift) as i32;
        if q < 0 {
            -m
        } else {
            m
        }
    } else {
        q
    }
}

/// Component-subset and spatial-region constraints on the final image.
fn apply_view_constraints(
    out: &mut ImageBuffer,
    cp: &CodingParams,
    dp: &DecodeParams,
    d: u8,
) {
    if let Some(list) = &dp.components {
        let mut comps = Vec::new();
        let mut planes = Vec::new();
        for &ci in list {
            let ci = ci as usize;
            if ci < out.components.len() {
                comps.push(out.components[ci]);
                planes.push(std::mem::take(&mut out.planes[ci]));
            }
        }
        out.components = comps;
        out.planes = planes;
    }

    if let Some((x0, y0, x1, y1)) = dp.region {
        let qx0 = x0 >> d;
        let qy0 = y0 >> d;
        let qx1 = ceil_div(x1, 1 << d).min(out.width + (cp.grid.xosiz >> d));
        let qy1 = ceil_div(y1, 1 << d).min(out.height + (cp.grid.yosiz >> d));
        if qx1 <= qx0 || qy1 <= qy0 {
            out.width = 0;
            out.height = 0;
            out.planes.iter_mut().for_each(Vec::clear);
            return;
        }
        let comps = out.components.clone();
        for (ci, info) in comps.iter().enumerate() {
            let (dx, dy) = (info.dx as u32, info.dy as u32);
            let pw = out.width.div_ceil(dx) as usize;
            let cx0 = ceil_div(qx0, dx);
            let cy0 = ceil_div(qy0, dy);
            let cx1 = ceil_div(qx1, dx);
            let cy1 = ceil_div(qy1, dy);
            let mut cropped =
                Vec::with_capacity(((cx1 - cx0) * (cy1 - cy0)) as usize);
            for y in cy0..cy1 {
                for x in cx0..cx1 {
                    let idx = y as usize * pw + x as usize;
                    cropped.push(out.planes[ci].get(idx).copied().unwrap_or(0));
                }
            }
            out.planes[ci] = cropped;
        }
        out.width = qx1 - qx0;
        out.height = qy1 - qy0;
    }
}
