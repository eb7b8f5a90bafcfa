//! Tier-2 packet header coding (ISO/IEC 15444-1 B.10).
//!
//! A packet carries, for one (layer, resolution, component, precinct),
//! the new coding passes of every code-block in the precinct. The header
//! codes inclusion through one tag tree per band/precinct, zero
//! bit-plane counts through a second, then pass counts, Lblock state and
//! codeword segment lengths. The body is the concatenation of the
//! included byte ranges in block scan order.
//!
//! The body reader keeps two indices: the scan over the whole code-block
//! grid decides inclusion; a second index over the included blocks only
//! assigns segment lengths and body bytes.

use crate::bit_io::{BitReader, BitWriter};
use crate::bit_plane_coder::pass_terminates;
use crate::config::CblkStyle;
use crate::error::J2kError;
use crate::tag_tree::{TagTreeDecoder, TagTreeEncoder};
use crate::tile::{Band, Precinct};

/// Per-packet coding environment of one component.
#[derive(Debug, Clone, Copy)]
pub struct PacketCtx {
    pub style: CblkStyle,
    pub ht: bool,
    pub use_sop: bool,
    pub use_eph: bool,
}

pub struct PrecinctEncState {
    incl: TagTreeEncoder,
    zbp: TagTreeEncoder,
}

impl PrecinctEncState {
    /// Build the tag trees from the finished Tier-1 + rate-control state:
    /// leaf values are the first inclusion layer and the zero bit-plane
    /// count.
    pub fn new(p: &Precinct, num_layers: u16) -> Self {
        let (w, h) = (p.grid_w().max(1), p.grid_h().max(1));
        let mut incl = TagTreeEncoder::new(w, h);
        let mut zbp = TagTreeEncoder::new(w, h);
        for (i, blk) in p.blocks.iter().enumerate() {
            let x = i as u32 % p.grid_w().max(1);
            let y = i as u32 / p.grid_w().max(1);
            let first = blk
                .layer_passes
                .iter()
                .position(|&c| c > 0)
                .map(|l| l as u32)
                .unwrap_or(num_layers as u32);
            incl.set_value(x, y, first);
            let zp = blk.enc.as_ref().map(|e| e.zero_planes as u32).unwrap_or(0);
            zbp.set_value(x, y, zp);
        }
        incl.reduce();
        zbp.reduce();
        Self { incl, zbp }
    }
}

pub struct PrecinctDecState {
    incl: TagTreeDecoder,
    zbp: TagTreeDecoder,
}

impl PrecinctDecState {
    pub fn new(p: &Precinct) -> Self {
        let (w, h) = (p.grid_w().max(1), p.grid_h().max(1));
        Self {
            incl: TagTreeDecoder::new(w, h),
            zbp: TagTreeDecoder::new(w, h),
        }
    }
}

/// Pass counts per codeword segment for one layer contribution.
fn layer_segment_passes(
    style: CblkStyle,
    ht: bool,
    k: u8,
    start: u32,
    new_passes: u32,
) -> Vec<u32> {
    if ht || new_passes == 0 || k == 0 {
        return vec![new_passes];
    }
    let total = 3 * k as u32 - 2;
    let mut segs = Vec::new();
    let mut count = 0u32;
    for i in start..start + new_passes {
        count += 1;
        if i + 1 < start + new_passes && pass_terminates(style, i, total, k) {
            segs.push(count);
            count = 0;
        }
    }
    segs.push(count);
    segs
}

/// Number-of-passes code (Table B.4).
fn encode_numpasses(out: &mut BitWriter, n: u32) {
    debug_assert!((1..=164).contains(&n));
    match n {
        1 => out.write_bits(0b0, 1),
        2 => out.write_bits(0b10, 2),
        3..=5 => {
            out.write_bits(0b11, 2);
            out.write_bits(n - 3, 2);
        }
        6..=36 => {
            out.write_bits(0b1111, 4);
            out.write_bits(n - 6, 5);
        }
        _ => {
            out.write_bits(0b1_1111_1111, 9);
            out.write_bits(n - 37, 7);
        }
    }
}

fn decode_numpasses(input: &mut BitReader) -> Result<u32, J2kError> {
    if input.read_bit()? == 0 {
        return Ok(1);
    }
    if input.read_bit()? == 0 {
        return Ok(2);
    }
    let v = input.read_bits(2)?;
    if v < 3 {
        return Ok(3 + v);
    }
    let v = input.read_bits(5)?;
    if v < 31 {
        return Ok(6 + v);
    }
    Ok(37 + input.read_bits(7)?)
}

fn floor_log2(n: u32) -> u8 {
    (31 - n.max(1).leading_zeros()) as u8
}

fn bitlen(n: usize) -> u8 {
    (usize::BITS - n.leading_zeros()) as u8
}

/// Emit one packet: optional SOP, header, optional EPH, body. Updates
/// per-block Lblock state.
pub fn emit_packet(
    bands: &mut [Band],
    states: &mut [Vec<PrecinctEncState>],
    precinct: usize,
    layer: usize,
    seq: u16,
    ctx: &PacketCtx,
) -> Vec<u8> {
    let mut out = Vec::new();
    if ctx.use_sop {
        out.extend_from_slice(&[0xFF, 0x91, 0x00, 0x04]);
        out.extend_from_slice(&seq.to_be_bytes());
    }

    let any = bands.iter().any(|b| {
        b.precincts[precinct].blocks.iter().any(|blk| {
            let cum = blk.layer_passes.get(layer).copied().unwrap_or(0);
            let prev = if layer > 0 { blk.layer_passes[layer - 1] } else { 0 };
            cum > prev
        })
    });

    let mut bio = BitWriter::new();
    // (band, block, byte range) of every inclusion, in scan order.
    let mut body: Vec<(usize, usize, usize, usize)> = Vec::new();

    if !any {
        bio.write_bit(0);
    } else {
        bio.write_bit(1);
        for (bi, band) in bands.iter_mut().enumerate() {
            let p = &mut band.precincts[precinct];
            let gw = p.grid_w().max(1);
            for (i, blk) in p.blocks.iter_mut().enumerate() {
                let (x, y) = (i as u32 % gw, i as u32 / gw);
                let cum = blk.layer_passes.get(layer).copied().unwrap_or(0);
                let prev = if layer > 0 { blk.layer_passes[layer - 1] } else { 0 };
                let new = cum - prev;
                if prev == 0 {
                    states[bi][precinct].incl.encode(&mut bio, x, y, layer as u32 + 1);
                    if new > 0 {
                        let zp = blk.enc.as_ref().map(|e| e.zero_planes as u32).unwrap_or(0);
                        states[bi][precinct].zbp.encode(&mut bio, x, y, zp + 1);
                        blk.lblock = 3;
                    }
                } else {
                    bio.write_bit((new > 0) as u8);
                }
                if new == 0 {
                    continue;
                }
                let enc = blk.enc.as_ref().expect("included block has Tier-1 output");
                encode_numpasses(&mut bio, new);

                let segs =
                    layer_segment_passes(ctx.style, ctx.ht, enc.num_planes, prev, new);
                let rate_at = |n: u32| -> usize {
                    if n == 0 {
                        0
                    } else {
                        enc.passes[n as usize - 1].rate
                    }
                };
                let mut seg_lens = Vec::with_capacity(segs.len());
                let mut at = prev;
                for &sp in &segs {
                    seg_lens.push(rate_at(at + sp) - rate_at(at));
                    at += sp;
                }

                let needed = segs
                    .iter()
                    .zip(&seg_lens)
                    .map(|(&sp, &len)| bitlen(len).saturating_sub(floor_log2(sp)))
                    .max()
                    .unwrap_or(0);
                let grow = needed.saturating_sub(blk.lblock);
                for _ in 0..grow {
                    bio.write_bit(1);
                }
                bio.write_bit(0);
                blk.lblock += grow;
                for (&sp, &len) in segs.iter().zip(&seg_lens) {
                    bio.write_bits(len as u32, blk.lblock + floor_log2(sp));
                }

                body.push((bi, i, rate_at(prev), rate_at(cum)));
            }
        }
    }
    out.extend_from_slice(&bio.finish_header());
    if ctx.use_eph {
        out.extend_from_slice(&[0xFF, 0x92]);
    }
    for (bi, i, from, to) in body {
        let enc = bands[bi].precincts[precinct].blocks[i].enc.as_ref().unwrap();
        out.extend_from_slice(&enc.data[from..to]);
    }
    out
}

/// Parse one packet from `data`, accumulating codeword bytes and pass
/// counts into the blocks. Returns the bytes consumed.
pub fn parse_packet(
    data: &[u8],
    base_offset: usize,
    bands: &mut [Band],
    states: &mut [Vec<PrecinctDecState>],
    precinct: usize,
    layer: usize,
    ctx: &PacketCtx,
    apply: bool,
) -> Result<usize, J2kError> {
    let mut pos = 0usize;
    if data.len() >= 2 && data[0] == 0xFF && data[1] == 0x91 {
        if data.len() < 6 {
            return Err(J2kError::TruncatedInput {
                offset: base_offset,
            });
        }
        pos += 6;
    }

    let mut bio = BitReader::new(&data[pos..]);
    // Included blocks in scan order: (band, block, new passes, chunk
    // lengths with their segment-closing flags).
    let mut included: Vec<(usize, usize, u32, Vec<(usize, bool)>)> = Vec::new();

    if bio.read_bit()? == 1 {
        for (bi, band) in bands.iter_mut().enumerate() {
            let mb = band.mb;
            let p = &mut band.precincts[precinct];
            let gw = p.grid_w().max(1);
            for (i, blk) in p.blocks.iter_mut().enumerate() {
                let (x, y) = (i as u32 % gw, i as u32 / gw);
                let now_included;
                if !blk.included {
                    let st = &mut states[bi][precinct];
                    now_included = st.incl.decode(&mut bio, x, y, layer as u32 + 1)?;
                    if now_included {
                        blk.zero_planes = st.zbp.decode_value(&mut bio, x, y)?;
                        blk.lblock = 3;
                        blk.included = true;
                        blk.first_layer = layer as u16;
                    }
                } else {
                    now_included = bio.read_bit()? == 1;
                }
                if !now_included {
                    continue;
                }
                let new = decode_numpasses(&mut bio)?;
                let k = (mb as u32).saturating_sub(blk.zero_planes) as u8;
                let segs = layer_segment_passes(ctx.style, ctx.ht, k, blk.passes_total, new);
                while bio.read_bit()? == 1 {
                    blk.lblock += 1;
                }
                let total = if k > 0 { 3 * k as u32 - 2 } else { 0 };
                let mut lens = Vec::with_capacity(segs.len());
                let mut pass_end = blk.passes_total;
                for &sp in &segs {
                    let width = blk.lblock as u32 + floor_log2(sp.max(1)) as u32;
                    if width > 32 {
                        return Err(J2kError::malformed(
                            base_offset,
                            "segment length field wider than 32 bits",
                        ));
                    }
                    pass_end += sp;
                    // Whether this chunk closes a real codeword segment or
                    // merely stops at the layer boundary mid-segment.
                    let closes = ctx.ht
                        || k == 0
                        || pass_end >= total
                        || pass_terminates(ctx.style, pass_end - 1, total, k);
                    lens.push((bio.read_bits(width as u8)? as usize, closes));
                }
                included.push((bi, i, new, lens));
            }
        }
    }
    bio.align_to_byte()?;
    pos += bio.byte_pos();

    if data.len() >= pos + 2 && data[pos] == 0xFF && data[pos + 1] == 0x92 {
        pos += 2;
    } else if ctx.use_eph && !included.is_empty() {
        log::debug!("expected EPH after packet header at {}", base_offset + pos);
    }

    // Second index: body bytes go to included blocks only. Chunks that
    // continue a segment opened in an earlier layer merge into it.
    for (bi, i, new, lens) in included {
        let blk = &mut bands[bi].precincts[precinct].blocks[i];
        for (len, closes) in lens {
            if pos + len > data.len() {
                return Err(J2kError::TruncatedInput {
                    offset: base_offset + data.len(),
                });
            }
            if apply {
                blk.data.extend_from_slice(&data[pos..pos + len]);
                if blk.seg_open {
                    if let Some(last) = blk.seg_lens.last_mut() {
                        *last += len;
                    }
                } else {
                    blk.seg_lens.push(len);
                }
                blk.seg_open = !closes;
            }
            pos += len;
        }
        blk.passes_total += new;
        if apply {
            blk.passes_used += new;
        }
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_plane_coder::BlockEncoder;
    use crate::config::EncodeParams;
    use crate::geometry::SubbandKind;
    use crate::image::ImageBuffer;
    use crate::tile::build_tile;

    #[test]
    fn test_numpasses_roundtrip() {
        let mut w = BitWriter::new();
        let values = [1u32, 2, 3, 5, 6, 20, 36, 37, 100, 164];
        for &n in &values {
            encode_numpasses(&mut w, n);
        }
        let bytes = w.finish_header();
        let mut r = BitReader::new(&bytes);
        for &n in &values {
            assert_eq!(decode_numpasses(&mut r).unwrap(), n);
        }
    }

    fn one_band_tile() -> crate::tile::TileModel {
        let p = EncodeParams {
            decomposition_levels: 0,
            cblk_width_exp: 4,
            cblk_height_exp: 4,
            ..EncodeParams::default()
        };
        let params =
            crate::encoder::coding_params(&ImageBuffer::new_gray(32, 32, 8), &p).unwrap();
        build_tile(&params, 0)
    }

    /// Encode blocks, emit a single-layer packet, parse it back, and
    /// compare the per-block codeword bytes (property: parse(emit(h)) == h).
    #[test]
    fn test_packet_roundtrip_single_layer() {
        let mut tile = one_band_tile();
        let mut dec_tile = tile.clone();
        let band_count = tile.components[0].resolutions[0].bands.len();
        assert_eq!(band_count, 1);

        let mut expected: Vec<Vec<u8>> = Vec::new();
        {
            let band = &mut tile.components[0].resolutions[0].bands[0];
            let mb = band.mb;
            for (bi, blk) in band.precincts[0].blocks.iter_mut().enumerate() {
                let w = blk.rect.width() as usize;
                let h = blk.rect.height() as usize;
                let coeffs: Vec<i32> = (0..w * h)
                    .map(|i| ((i as i32 * 13 + bi as i32 * 7) % 101) - 50)
                    .collect();
                let enc = BlockEncoder::encode(
                    &coeffs,
                    w,
                    h,
                    SubbandKind::LL,
                    CblkStyle::empty(),
                    mb,
                    1.0,
                )
                .unwrap();
                blk.layer_passes = vec![enc.passes.len() as u32];
                expected.push(enc.data.clone());
                blk.enc = Some(enc);
            }
        }

        let ctx = PacketCtx {
            style: CblkStyle::empty(),
            ht: false,
            use_sop: false,
            use_eph: false,
        };
        let bands = &mut tile.components[0].resolutions[0].bands;
        let mut enc_states = vec![vec![PrecinctEncState::new(&bands[0].precincts[0], 1)]];
        let packet = emit_packet(bands, &mut enc_states, 0, 0, 0, &ctx);

        let dec_bands = &mut dec_tile.components[0].resolutions[0].bands;
        let mut dec_states = vec![vec![PrecinctDecState::new(&dec_bands[0].precincts[0])]];
        let used =
            parse_packet(&packet, 0, dec_bands, &mut dec_states, 0, 0, &ctx, true).unwrap();
        assert_eq!(used, packet.len());

        for (blk, want) in dec_bands[0].precincts[0].blocks.iter().zip(&expected) {
            assert!(blk.included);
            assert_eq!(&blk.data, want);
            assert!(blk.passes_total > 0);
        }
    }

    #[test]
    fn test_empty_packet_is_one_byte() {
        let mut tile = one_band_tile();
        for blk in tile.components[0].resolutions[0].bands[0].precincts[0]
            .blocks
            .iter_mut()
        {
            blk.layer_passes = vec![0];
        }
        let ctx = PacketCtx {
            style: CblkStyle::empty(),
            ht: false,
            use_sop: false,
            use_eph: false,
        };
        let bands = &mut tile.components[0].resolutions[0].bands;
        let mut states = vec![vec![PrecinctEncState::new(&bands[0].precincts[0], 1)]];
        let packet = emit_packet(bands, &mut states, 0, 0, 0, &ctx);
        assert_eq!(packet.len(), 1);

        let mut dec_tile = one_band_tile();
        let dec_bands = &mut dec_tile.components[0].resolutions[0].bands;
        let mut dec_states = vec![vec![PrecinctDecState::new(&dec_bands[0].precincts[0])]];
        let used =
            parse_packet(&packet, 0, dec_bands, &mut dec_states, 0, 0, &ctx, true).unwrap();
        assert_eq!(used, 1);
        assert!(dec_bands[0].precincts[0].blocks.iter().all(|b| !b.included));
    }

    #[test]
    fn test_multi_layer_inclusion_state() {
        // Two layers: half the blocks join in layer 0, the rest in layer
        // 1; parse both packets and check pass totals accumulate.
        let mut tile = one_band_tile();
        {
            let band = &mut tile.components[0].resolutions[0].bands[0];
            let mb = band.mb;
            let n = band.precincts[0].blocks.len();
            for (bi, blk) in band.precincts[0].blocks.iter_mut().enumerate() {
                let w = blk.rect.width() as usize;
                let h = blk.rect.height() as usize;
                let coeffs: Vec<i32> = (0..w * h).map(|i| (i as i32 % 17) - 8).collect();
                let enc = BlockEncoder::encode(
                    &coeffs,
                    w,
                    h,
                    SubbandKind::LL,
                    CblkStyle::empty(),
                    mb,
                    1.0,
                )
                .unwrap();
                let total = enc.passes.len() as u32;
                blk.layer_passes = if bi < n / 2 {
                    vec![total.min(2), total]
                } else {
                    vec![0, total]
                };
                blk.enc = Some(enc);
            }
        }
        let ctx = PacketCtx {
            style: CblkStyle::empty(),
            ht: false,
            use_sop: false,
            use_eph: false,
        };
        let bands = &mut tile.components[0].resolutions[0].bands;
        let mut enc_states = vec![vec![PrecinctEncState::new(&bands[0].precincts[0], 2)]];
        let p0 = emit_packet(bands, &mut enc_states, 0, 0, 0, &ctx);
        let p1 = emit_packet(bands, &mut enc_states, 0, 1, 1, &ctx);

        let mut dec_tile = one_band_tile();
        let dec_bands = &mut dec_tile.components[0].resolutions[0].bands;
        let mut dec_states = vec![vec![PrecinctDecState::new(&dec_bands[0].precincts[0])]];
        parse_packet(&p0, 0, dec_bands, &mut dec_states, 0, 0, &ctx, true).unwrap();
        parse_packet(&p1, 0, dec_bands, &mut dec_states, 0, 1, &ctx, true).unwrap();

        for (blk, src) in dec_bands[0].precincts[0]
            .blocks
            .iter()
            .zip(&tile.components[0].resolutions[0].bands[0].precincts[0].blocks)
        {
            assert!(blk.included);
            assert_eq!(
                blk.passes_total,
                *src.layer_passes.last().unwrap(),
                "pass totals accumulate across layers"
            );
            assert_eq!(blk.data.len(), src.enc.as_ref().unwrap().data.len());
        }
    }
}
