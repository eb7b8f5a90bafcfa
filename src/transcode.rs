//! Coefficient-preserving Part 1 <-> Part 15 transcoding.
//!
//! Parses the source codestream down to code-block coefficients (Tier-2
//! then Tier-1), without dequantizing or inverse-transforming, and
//! re-encodes every block with the other Tier-1 coder. Quantization,
//! subband structure, tile geometry, code-block dimensions, progression
//! order and the layer at which each block first appears all carry
//! through unchanged; only the block coder, the COD style bits and the
//! CAP/CPF capability markers differ. The conversion is bit-exact on the
//! coefficients, so transcoding back reproduces the original stream.

use crate::bit_plane_coder::{BlockDecoder, BlockEncoder, EncodedBlock};
use crate::config::CblkStyle;
use crate::error::J2kError;
use crate::marker_code::MarkerCode;
use crate::packet::{parse_packet, PacketCtx, PrecinctDecState};
use crate::parser::Parser;
use crate::progression::packet_sequence;
use crate::stream_reader::StreamReader;
use crate::stream_writer::StreamWriter;
use crate::tile::{build_tile, TileModel};
use crate::writer::{write_eoc, write_main_header, write_tile_part, PCAP_HT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeTarget {
    /// Legacy EBCOT block coding (ISO/IEC 15444-1).
    Part1,
    /// HT block coding (ISO/IEC 15444-15).
    Part15,
}

/// Losslessly re-pack a codestream with the other Tier-1 coder.
pub fn transcode(data: &[u8], target: TranscodeTarget) -> Result<Vec<u8>, J2kError> {
    let mut r = StreamReader::new(data);
    let main = Parser::parse_main_header(&mut r)?;
    let src_cp = main.params;

    let mut dst_cp = src_cp.clone();
    for cc in &mut dst_cp.comp {
        match target {
            TranscodeTarget::Part1 => {
                cc.cblk_style.remove(CblkStyle::HT_FAST | CblkStyle::HT_ONLY);
            }
            TranscodeTarget::Part15 => {
                cc.cblk_style.insert(CblkStyle::HT_FAST | CblkStyle::HT_ONLY);
            }
        }
    }
    match target {
        TranscodeTarget::Part1 => {
            dst_cp.cap = None;
            dst_cp.cpf = None;
        }
        TranscodeTarget::Part15 => {
            dst_cp.cap = Some(PCAP_HT);
            dst_cp.cpf = Some(src_cp.cpf.unwrap_or(0));
        }
    }

    // Strict Tier-2 parse of every tile-part; a transcoder cannot salvage.
    let num_tiles = src_cp.grid.num_tiles();
    let mut src_tiles: Vec<TileModel> =
        (0..num_tiles).map(|t| build_tile(&src_cp, t)).collect();
    let mut states: Vec<Vec<Vec<Vec<Vec<PrecinctDecState>>>>> = src_tiles
        .iter()
        .map(|tile| {
            tile.components
                .iter()
                .map(|tc| {
                    tc.resolutions
                        .iter()
                        .map(|res| {
                            res.bands
                                .iter()
                                .map(|b| b.precincts.iter().map(PrecinctDecState::new).collect())
                                .collect()
                        })
                        .collect()
                })
                .collect()
        })
        .collect();
    let mut cursors = vec![0usize; num_tiles as usize];

    loop {
        match r.peek_marker()? {
            Some(MarkerCode::EndOfCodestream) => break,
            Some(MarkerCode::StartOfTile) => {}
            other => {
                return Err(J2kError::malformed(
                    r.offset(),
                    format!("unexpected marker {other:?} between tile-parts"),
                ));
            }
        }
        let sot_at = r.offset();
        let sot = Parser::parse_sot(&mut r)?;
        loop {
            let m = r.read_marker()?;
            if m == MarkerCode::StartOfData {
                break;
            }
            let len = r.read_segment_len()?;
            r.advance(len)?;
        }
        let body_start = r.offset();
        let body_end = if sot.psot == 0 {
            data.len().saturating_sub(2)
        } else {
            sot_at + sot.psot as usize
        };
        if body_end > data.len() {
            return Err(J2kError::TruncatedInput { offset: body_end });
        }
        let body = &data[body_start..body_end];
        let ti = sot.tile_index as usize;
        if ti >= num_tiles as usize {
            return Err(J2kError::malformed(sot_at, "tile index out of range"));
        }

        let tile = &mut src_tiles[ti];
        let sequence = packet_sequence(tile, src_cp.progression, src_cp.num_layers);
        let mut pos = 0usize;
        while cursors[ti] < sequence.len() && pos < body.len() {
            let pid = sequence[cursors[ti]];
            let ci = pid.comp as usize;
            let cc = &src_cp.comp[ci];
            let ctx = PacketCtx {
                style: cc.cblk_style,
                ht: cc.uses_ht(),
                use_sop: src_cp.use_sop,
                use_eph: src_cp.use_eph,
            };
            let res = &mut tile.components[ci].resolutions[pid.res as usize];
            let used = parse_packet(
                &body[pos..],
                body_start + pos,
                &mut res.bands,
                &mut states[ti][ci][pid.res as usize],
                pid.precinct as usize,
                pid.layer as usize,
                &ctx,
                true,
            )?;
            pos += used;
            cursors[ti] += 1;
        }
        r.seek(body_end)?;
    }

    // Recover coefficients and re-encode with the other block coder.
    let mut bodies = Vec::with_capacity(num_tiles as usize);
    for t in 0..num_tiles {
        let src_tile = &src_tiles[t as usize];
        let mut dst_tile = build_tile(&dst_cp, t);
        for (ci, (stc, dtc)) in src_tile
            .components
            .iter()
            .zip(dst_tile.components.iter_mut())
            .enumerate()
        {
            let scc = &src_cp.comp[ci];
            let src_ht = scc.uses_ht();
            let dst_ht = dst_cp.comp[ci].uses_ht();
            for (sres, dres) in stc.resolutions.iter().zip(dtc.resolutions.iter_mut()) {
                for (sband, dband) in sres.bands.iter().zip(dres.bands.iter_mut()) {
                    let mb = sband.mb;
                    for (sp, dp) in sband.precincts.iter().zip(dband.precincts.iter_mut()) {
                        for (sblk, dblk) in sp.blocks.iter().zip(dp.blocks.iter_mut()) {
                            let (w, h) = (
                                sblk.rect.width() as usize,
                                sblk.rect.height() as usize,
                            );
                            if !sblk.included || sblk.passes_used == 0 {
                                dblk.enc = Some(EncodedBlock {
                                    zero_planes: mb,
                                    ..EncodedBlock::default()
                                });
                                dblk.layer_passes = vec![0; dst_cp.num_layers as usize];
                                continue;
                            }
                            let k =
                                (mb as u32).saturating_sub(sblk.zero_planes).min(32) as u8;
                            let coeffs = if src_ht {
                                crate::ht_block_coder::decode_block(&sblk.data, w, h, k)
                            } else {
                                BlockDecoder::decode(
                                    crate::decoder::block_segments(sblk),
                                    w,
                                    h,
                                    sband.kind,
                                    scc.cblk_style,
                                    k,
                                    sblk.passes_used,
                                )
                            };
                            let enc = if dst_ht {
                                crate::ht_block_coder::encode_block(&coeffs, w, h, mb, 1.0)?
                            } else {
                                BlockEncoder::encode(
                                    &coeffs,
                                    w,
                                    h,
                                    dband.kind,
                                    dst_cp.comp[ci].cblk_style,
                                    mb,
                                    1.0,
                                )?
                            };
                            let total = enc.passes.len() as u32;
                            dblk.layer_passes = (0..dst_cp.num_layers)
                                .map(|l| if l >= sblk.first_layer { total } else { 0 })
                                .collect();
                            dblk.enc = Some(enc);
                        }
                    }
                }
            }
        }
        bodies.push(crate::encoder::assemble_tile_body(&mut dst_tile, &dst_cp));
    }

    let mut sw = StreamWriter::new();
    write_main_header(&mut sw, &dst_cp);
    for (t, body) in bodies.iter().enumerate() {
        write_tile_part(&mut sw, t as u16, 0, 1, body);
    }
    write_eoc(&mut sw);
    Ok(sw.into_bytes())
}
