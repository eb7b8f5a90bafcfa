//! Codestream marker-segment writer (ISO/IEC 15444-1 Annex A).
//!
//! Emits exactly the segments the parser consumes. Every length field is
//! computed up front; Psot is patched once the tile-part body size is
//! known.

use crate::config::{CodingStyle, ColorTransform, QuantizationStyle};
use crate::marker_code::MarkerCode;
use crate::stream_writer::StreamWriter;
use crate::tile::CodingParams;

/// Rsiz capability field: bit 14 declares Part 15 (HT) code-blocks.
pub const RSIZ_HT: u16 = 0x4000;

/// Pcap bit declaring a Part 15 capability word.
pub const PCAP_HT: u32 = 1 << 14;

/// Ccap15 flag: every code-block is HT coded.
pub const CCAP15_HT_ONLY: u16 = 0x0020;

pub fn write_main_header(w: &mut StreamWriter, params: &CodingParams) {
    w.write_marker(MarkerCode::StartOfCodestream);
    write_siz(w, params);
    if let Some(pcap) = params.cap {
        write_cap(w, pcap, params);
    }
    if let Some(pcpf) = params.cpf {
        write_cpf(w, pcpf);
    }
    write_cod(w, params);
    write_qcd(w, params);
    for ci in 1..params.comp.len() {
        let cc = &params.comp[ci];
        let base = &params.comp[0];
        if cc.step_sizes != base.step_sizes
            || cc.quant_style != base.quant_style
            || cc.guard_bits != base.guard_bits
        {
            write_qcc(w, params, ci as u16);
        }
    }
    for (ci, cc) in params.comp.iter().enumerate() {
        if cc.roi_shift > 0 {
            write_rgn(w, params, ci as u16, cc.roi_shift);
        }
    }
    if let Some(text) = &params.comment {
        write_com(w, text);
    }
}

fn write_siz(w: &mut StreamWriter, params: &CodingParams) {
    let g = &params.grid;
    w.write_marker(MarkerCode::ImageAndTileSize);
    w.write_u16(38 + 3 * params.components.len() as u16);
    let rsiz = if params.uses_ht() { RSIZ_HT } else { 0 };
    w.write_u16(rsiz);
    w.write_u32(g.xsiz);
    w.write_u32(g.ysiz);
    w.write_u32(g.xosiz);
    w.write_u32(g.yosiz);
    w.write_u32(g.xtsiz);
    w.write_u32(g.ytsiz);
    w.write_u32(g.xtosiz);
    w.write_u32(g.ytosiz);
    w.write_u16(params.components.len() as u16);
    for c in &params.components {
        w.write_u8((c.bit_depth - 1) | if c.signed { 0x80 } else { 0 });
        w.write_u8(c.dx);
        w.write_u8(c.dy);
    }
}

fn write_cap(w: &mut StreamWriter, pcap: u32, params: &CodingParams) {
    w.write_marker(MarkerCode::Capability);
    let ccap15 = if pcap & PCAP_HT != 0 {
        let ht_only = params
            .comp
            .iter()
            .all(|c| c.cblk_style.contains(crate::config::CblkStyle::HT_ONLY));
        Some(if ht_only { CCAP15_HT_ONLY } else { 0 })
    } else {
        None
    };
    w.write_u16(2 + 4 + if ccap15.is_some() { 2 } else { 0 });
    w.write_u32(pcap);
    if let Some(c) = ccap15 {
        w.write_u16(c);
    }
}

fn write_cpf(w: &mut StreamWriter, pcpf: u16) {
    w.write_marker(MarkerCode::CorrespondingProfile);
    w.write_u16(4);
    w.write_u16(pcpf);
}

fn write_cod(w: &mut StreamWriter, params: &CodingParams) {
    let cc = &params.comp[0];
    let mut scod = CodingStyle::empty();
    if !cc.precincts.is_empty() {
        scod.insert(CodingStyle::PRECINCTS_DEFINED);
    }
    if params.use_sop {
        scod.insert(CodingStyle::USE_SOP);
    }
    if params.use_eph {
        scod.insert(CodingStyle::USE_EPH);
    }
    let precinct_bytes = if cc.precincts.is_empty() {
        0
    } else {
        cc.levels as u16 + 1
    };
    w.write_marker(MarkerCode::CodingStyleDefault);
    w.write_u16(12 + precinct_bytes);
    w.write_u8(scod.bits());
    w.write_u8(params.progression as u8);
    w.write_u16(params.num_layers);
    w.write_u8(if params.mct == ColorTransform::None { 0 } else { 1 });
    w.write_u8(cc.levels);
    w.write_u8(cc.cblk_w_exp - 2);
    w.write_u8(cc.cblk_h_exp - 2);
    w.write_u8(cc.cblk_style.bits());
    w.write_u8(if cc.reversible { 1 } else { 0 });
    for &(px, py) in &cc.precincts {
        w.write_u8(px | (py << 4));
    }
}

fn write_qcd(w: &mut StreamWriter, params: &CodingParams) {
    let cc = &params.comp[0];
    w.write_marker(MarkerCode::QuantizationDefault);
    let (style_bits, body): (u8, u16) = match cc.quant_style {
        QuantizationStyle::None => (0, cc.step_sizes.len() as u16),
        QuantizationStyle::ScalarDerived => (1, 2),
        QuantizationStyle::ScalarExpounded => (2, 2 * cc.step_sizes.len() as u16),
    };
    w.write_u16(3 + body);
    w.write_u8((cc.guard_bits << 5) | style_bits);
    match cc.quant_style {
        QuantizationStyle::None => {
            for s in &cc.step_sizes {
                w.write_u8(s.to_wire_reversible());
            }
        }
        QuantizationStyle::ScalarDerived => {
            w.write_u16(cc.step_sizes[0].to_wire());
        }
        QuantizationStyle::ScalarExpounded => {
            for s in &cc.step_sizes {
                w.write_u16(s.to_wire());
            }
        }
    }
}

fn write_qcc(w: &mut StreamWriter, params: &CodingParams, comp: u16) {
    let cc = &params.comp[comp as usize];
    let wide = params.components.len() >= 257;
    let idx_len: u16 = if wide { 2 } else { 1 };
    w.write_marker(MarkerCode::QuantizationComponent);
    let (style_bits, body): (u8, u16) = match cc.quant_style {
        QuantizationStyle::None => (0, cc.step_sizes.len() as u16),
        QuantizationStyle::ScalarDerived => (1, 2),
        QuantizationStyle::ScalarExpounded => (2, 2 * cc.step_sizes.len() as u16),
    };
    w.write_u16(3 + idx_len + body);
    if wide {
        w.write_u16(comp);
    } else {
        w.write_u8(comp as u8);
    }
    w.write_u8((cc.guard_bits << 5) | style_bits);
    match cc.quant_style {
        QuantizationStyle::None => {
            for s in &cc.step_sizes {
                w.write_u8(s.to_wire_reversible());
            }
        }
        QuantizationStyle::ScalarDerived => {
            w.write_u16(cc.step_sizes[0].to_wire());
        }
        QuantizationStyle::ScalarExpounded => {
            for s in &cc.step_sizes {
                w.write_u16(s.to_wire());
            }
        }
    }
}

fn write_rgn(w: &mut StreamWriter, params: &CodingParams, comp: u16, shift: u8) {
    w.write_marker(MarkerCode::RegionOfInterest);
    let wide = params.components.len() >= 257;
    w.write_u16(if wide { 6 } else { 5 });
    if wide {
        w.write_u16(comp);
    } else {
        w.write_u8(comp as u8);
    }
    w.write_u8(0); // Srgn: max-shift
    w.write_u8(shift);
}

fn write_com(w: &mut StreamWriter, text: &str) {
    w.write_marker(MarkerCode::Comment);
    let bytes = text.as_bytes();
    w.write_u16(4 + bytes.len() as u16);
    w.write_u16(1); // Rcom: Latin text
    w.write_bytes(bytes);
}

/// Emit one tile-part: SOT, SOD, body. Psot is exact because the body is
/// already assembled.
pub fn write_tile_part(
    w: &mut StreamWriter,
    tile_index: u16,
    tp_index: u8,
    tp_count: u8,
    body: &[u8],
) {
    w.write_marker(MarkerCode::StartOfTile);
    w.write_u16(10);
    w.write_u16(tile_index);
    // SOT(2) + Lsot(2) + payload(8) + SOD(2) + body
    w.write_u32(14 + body.len() as u32);
    w.write_u8(tp_index);
    w.write_u8(tp_count);
    w.write_marker(MarkerCode::StartOfData);
    w.write_bytes(body);
}

pub fn write_eoc(w: &mut StreamWriter) {
    w.write_marker(MarkerCode::EndOfCodestream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;
    use crate::image::ImageBuffer;
    use crate::marker_code::MarkerCode;
    use crate::parser::Parser;
    use crate::stream_reader::StreamReader;

    fn params_for(p: &EncodeParams) -> CodingParams {
        crate::encoder::coding_params(&ImageBuffer::new_rgb(64, 64, 8), p).unwrap()
    }

    #[test]
    fn test_every_marker_length_is_exact() {
        let mut p = EncodeParams::lossy();
        p.comment = Some("test stream".into());
        p.color_transform = crate::config::ColorTransform::IrreversibleIct;
        let cp = params_for(&p);
        let mut sw = StreamWriter::new();
        write_main_header(&mut sw, &cp);
        let bytes = sw.into_bytes();

        // Walk the segments: after SOC, every marker carries a length
        // that lands exactly on the next 0xFF marker byte.
        let mut r = StreamReader::new(&bytes);
        assert_eq!(r.read_marker().unwrap(), MarkerCode::StartOfCodestream);
        while r.remaining() > 0 {
            let _marker = r.read_marker().unwrap();
            let len = r.read_segment_len().unwrap();
            r.advance(len).unwrap();
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_header_parses_back() {
        let p = EncodeParams {
            use_eph: true,
            comment: Some("roundtrip".into()),
            ..EncodeParams::default()
        };
        let cp = params_for(&p);
        let mut sw = StreamWriter::new();
        write_main_header(&mut sw, &cp);
        // Append a fake SOT so the parser stops cleanly.
        sw.write_marker(MarkerCode::StartOfTile);
        sw.write_u16(10);
        sw.write_u16(0);
        sw.write_u32(14);
        sw.write_u8(0);
        sw.write_u8(1);
        let bytes = sw.into_bytes();

        let mut r = StreamReader::new(&bytes);
        let main = Parser::parse_main_header(&mut r).unwrap();
        assert!(main.params.use_eph);
        assert_eq!(main.params.comment.as_deref(), Some("roundtrip"));
        assert_eq!(main.params.components.len(), 3);
        let sot = Parser::parse_sot(&mut r).unwrap();
        assert_eq!(sot.tile_index, 0);
        assert_eq!(sot.psot, 14);
    }

    #[test]
    fn test_tile_part_psot() {
        let mut sw = StreamWriter::new();
        write_tile_part(&mut sw, 3, 0, 1, &[1, 2, 3, 4, 5]);
        write_eoc(&mut sw);
        let bytes = sw.into_bytes();
        let mut r = StreamReader::new(&bytes);
        let sot = Parser::parse_sot(&mut r).unwrap();
        assert_eq!(sot.tile_index, 3);
        assert_eq!(sot.psot as usize, 14 + 5);
        assert_eq!(sot.tp_count, 1);
    }
}
