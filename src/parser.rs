//! Codestream marker-segment parser (ISO/IEC 15444-1 Annex A).
//!
//! Parses the main header into `CodingParams` and tile-part headers into
//! `SotInfo`. Packet data inside tile-parts is handled by the decoder
//! through the Tier-2 machinery; this module stops at marker level.

use crate::config::{
    CblkStyle, CodingStyle, ColorTransform, ProgressionOrder, QuantizationStyle,
};
use crate::error::J2kError;
use crate::geometry::GridGeometry;
use crate::image::ComponentInfo;
use crate::marker_code::MarkerCode;
use crate::quantization::StepSize;
use crate::stream_reader::StreamReader;
use crate::tile::{CodingParams, CompCoding};

/// Start-of-tile-part header (SOT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SotInfo {
    pub tile_index: u16,
    /// Tile-part length from the SOT marker itself; 0 means "to EOC".
    pub psot: u32,
    pub tp_index: u8,
    pub tp_count: u8,
}

#[derive(Debug, Clone)]
pub struct MainHeader {
    pub params: CodingParams,
    pub rsiz: u16,
}

/// One COD/COC payload before it is bound to components.
#[derive(Debug, Clone)]
struct CodSegment {
    style: CodingStyle,
    progression: ProgressionOrder,
    num_layers: u16,
    mct: u8,
    levels: u8,
    cblk_w_exp: u8,
    cblk_h_exp: u8,
    cblk_style: CblkStyle,
    reversible: bool,
    precincts: Vec<(u8, u8)>,
}

#[derive(Debug, Clone)]
struct QcdSegment {
    quant_style: QuantizationStyle,
    guard_bits: u8,
    step_sizes: Vec<StepSize>,
}

pub struct Parser;

impl Parser {
    /// Parse SOC through the last main-header segment; the reader is left
    /// positioned at the first SOT marker.
    pub fn parse_main_header(r: &mut StreamReader) -> Result<MainHeader, J2kError> {
        let at = r.offset();
        if r.read_marker()? != MarkerCode::StartOfCodestream {
            return Err(J2kError::malformed(at, "missing SOC"));
        }

        let mut grid: Option<GridGeometry> = None;
        let mut components: Vec<ComponentInfo> = Vec::new();
        let mut rsiz = 0u16;
        let mut cod: Option<CodSegment> = None;
        let mut qcd: Option<QcdSegment> = None;
        let mut coc: Vec<(u16, CodSegment)> = Vec::new();
        let mut qcc: Vec<(u16, QcdSegment)> = Vec::new();
        let mut rgn: Vec<(u16, u8)> = Vec::new();
        let mut cap: Option<u32> = None;
        let mut cpf: Option<u16> = None;
        let mut comment: Option<String> = None;

        loop {
            let at = r.offset();
            let marker = r.read_marker()?;
            match marker {
                MarkerCode::StartOfTile => {
                    r.seek(at)?;
                    break;
                }
                MarkerCode::ImageAndTileSize => {
                    let (g, comps, rs) = Self::parse_siz(r)?;
                    grid = Some(g);
                    components = comps;
                    rsiz = rs;
                }
                MarkerCode::CodingStyleDefault => {
                    cod = Some(Self::parse_cod(r, None)?.1);
                }
                MarkerCode::CodingStyleComponent => {
                    let n = components.len();
                    if n == 0 {
                        return Err(J2kError::malformed(at, "COC before SIZ"));
                    }
                    let (idx, seg) = Self::parse_cod(r, Some(n))?;
                    coc.push((idx.unwrap_or(0), seg));
                }
                MarkerCode::QuantizationDefault => {
                    qcd = Some(Self::parse_qcd(r, None)?.1);
                }
                MarkerCode::QuantizationComponent => {
                    let n = components.len();
                    if n == 0 {
                        return Err(J2kError::malformed(at, "QCC before SIZ"));
                    }
                    let seg = Self::parse_qcd(r, Some(n))?;
                    qcc.push((seg.0.unwrap(), seg.1));
                }
                MarkerCode::Capability => {
                    cap = Some(Self::parse_cap(r)?);
                }
                MarkerCode::CorrespondingProfile => {
                    cpf = Some(Self::parse_cpf(r)?);
                }
                MarkerCode::RegionOfInterest => {
                    rgn.push(Self::parse_rgn(r, components.len())?);
                }
                MarkerCode::Comment => {
                    comment = Some(Self::parse_com(r)?);
                }
                MarkerCode::ProgressionOrderChange => {
                    return Err(J2kError::UnsupportedFeature(
                        "progression order change (POC)".into(),
                    ));
                }
                MarkerCode::PackedPacketHeadersMain | MarkerCode::PackedPacketHeadersTilePart => {
                    return Err(J2kError::UnsupportedFeature(
                        "packed packet headers (PPM/PPT)".into(),
                    ));
                }
                MarkerCode::EndOfCodestream => {
                    return Err(J2kError::malformed(at, "EOC before any tile-part"));
                }
                _ => {
                    // Informational segments (TLM, PLM, CRG, ...) are
                    // skipped by their length.
                    let len = r.read_segment_len()?;
                    r.advance(len)?;
                }
            }
        }

        let grid =
            grid.ok_or_else(|| J2kError::malformed(r.offset(), "missing SIZ in main header"))?;
        let cod =
            cod.ok_or_else(|| J2kError::malformed(r.offset(), "missing COD in main header"))?;
        let qcd =
            qcd.ok_or_else(|| J2kError::malformed(r.offset(), "missing QCD in main header"))?;

        let mut comp = Vec::with_capacity(components.len());
        for ci in 0..components.len() {
            let c = coc
                .iter()
                .find(|(i, _)| *i as usize == ci)
                .map(|(_, s)| s)
                .unwrap_or(&cod);
            let q = qcc
                .iter()
                .find(|(i, _)| *i as usize == ci)
                .map(|(_, s)| s)
                .unwrap_or(&qcd);
            let roi_shift = rgn
                .iter()
                .find(|(i, _)| *i as usize == ci)
                .map(|(_, s)| *s)
                .unwrap_or(0);
            if !c.reversible && q.quant_style == QuantizationStyle::None {
                return Err(J2kError::malformed(
                    r.offset(),
                    "irreversible transform without scalar quantization",
                ));
            }
            comp.push(CompCoding {
                levels: c.levels,
                cblk_w_exp: c.cblk_w_exp,
                cblk_h_exp: c.cblk_h_exp,
                cblk_style: c.cblk_style,
                reversible: c.reversible,
                precincts: c.precincts.clone(),
                quant_style: q.quant_style,
                guard_bits: q.guard_bits,
                step_sizes: q.step_sizes.clone(),
                roi_shift,
            });
        }

        let mct = match (cod.mct, cod.reversible) {
            (0, _) => ColorTransform::None,
            (_, true) => ColorTransform::ReversibleRct,
            (_, false) => ColorTransform::IrreversibleIct,
        };

        Ok(MainHeader {
            params: CodingParams {
                grid,
                components,
                progression: cod.progression,
                num_layers: cod.num_layers,
                mct,
                comp,
                use_sop: cod.style.contains(CodingStyle::USE_SOP),
                use_eph: cod.style.contains(CodingStyle::USE_EPH),
                cap,
                cpf,
                comment,
            },
            rsiz,
        })
    }

    fn parse_siz(
        r: &mut StreamReader,
    ) -> Result<(GridGeometry, Vec<ComponentInfo>, u16), J2kError> {
        let at = r.offset();
        let len = r.read_segment_len()?;
        let rsiz = r.read_u16()?;
        let grid = GridGeometry {
            xsiz: r.read_u32()?,
            ysiz: r.read_u32()?,
            xosiz: r.read_u32()?,
            yosiz: r.read_u32()?,
            xtsiz: r.read_u32()?,
            ytsiz: r.read_u32()?,
            xtosiz: r.read_u32()?,
            ytosiz: r.read_u32()?,
        };
        let csiz = r.read_u16()? as usize;
        if len != 36 + 3 * csiz {
            return Err(J2kError::malformed(at, "SIZ length inconsistent"));
        }
        if csiz == 0 || csiz > 16384 {
            return Err(J2kError::malformed(at, "component count out of range"));
        }
        if grid.xsiz <= grid.xosiz
            || grid.ysiz <= grid.yosiz
            || grid.xtsiz == 0
            || grid.ytsiz == 0
        {
            return Err(J2kError::malformed(at, "degenerate image or tile grid"));
        }
        let mut comps = Vec::with_capacity(csiz);
        for _ in 0..csiz {
            let ssiz = r.read_u8()?;
            let dx = r.read_u8()?;
            let dy = r.read_u8()?;
            if dx == 0 || dy == 0 {
                return Err(J2kError::malformed(at, "zero subsampling factor"));
            }
            comps.push(ComponentInfo {
                bit_depth: (ssiz & 0x7F) + 1,
                signed: ssiz & 0x80 != 0,
                dx,
                dy,
            });
        }
        Ok((grid, comps, rsiz))
    }

    fn parse_cod(
        r: &mut StreamReader,
        coc_comp_count: Option<usize>,
    ) -> Result<(Option<u16>, CodSegment), J2kError> {
        let at = r.offset();
        let len = r.read_segment_len()?;
        let mut read = 0usize;
        let comp_idx = match coc_comp_count {
            None => None,
            Some(n) if n < 257 => {
                read += 1;
                Some(r.read_u8()? as u16)
            }
            Some(_) => {
                read += 2;
                Some(r.read_u16()?)
            }
        };
        let scod = CodingStyle::from_bits_truncate(r.read_u8()?);
        read += 1;

        let (progression, num_layers, mct) = if comp_idx.is_some() {
            (ProgressionOrder::Lrcp, 1, 0)
        } else {
            let p = r.read_u8()?;
            let layers = r.read_u16()?;
            let mct = r.read_u8()?;
            read += 4;
            let progression = ProgressionOrder::from_wire(p)
                .ok_or_else(|| J2kError::malformed(at, "unknown progression order"))?;
            if layers == 0 {
                return Err(J2kError::malformed(at, "zero quality layers"));
            }
            (progression, layers, mct)
        };

        let levels = r.read_u8()?;
        let cblk_w_exp = r.read_u8()? + 2;
        let cblk_h_exp = r.read_u8()? + 2;
        let cblk_style = CblkStyle::from_bits_truncate(r.read_u8()?);
        let transformation = r.read_u8()?;
        read += 5;
        if levels > 32 {
            return Err(J2kError::malformed(at, "decomposition levels above 32"));
        }
        if !(2..=10).contains(&cblk_w_exp) || !(2..=10).contains(&cblk_h_exp) {
            return Err(J2kError::malformed(at, "code-block exponent out of range"));
        }

        let mut precincts = Vec::new();
        if scod.contains(CodingStyle::PRECINCTS_DEFINED) {
            for _ in 0..=levels {
                if read >= len {
                    return Err(J2kError::malformed(at, "precinct list short of COD length"));
                }
                let b = r.read_u8()?;
                read += 1;
                precincts.push((b & 0x0F, b >> 4));
            }
        }
        if read != len {
            return Err(J2kError::malformed(at, "COD/COC length inconsistent"));
        }

        Ok((
            comp_idx,
            CodSegment {
                style: scod,
                progression,
                num_layers,
                mct,
                levels,
                cblk_w_exp,
                cblk_h_exp,
                cblk_style,
                reversible: transformation == 1,
                precincts,
            },
        ))
    }

    fn parse_qcd(
        r: &mut StreamReader,
        comp_count: Option<usize>,
    ) -> Result<(Option<u16>, QcdSegment), J2kError> {
        let at = r.offset();
        let len = r.read_segment_len()?;
        let mut read = 0usize;
        let comp_idx = match comp_count {
            None => None,
            Some(n) if n < 257 => {
                read += 1;
                Some(r.read_u8()? as u16)
            }
            Some(_) => {
                read += 2;
                Some(r.read_u16()?)
            }
        };
        let sq = r.read_u8()?;
        read += 1;
        if len < read {
            return Err(J2kError::malformed(at, "QCD/QCC length inconsistent"));
        }
        let guard_bits = sq >> 5;
        let style = sq & 0x1F;
        let remaining = len - read;
        let (quant_style, step_sizes) = match style {
            0 => {
                let mut steps = Vec::with_capacity(remaining);
                for _ in 0..remaining {
                    steps.push(StepSize::from_wire_reversible(r.read_u8()?));
                }
                (QuantizationStyle::None, steps)
            }
            1 => {
                if remaining != 2 {
                    return Err(J2kError::malformed(at, "derived QCD needs one step size"));
                }
                (
                    QuantizationStyle::ScalarDerived,
                    vec![StepSize::from_wire(r.read_u16()?)],
                )
            }
            2 => {
                if remaining % 2 != 0 {
                    return Err(J2kError::malformed(at, "expounded QCD length odd"));
                }
                let mut steps = Vec::with_capacity(remaining / 2);
                for _ in 0..remaining / 2 {
                    steps.push(StepSize::from_wire(r.read_u16()?));
                }
                (QuantizationStyle::ScalarExpounded, steps)
            }
            _ => {
                return Err(J2kError::malformed(at, "unknown quantization style"));
            }
        };
        Ok((
            comp_idx,
            QcdSegment {
                quant_style,
                guard_bits,
                step_sizes,
            },
        ))
    }

    fn parse_cap(r: &mut StreamReader) -> Result<u32, J2kError> {
        let at = r.offset();
        let len = r.read_segment_len()?;
        if len < 4 {
            return Err(J2kError::malformed(at, "CAP too short"));
        }
        let pcap = r.read_u32()?;
        r.advance(len - 4)?;
        Ok(pcap)
    }

    fn parse_cpf(r: &mut StreamReader) -> Result<u16, J2kError> {
        let at = r.offset();
        let len = r.read_segment_len()?;
        if len < 2 {
            return Err(J2kError::malformed(at, "CPF too short"));
        }
        let pcpf = r.read_u16()?;
        r.advance(len - 2)?;
        Ok(pcpf)
    }

    fn parse_rgn(r: &mut StreamReader, num_comps: usize) -> Result<(u16, u8), J2kError> {
        let _len = r.read_segment_len()?;
        let comp = if num_comps < 257 {
            r.read_u8()? as u16
        } else {
            r.read_u16()?
        };
        let srgn = r.read_u8()?;
        if srgn != 0 {
            return Err(J2kError::UnsupportedFeature(format!(
                "ROI style {srgn} (only max-shift is defined)"
            )));
        }
        let shift = r.read_u8()?;
        Ok((comp, shift))
    }

    fn parse_com(r: &mut StreamReader) -> Result<String, J2kError> {
        let len = r.read_segment_len()?;
        let _rcom = r.read_u16()?;
        let bytes = r.read_bytes(len - 2)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Parse one SOT segment; the reader must sit on the marker.
    pub fn parse_sot(r: &mut StreamReader) -> Result<SotInfo, J2kError> {
        let at = r.offset();
        if r.read_marker()? != MarkerCode::StartOfTile {
            return Err(J2kError::malformed(at, "expected SOT"));
        }
        let len = r.read_segment_len()?;
        if len != 8 {
            return Err(J2kError::malformed(at, "SOT length must be 10"));
        }
        Ok(SotInfo {
            tile_index: r.read_u16()?,
            psot: r.read_u32()?,
            tp_index: r.read_u8()?,
            tp_count: r.read_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;
    use crate::image::ImageBuffer;

    fn header_bytes(params: &EncodeParams, w: u32, h: u32) -> Vec<u8> {
        let image = ImageBuffer::new_gray(w, h, 8);
        let cp = crate::encoder::coding_params(&image, params).unwrap();
        let mut sw = crate::stream_writer::StreamWriter::new();
        crate::writer::write_main_header(&mut sw, &cp);
        sw.into_bytes()
    }

    #[test]
    fn test_main_header_roundtrip() {
        let bytes = header_bytes(&EncodeParams::default(), 120, 80);
        let mut r = StreamReader::new(&bytes);
        let main = Parser::parse_main_header(&mut r).unwrap();
        let cp = main.params;
        assert_eq!(cp.grid.xsiz, 120);
        assert_eq!(cp.grid.ysiz, 80);
        assert_eq!(cp.components.len(), 1);
        assert_eq!(cp.comp[0].levels, 5);
        assert!(cp.comp[0].reversible);
        assert_eq!(cp.num_layers, 1);
        assert_eq!(cp.comp[0].guard_bits, 2);
        assert_eq!(cp.comp[0].step_sizes.len(), 16);
    }

    #[test]
    fn test_missing_soc_rejected() {
        let bytes = [0x00u8, 0x01, 0x02, 0x03];
        let mut r = StreamReader::new(&bytes);
        assert!(matches!(
            Parser::parse_main_header(&mut r),
            Err(J2kError::MalformedCodestream { .. })
        ));
    }

    #[test]
    fn test_truncated_header_reports_truncation() {
        let full = header_bytes(&EncodeParams::default(), 32, 32);
        let cut = &full[..full.len() / 2];
        let mut r = StreamReader::new(cut);
        assert!(matches!(
            Parser::parse_main_header(&mut r),
            Err(J2kError::TruncatedInput { .. })
        ));
    }
}
