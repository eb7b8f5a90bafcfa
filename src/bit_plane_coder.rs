//! EBCOT Tier-1 bit-plane coding (ISO/IEC 15444-1 Annex D).
//!
//! Encodes one code-block at a time: three passes per magnitude bit-plane
//! (significance propagation, magnitude refinement, cleanup; the most
//! significant coded plane gets a cleanup pass only), driven by the MQ
//! coder over 19 adaptive contexts. Per-coefficient state lives in a
//! border-padded flag grid and is read and written in place, so a
//! coefficient that becomes significant is seen by the very next
//! coefficient visited in the same pass.
//!
//! Scanning order: stripes of four rows; columns left to right within a
//! stripe; top to bottom within a column.

use crate::bit_io::{BitReader, BitWriter};
use crate::config::CblkStyle;
use crate::error::J2kError;
use crate::geometry::SubbandKind;
use crate::mq_coder::{MqDecoder, MqEncoder, TerminationMode};

/// Context allocation: 9 zero-coding, 5 sign-coding, 3 magnitude
/// refinement, run-length, uniform.
pub const NUM_CTX: usize = 19;
const CTX_SC0: usize = 9;
const CTX_MR0: usize = 14;
const CTX_RUN: usize = 17;
const CTX_UNI: usize = 18;

// Per-coefficient state flags.
const SIG: u8 = 1;
const VISITED: u8 = 2;
const REFINED: u8 = 4;
const SIGN_NEG: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    SigProp,
    MagRef,
    Cleanup,
}

/// One coding pass as recorded by the encoder: its cumulative truncation
/// length in bytes (exact at segment boundaries, a safe upper bound
/// elsewhere) and the cumulative distortion reduction it achieves.
#[derive(Debug, Clone)]
pub struct PassInfo {
    pub pass_type: PassType,
    pub plane: u8,
    pub rate: usize,
    pub distortion: f64,
    /// A codeword segment ends after this pass.
    pub terminated: bool,
}

/// Tier-1 output for one code-block.
#[derive(Debug, Clone, Default)]
pub struct EncodedBlock {
    pub data: Vec<u8>,
    pub passes: Vec<PassInfo>,
    /// Magnitude planes actually coded (K).
    pub num_planes: u8,
    /// Missing most-significant planes (Mb - K).
    pub zero_planes: u8,
}

/// Position of pass `index` in the pass schedule of a block with `k`
/// coded planes: (type, plane). Pass 0 is the cleanup of plane k-1.
pub fn pass_schedule(index: u32, k: u8) -> (PassType, u8) {
    if index == 0 {
        return (PassType::Cleanup, k - 1);
    }
    let group = ((index - 1) / 3) as u8;
    let plane = k - 2 - group;
    match (index - 1) % 3 {
        0 => (PassType::SigProp, plane),
        1 => (PassType::MagRef, plane),
        _ => (PassType::Cleanup, plane),
    }
}

/// Whether a pass is raw-coded under the selective-bypass style: SPP and
/// MRP of every plane after the first four coded planes.
pub fn pass_is_raw(style: CblkStyle, index: u32, k: u8) -> bool {
    if !style.contains(CblkStyle::SELECTIVE_BYPASS) {
        return false;
    }
    let (ty, plane) = pass_schedule(index, k);
    ty != PassType::Cleanup && (k - 1) - plane >= 4
}

/// Whether a codeword segment ends after pass `index` out of `total`.
pub fn pass_terminates(style: CblkStyle, index: u32, total: u32, k: u8) -> bool {
    if index + 1 >= total {
        return true;
    }
    if style.intersects(CblkStyle::TERMINATION_ON_EACH_PASS | CblkStyle::PREDICTABLE_TERMINATION)
    {
        return true;
    }
    pass_is_raw(style, index, k) != pass_is_raw(style, index + 1, k)
}

fn init_contexts(mut set: impl FnMut(usize, u8, u8)) {
    for cx in 0..NUM_CTX {
        set(cx, 0, 0);
    }
    set(0, 4, 0);
    set(CTX_RUN, 3, 0);
    set(CTX_UNI, 46, 0);
}

/// Zero-coding context from significant-neighbour counts (Table D.1).
/// LL and LH share a table; HL swaps the roles of h and v; HH is driven
/// by the diagonal count.
fn zc_context(kind: SubbandKind, h: u32, v: u32, d: u32) -> usize {
    let (h, v) = match kind {
        SubbandKind::HL => (v, h),
        _ => (h, v),
    };
    match kind {
        SubbandKind::HH => match (d, h + v) {
            (0, 0) => 0,
            (0, 1) => 1,
            (0, _) => 2,
            (1, 0) => 3,
            (1, 1) => 4,
            (1, _) => 5,
            (2, 0) => 6,
            (2, _) => 7,
            _ => 8,
        },
        _ => match (h, v, d) {
            (0, 0, 0) => 0,
            (0, 0, 1) => 1,
            (0, 0, _) => 2,
            (0, 1, _) => 3,
            (0, _, _) => 4,
            (1, 0, 0) => 5,
            (1, 0, _) => 6,
            (1, _, _) => 7,
            _ => 8,
        },
    }
}

/// Sign-coding context and XOR bit from the clamped horizontal and
/// vertical sign contributions (Table D.3).
fn sc_context(hc: i32, vc: i32) -> (usize, u8) {
    match (hc, vc) {
        (1, 1) => (CTX_SC0 + 4, 0),
        (1, 0) => (CTX_SC0 + 3, 0),
        (1, -1) => (CTX_SC0 + 2, 0),
        (0, 1) => (CTX_SC0 + 1, 0),
        (0, 0) => (CTX_SC0, 0),
        (0, -1) => (CTX_SC0 + 1, 1),
        (-1, 1) => (CTX_SC0 + 2, 1),
        (-1, 0) => (CTX_SC0 + 3, 1),
        _ => (CTX_SC0 + 4, 1),
    }
}

fn mr_context(refined: bool, any_neighbor: bool) -> usize {
    if refined {
        CTX_MR0 + 2
    } else if any_neighbor {
        CTX_MR0 + 1
    } else {
        CTX_MR0
    }
}

/// Flag grid with a one-sample border so neighbour reads never branch.
struct FlagGrid {
    flags: Vec<u8>,
    stride: usize,
}

impl FlagGrid {
    fn new(w: usize, h: usize) -> Self {
        Self {
            flags: vec![0; (w + 2) * (h + 2)],
            stride: w + 2,
        }
    }

    #[inline]
    fn idx(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.stride + (x + 1)
    }

    /// Significant-neighbour counts (horizontal, vertical, diagonal).
    /// Vertically-causal mode masks the row below the current stripe.
    fn counts(&self, i: usize, mask_below: bool) -> (u32, u32, u32) {
        let s = self.stride;
        let f = &self.flags;
        let h = (f[i - 1] & SIG != 0) as u32 + (f[i + 1] & SIG != 0) as u32;
        let mut v = (f[i - s] & SIG != 0) as u32;
        let mut d = (f[i - s - 1] & SIG != 0) as u32 + (f[i - s + 1] & SIG != 0) as u32;
        if !mask_below {
            v += (f[i + s] & SIG != 0) as u32;
            d += (f[i + s - 1] & SIG != 0) as u32 + (f[i + s + 1] & SIG != 0) as u32;
        }
        (h, v, d)
    }

    /// Clamped sign contributions for sign coding.
    fn sign_contrib(&self, i: usize, mask_below: bool) -> (i32, i32) {
        let s = self.stride;
        let contrib = |f: u8| -> i32 {
            if f & SIG == 0 {
                0
            } else if f & SIGN_NEG != 0 {
                -1
            } else {
                1
            }
        };
        let hc = (contrib(self.flags[i - 1]) + contrib(self.flags[i + 1])).clamp(-1, 1);
        let below = if mask_below {
            0
        } else {
            contrib(self.flags[i + s])
        };
        let vc = (contrib(self.flags[i - s]) + below).clamp(-1, 1);
        (hc, vc)
    }

    fn clear_visited(&mut self) {
        for f in self.flags.iter_mut() {
            *f &= !VISITED;
        }
    }
}

pub struct BlockEncoder {
    w: usize,
    h: usize,
    mags: Vec<u32>,
    grid: FlagGrid,
    band: SubbandKind,
    style: CblkStyle,
    causal: bool,
    mq: MqEncoder,
    raw: Option<BitWriter>,
    data: Vec<u8>,
    dist_weight: f64,
    distortion: f64,
}

impl BlockEncoder {
    /// Encode one code-block of signed coefficients. `mb` is the
    /// subband's bit-plane budget; `dist_weight` scales the per-pass
    /// distortion estimates into the common squared-error domain of the
    /// rate controller.
    pub fn encode(
        coeffs: &[i32],
        w: usize,
        h: usize,
        band: SubbandKind,
        style: CblkStyle,
        mb: u8,
        dist_weight: f64,
    ) -> Result<EncodedBlock, J2kError> {
        debug_assert_eq!(coeffs.len(), w * h);
        let max_mag = coeffs.iter().map(|c| c.unsigned_abs()).max().unwrap_or(0);
        let k = (32 - max_mag.leading_zeros()) as u8;
        if k > mb {
            return Err(J2kError::CoefficientOverflow {
                tile: 0,
                component: 0,
                resolution: 0,
            });
        }
        if k == 0 || w == 0 || h == 0 {
            return Ok(EncodedBlock {
                data: Vec::new(),
                passes: Vec::new(),
                num_planes: 0,
                zero_planes: mb,
            });
        }

        let mut grid = FlagGrid::new(w, h);
        for (i, &c) in coeffs.iter().enumerate() {
            if c < 0 {
                let gi = grid.idx(i % w, i / w);
                grid.flags[gi] |= SIGN_NEG;
            }
        }
        let mut mq = MqEncoder::new(NUM_CTX);
        init_contexts(|cx, st, mps| mq.set_context(cx, st, mps));

        let mut enc = Self {
            w,
            h,
            mags: coeffs.iter().map(|c| c.unsigned_abs()).collect(),
            grid,
            band,
            style,
            causal: style.contains(CblkStyle::VERTICALLY_CAUSAL),
            mq,
            raw: None,
            data: Vec::new(),
            dist_weight,
            distortion: 0.0,
        };

        let total = 3 * k as u32 - 2;
        let mut passes: Vec<PassInfo> = Vec::with_capacity(total as usize);
        for index in 0..total {
            let (ty, plane) = pass_schedule(index, k);
            enc.activate(pass_is_raw(style, index, k));
            match ty {
                PassType::SigProp => enc.sig_prop_pass(plane),
                PassType::MagRef => enc.mag_ref_pass(plane),
                PassType::Cleanup => enc.cleanup_pass(plane),
            }
            let terminated = pass_terminates(style, index, total, k);
            if terminated {
                enc.finish_segment();
            }
            if style.contains(CblkStyle::RESET_CONTEXT) {
                let mq = &mut enc.mq;
                init_contexts(|cx, st, mps| mq.set_context(cx, st, mps));
            }
            let rate = if terminated {
                enc.data.len()
            } else if let Some(bw) = &enc.raw {
                enc.data.len() + bw.byte_len() + 1
            } else {
                enc.data.len() + enc.mq.truncation_len()
            };
            passes.push(PassInfo {
                pass_type: ty,
                plane,
                rate,
                distortion: enc.distortion,
                terminated,
            });
        }
        let total_len = enc.data.len();

        // Truncation lengths are upper bounds; clamp them into the data
        // and keep them monotone.
        for p in passes.iter_mut() {
            p.rate = p.rate.min(total_len);
        }
        for i in (0..passes.len().saturating_sub(1)).rev() {
            let next = passes[i + 1].rate;
            if passes[i].rate > next {
                passes[i].rate = next;
            }
        }
        if let Some(last) = passes.last_mut() {
            last.rate = total_len;
        }

        Ok(EncodedBlock {
            data: enc.data,
            passes,
            num_planes: k,
            zero_planes: mb - k,
        })
    }

    /// Select the coder for the next pass. Segment boundaries are closed
    /// by `finish_segment` before the kind ever changes.
    fn activate(&mut self, want_raw: bool) {
        if want_raw && self.raw.is_none() {
            self.raw = Some(BitWriter::new());
        }
        debug_assert!(want_raw == self.raw.is_some());
    }

    /// Seal the open codeword segment and append its bytes.
    fn finish_segment(&mut self) {
        if let Some(bw) = self.raw.take() {
            self.data.extend_from_slice(&bw.finish_raw());
        } else {
            self.mq
                .terminate(if self.style.contains(CblkStyle::PREDICTABLE_TERMINATION) {
                    TerminationMode::Predictable
                } else {
                    TerminationMode::NearOptimal
                });
            self.data.extend_from_slice(self.mq.as_bytes());
            self.mq.restart_segment();
        }
    }

    fn mask_below(&self, y: usize) -> bool {
        self.causal && y % 4 == 3
    }

    fn encode_sign(&mut self, x: usize, y: usize) {
        let gi = self.grid.idx(x, y);
        let neg = self.grid.flags[gi] & SIGN_NEG != 0;
        if let Some(bw) = &mut self.raw {
            bw.write_bit(neg as u8);
        } else {
            let (hc, vc) = self.grid.sign_contrib(gi, self.mask_below(y));
            let (cx, xor) = sc_context(hc, vc);
            self.mq.encode((neg as u8) ^ xor, cx);
        }
    }

    fn sig_distortion(&mut self, plane: u8) {
        self.distortion += 2.0 * self.dist_weight * (2f64).powi(2 * plane as i32);
    }

    fn sig_prop_pass(&mut self, plane: u8) {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                for y in y0..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    if self.grid.flags[gi] & SIG != 0 {
                        continue;
                    }
                    let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                    if hn + vn + dn == 0 {
                        continue;
                    }
                    let bit = ((self.mags[y * w + x] >> plane) & 1) as u8;
                    if let Some(bw) = &mut self.raw {
                        bw.write_bit(bit);
                    } else {
                        self.mq.encode(bit, zc_context(self.band, hn, vn, dn));
                    }
                    if bit == 1 {
                        self.encode_sign(x, y);
                        self.grid.flags[gi] |= SIG;
                        self.sig_distortion(plane);
                    }
                    self.grid.flags[gi] |= VISITED;
                }
            }
        }
    }

    fn mag_ref_pass(&mut self, plane: u8) {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                for y in y0..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    let f = self.grid.flags[gi];
                    if f & SIG == 0 || f & VISITED != 0 {
                        continue;
                    }
                    let bit = ((self.mags[y * w + x] >> plane) & 1) as u8;
                    if let Some(bw) = &mut self.raw {
                        bw.write_bit(bit);
                    } else {
                        let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                        self.mq
                            .encode(bit, mr_context(f & REFINED != 0, hn + vn + dn > 0));
                    }
                    self.grid.flags[gi] |= REFINED;
                    self.distortion += 0.25 * self.dist_weight * (2f64).powi(2 * plane as i32);
                }
            }
        }
    }

    fn cleanup_pass(&mut self, plane: u8) {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                let mut start = y0;
                if y0 + 4 <= h && self.run_eligible(x, y0) {
                    let first_one = (y0..y0 + 4)
                        .position(|y| (self.mags[y * w + x] >> plane) & 1 == 1);
                    match first_one {
                        None => {
                            self.mq.encode(0, CTX_RUN);
                            continue;
                        }
                        Some(r) => {
                            self.mq.encode(1, CTX_RUN);
                            self.mq.encode(((r >> 1) & 1) as u8, CTX_UNI);
                            self.mq.encode((r & 1) as u8, CTX_UNI);
                            let y = y0 + r;
                            self.encode_sign(x, y);
                            let gi = self.grid.idx(x, y);
                            self.grid.flags[gi] |= SIG;
                            self.sig_distortion(plane);
                            start = y + 1;
                        }
                    }
                }
                for y in start..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    if self.grid.flags[gi] & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                    let bit = ((self.mags[y * w + x] >> plane) & 1) as u8;
                    self.mq.encode(bit, zc_context(self.band, hn, vn, dn));
                    if bit == 1 {
                        self.encode_sign(x, y);
                        self.grid.flags[gi] |= SIG;
                        self.sig_distortion(plane);
                    }
                }
            }
        }
        if self.style.contains(CblkStyle::SEGMENTATION_SYMBOLS) {
            for bit in [1, 0, 1, 0] {
                self.mq.encode(bit, CTX_UNI);
            }
        }
        self.grid.clear_visited();
    }

    fn run_eligible(&self, x: usize, y0: usize) -> bool {
        for y in y0..y0 + 4 {
            let gi = self.grid.idx(x, y);
            if self.grid.flags[gi] & (SIG | VISITED) != 0 {
                return false;
            }
            let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
            if hn + vn + dn != 0 {
                return false;
            }
        }
        true
    }
}

/// EBCOT Tier-1 decoder for one code-block.
pub struct BlockDecoder<'a> {
    w: usize,
    h: usize,
    mags: Vec<u32>,
    grid: FlagGrid,
    band: SubbandKind,
    style: CblkStyle,
    causal: bool,
    mq: MqDecoder<'a>,
    raw: Option<BitReader<'a>>,
    segments: Vec<&'a [u8]>,
    seg_cursor: usize,
}

impl<'a> BlockDecoder<'a> {
    /// Decode up to `num_passes` passes of a block with `k` coded planes.
    /// `segments` holds the codeword segments in stream order (a single
    /// segment unless the block style splits them). A corrupt or
    /// truncated tail decodes to the passes that survived.
    pub fn decode(
        segments: Vec<&'a [u8]>,
        w: usize,
        h: usize,
        band: SubbandKind,
        style: CblkStyle,
        k: u8,
        num_passes: u32,
    ) -> Vec<i32> {
        if k == 0 || num_passes == 0 || w == 0 || h == 0 || segments.is_empty() {
            return vec![0; w * h];
        }
        let mut mq = MqDecoder::new(segments[0], NUM_CTX);
        init_contexts(|cx, st, mps| mq.set_context(cx, st, mps));
        let mut dec = Self {
            w,
            h,
            mags: vec![0; w * h],
            grid: FlagGrid::new(w, h),
            band,
            style,
            causal: style.contains(CblkStyle::VERTICALLY_CAUSAL),
            mq,
            raw: None,
            segments,
            seg_cursor: 0,
        };

        let total = (3 * k as u32 - 2).min(num_passes);
        for index in 0..total {
            let (ty, plane) = pass_schedule(index, k);
            let raw = pass_is_raw(style, index, k);
            if index > 0
                && pass_terminates(style, index - 1, u32::MAX, k)
                && !dec.advance_segment(raw)
            {
                break;
            }
            let ok = match ty {
                PassType::SigProp => dec.sig_prop_pass(plane),
                PassType::MagRef => dec.mag_ref_pass(plane),
                PassType::Cleanup => dec.cleanup_pass(plane),
            };
            if !ok {
                log::debug!("tier-1 decode stopped at pass {index}");
                break;
            }
            if style.contains(CblkStyle::RESET_CONTEXT) {
                let mq = &mut dec.mq;
                init_contexts(|cx, st, mps| mq.set_context(cx, st, mps));
            }
        }

        let mut out = vec![0i32; w * h];
        for (i, slot) in out.iter_mut().enumerate() {
            let gi = dec.grid.idx(i % w, i / w);
            let mag = dec.mags[i] as i32;
            *slot = if dec.grid.flags[gi] & SIGN_NEG != 0 {
                -mag
            } else {
                mag
            };
        }
        out
    }

    /// Move to the next codeword segment; false when none remain.
    fn advance_segment(&mut self, raw: bool) -> bool {
        self.seg_cursor += 1;
        let Some(&seg) = self.segments.get(self.seg_cursor) else {
            return false;
        };
        if raw {
            self.raw = Some(BitReader::new(seg));
        } else {
            self.raw = None;
            self.mq.restart_segment(seg);
        }
        true
    }

    fn mask_below(&self, y: usize) -> bool {
        self.causal && y % 4 == 3
    }

    fn decode_sign(&mut self, x: usize, y: usize) -> Option<bool> {
        if let Some(br) = &mut self.raw {
            return br.read_bit().ok().map(|b| b == 1);
        }
        let gi = self.grid.idx(x, y);
        let (hc, vc) = self.grid.sign_contrib(gi, self.mask_below(y));
        let (cx, xor) = sc_context(hc, vc);
        Some(self.mq.decode(cx) ^ xor == 1)
    }

    fn make_significant(&mut self, x: usize, y: usize, plane: u8, neg: bool) {
        let gi = self.grid.idx(x, y);
        self.grid.flags[gi] |= SIG;
        if neg {
            self.grid.flags[gi] |= SIGN_NEG;
        }
        self.mags[y * self.w + x] |= 1 << plane;
    }

    fn sig_prop_pass(&mut self, plane: u8) -> bool {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                for y in y0..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    if self.grid.flags[gi] & SIG != 0 {
                        continue;
                    }
                    let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                    if hn + vn + dn == 0 {
                        continue;
                    }
                    let bit = if let Some(br) = &mut self.raw {
                        match br.read_bit() {
                            Ok(b) => b,
                            Err(_) => return false,
                        }
                    } else {
                        self.mq.decode(zc_context(self.band, hn, vn, dn))
                    };
                    if bit == 1 {
                        let Some(neg) = self.decode_sign(x, y) else {
                            return false;
                        };
                        self.make_significant(x, y, plane, neg);
                    }
                    self.grid.flags[gi] |= VISITED;
                }
            }
        }
        true
    }

    fn mag_ref_pass(&mut self, plane: u8) -> bool {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                for y in y0..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    let f = self.grid.flags[gi];
                    if f & SIG == 0 || f & VISITED != 0 {
                        continue;
                    }
                    let bit = if let Some(br) = &mut self.raw {
                        match br.read_bit() {
                            Ok(b) => b,
                            Err(_) => return false,
                        }
                    } else {
                        let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                        self.mq
                            .decode(mr_context(f & REFINED != 0, hn + vn + dn > 0))
                    };
                    self.grid.flags[gi] |= REFINED;
                    if bit == 1 {
                        self.mags[y * w + x] |= 1 << plane;
                    }
                }
            }
        }
        true
    }

    fn cleanup_pass(&mut self, plane: u8) -> bool {
        let (w, h) = (self.w, self.h);
        for y0 in (0..h).step_by(4) {
            for x in 0..w {
                let mut start = y0;
                if y0 + 4 <= h && self.run_eligible(x, y0) {
                    if self.mq.decode(CTX_RUN) == 0 {
                        continue;
                    }
                    let hi = self.mq.decode(CTX_UNI);
                    let lo = self.mq.decode(CTX_UNI);
                    let r = ((hi << 1) | lo) as usize;
                    let y = y0 + r;
                    let Some(neg) = self.decode_sign(x, y) else {
                        return false;
                    };
                    self.make_significant(x, y, plane, neg);
                    start = y + 1;
                }
                for y in start..(y0 + 4).min(h) {
                    let gi = self.grid.idx(x, y);
                    if self.grid.flags[gi] & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
                    let bit = self.mq.decode(zc_context(self.band, hn, vn, dn));
                    if bit == 1 {
                        let Some(neg) = self.decode_sign(x, y) else {
                            return false;
                        };
                        self.make_significant(x, y, plane, neg);
                    }
                }
            }
        }
        if self.style.contains(CblkStyle::SEGMENTATION_SYMBOLS) {
            let mut sym = 0u8;
            for _ in 0..4 {
                sym = (sym << 1) | self.mq.decode(CTX_UNI);
            }
            if sym != 0b1010 {
                log::warn!("segmentation symbol mismatch after cleanup of plane {plane}");
                self.grid.clear_visited();
                return false;
            }
        }
        self.grid.clear_visited();
        true
    }

    fn run_eligible(&self, x: usize, y0: usize) -> bool {
        for y in y0..y0 + 4 {
            let gi = self.grid.idx(x, y);
            if self.grid.flags[gi] & (SIG | VISITED) != 0 {
                return false;
            }
            let (hn, vn, dn) = self.grid.counts(gi, self.mask_below(y));
            if hn + vn + dn != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split the encoded data at the recorded segment boundaries.
    fn segment_slices(enc: &EncodedBlock) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let mut start = 0usize;
        for p in &enc.passes {
            if p.terminated {
                out.push(&enc.data[start..p.rate]);
                start = p.rate;
            }
        }
        if out.is_empty() {
            out.push(&enc.data[..]);
        }
        out
    }

    fn roundtrip(coeffs: &[i32], w: usize, h: usize, band: SubbandKind, style: CblkStyle) {
        let mb = 16;
        let enc = BlockEncoder::encode(coeffs, w, h, band, style, mb, 1.0).unwrap();
        let total = enc.passes.len() as u32;
        let out = BlockDecoder::decode(
            segment_slices(&enc),
            w,
            h,
            band,
            style,
            enc.num_planes,
            total,
        );
        assert_eq!(out, coeffs, "block {w}x{h} band {band:?} style {style:?}");
    }

    fn pattern(w: usize, h: usize, seed: u32) -> Vec<i32> {
        let mut x = seed | 1;
        (0..w * h)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                ((x % 512) as i32) - 256
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_small_blocks() {
        for (w, h) in [(4, 4), (8, 8), (16, 16), (5, 7), (1, 4), (4, 1), (3, 9)] {
            roundtrip(&pattern(w, h, 7), w, h, SubbandKind::LL, CblkStyle::empty());
        }
    }

    #[test]
    fn test_roundtrip_all_bands() {
        for band in [
            SubbandKind::LL,
            SubbandKind::HL,
            SubbandKind::LH,
            SubbandKind::HH,
        ] {
            roundtrip(&pattern(16, 16, 99), 16, 16, band, CblkStyle::empty());
        }
    }

    #[test]
    fn test_roundtrip_dense_64x64() {
        // Fully significant 64x64 block: every in-place significance
        // update must be visible to the immediately following coefficient
        // of the same pass.
        let coeffs: Vec<i32> = (0..64 * 64)
            .map(|i| {
                if i % 2 == 0 {
                    255 - (i as i32 % 251)
                } else {
                    -(i as i32 % 249) - 1
                }
            })
            .collect();
        roundtrip(&coeffs, 64, 64, SubbandKind::HH, CblkStyle::empty());
    }

    #[test]
    fn test_roundtrip_sparse_block() {
        let mut coeffs = vec![0i32; 32 * 32];
        coeffs[5] = 1;
        coeffs[700] = -300;
        coeffs[1023] = 7;
        roundtrip(&coeffs, 32, 32, SubbandKind::LH, CblkStyle::empty());
    }

    #[test]
    fn test_all_zero_block_has_no_passes() {
        let enc =
            BlockEncoder::encode(&[0; 64], 8, 8, SubbandKind::LL, CblkStyle::empty(), 10, 1.0)
                .unwrap();
        assert_eq!(enc.num_planes, 0);
        assert_eq!(enc.zero_planes, 10);
        assert!(enc.passes.is_empty());
        assert!(enc.data.is_empty());
    }

    #[test]
    fn test_overflow_detection() {
        let r = BlockEncoder::encode(
            &[1 << 12],
            1,
            1,
            SubbandKind::LL,
            CblkStyle::empty(),
            10,
            1.0,
        );
        assert!(matches!(r, Err(J2kError::CoefficientOverflow { .. })));
    }

    #[test]
    fn test_roundtrip_termall() {
        roundtrip(
            &pattern(16, 16, 33),
            16,
            16,
            SubbandKind::LL,
            CblkStyle::TERMINATION_ON_EACH_PASS,
        );
    }

    #[test]
    fn test_roundtrip_bypass() {
        roundtrip(
            &pattern(32, 32, 41),
            32,
            32,
            SubbandKind::HL,
            CblkStyle::SELECTIVE_BYPASS,
        );
    }

    #[test]
    fn test_roundtrip_bypass_with_termall() {
        roundtrip(
            &pattern(16, 16, 77),
            16,
            16,
            SubbandKind::HH,
            CblkStyle::SELECTIVE_BYPASS | CblkStyle::TERMINATION_ON_EACH_PASS,
        );
    }

    #[test]
    fn test_roundtrip_reset_causal_segsym() {
        roundtrip(
            &pattern(16, 16, 55),
            16,
            16,
            SubbandKind::LL,
            CblkStyle::RESET_CONTEXT
                | CblkStyle::VERTICALLY_CAUSAL
                | CblkStyle::SEGMENTATION_SYMBOLS,
        );
    }

    #[test]
    fn test_pass_truncation_decodes_prefix() {
        // Decoding fewer passes than coded must still terminate cleanly
        // and reproduce every plane above the truncation point.
        let coeffs = pattern(16, 16, 21);
        let enc = BlockEncoder::encode(
            &coeffs,
            16,
            16,
            SubbandKind::LL,
            CblkStyle::empty(),
            16,
            1.0,
        )
        .unwrap();
        let k = enc.num_planes;
        for keep in [1u32, 4, 7] {
            let rate = enc.passes[keep as usize - 1].rate;
            let prefix = &enc.data[..rate];
            let out = BlockDecoder::decode(
                vec![prefix],
                16,
                16,
                SubbandKind::LL,
                CblkStyle::empty(),
                k,
                keep,
            );
            let (_, plane) = pass_schedule(keep - 1, k);
            let mask = !((1u64 << plane) - 1) as u32;
            for (o, c) in out.iter().zip(&coeffs) {
                assert_eq!(o.unsigned_abs() & mask, c.unsigned_abs() & mask);
            }
        }
    }

    #[test]
    fn test_rates_monotone_and_bounded() {
        let enc = BlockEncoder::encode(
            &pattern(32, 32, 5),
            32,
            32,
            SubbandKind::HH,
            CblkStyle::empty(),
            16,
            1.0,
        )
        .unwrap();
        let mut prev = 0;
        for p in &enc.passes {
            assert!(p.rate >= prev);
            assert!(p.rate <= enc.data.len());
            prev = p.rate;
        }
        assert_eq!(enc.passes.last().unwrap().rate, enc.data.len());
        let mut prev_d = 0.0;
        for p in &enc.passes {
            assert!(p.distortion >= prev_d);
            prev_d = p.distortion;
        }
    }

    #[test]
    fn test_pass_schedule_shape() {
        assert!(matches!(pass_schedule(0, 5), (PassType::Cleanup, 4)));
        assert!(matches!(pass_schedule(1, 5), (PassType::SigProp, 3)));
        assert!(matches!(pass_schedule(2, 5), (PassType::MagRef, 3)));
        assert!(matches!(pass_schedule(3, 5), (PassType::Cleanup, 3)));
        assert!(matches!(pass_schedule(12, 5), (PassType::Cleanup, 0)));
    }
}
