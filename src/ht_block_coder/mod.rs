//! HTJ2K Fast Block Coder with Optimized Truncation (ISO/IEC 15444-15).
//!
//! The FBCOT cleanup pass processes a code-block in a single forward scan
//! over 2x2 quads, splitting the work across three sub-coders: MEL codes
//! all-zero predictions for quads with an empty neighbourhood, the
//! context-indexed CxtVLC tables code each quad's significance pattern
//! and u-offset, and MagSgn carries the raw magnitude and sign bits.
//! Optional SigProp and MagRef refinement passes are plain raw
//! bit-planes.
//!
//! Block data layout: the MagSgn stream grows forward from the start; the
//! suffix holds the MEL stream followed by the VLC stream and a four-byte
//! trailer `[scup: u16][mel_len: u16]`, where scup counts the whole
//! suffix. The packet header signals the total length explicitly.

pub mod mag_sgn;
pub mod mel;
pub mod vlc;

mod decoder;
mod encoder;

pub use decoder::decode_block;
pub use encoder::encode_block;

use crate::bit_io::{BitReader, BitWriter};
use crate::error::J2kError;

pub(crate) const TRAILER_LEN: usize = 4;

/// Sample offsets of a quad, in coding order.
pub(crate) const QUAD_OFFSETS: [(usize, usize); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

/// Neighbourhood context of a quad, per the standard's two line-pair
/// families: the initial line-pair sees only the west neighbours, every
/// later line-pair sees west, north and the two north diagonals.
/// Returns (initial, context); context 0 means an empty neighbourhood,
/// whose rho = 0 case MEL predicts.
pub(crate) fn quad_context(rho: &[u8], qw: usize, qx: usize, qy: usize) -> (bool, u8) {
    let sig = |x: isize, y: isize| -> u8 {
        (x >= 0 && y >= 0 && (x as usize) < qw && rho[y as usize * qw + x as usize] != 0)
            as u8
    };
    let (x, y) = (qx as isize, qy as isize);
    if qy == 0 {
        let ctx = sig(x - 1, 0) | (sig(x - 2, 0) << 1);
        (true, ctx)
    } else {
        let ctx = sig(x - 1, y)
            | (sig(x, y - 1) << 1)
            | ((sig(x - 1, y - 1) | sig(x + 1, y - 1)) << 2);
        (false, ctx)
    }
}

/// Raw HT significance-propagation pass at `plane`: for each sample not
/// yet significant above the plane but with a significant neighbour, emit
/// its bit and, when set, its sign. Fixed scan, no adaptive contexts.
pub fn sig_prop_pass_encode(coeffs: &[i32], w: usize, h: usize, plane: u8) -> Vec<u8> {
    let mut out = BitWriter::new();
    let sig = |x: i64, y: i64, floor: u8| -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < w
            && (y as usize) < h
            && coeffs[y as usize * w + x as usize].unsigned_abs() >> floor != 0
    };
    for y0 in (0..h).step_by(4) {
        for x in 0..w {
            for y in y0..(y0 + 4).min(h) {
                let mag = coeffs[y * w + x].unsigned_abs();
                if mag >> (plane + 1) != 0 {
                    continue;
                }
                let (xi, yi) = (x as i64, y as i64);
                let any = (-1..=1).any(|dy| {
                    (-1..=1).any(|dx| (dx, dy) != (0, 0) && sig(xi + dx, yi + dy, plane + 1))
                });
                if !any {
                    continue;
                }
                let bit = ((mag >> plane) & 1) as u8;
                out.write_bit(bit);
                if bit == 1 {
                    out.write_bit((coeffs[y * w + x] < 0) as u8);
                }
            }
        }
    }
    out.finish_raw()
}

/// Decode counterpart of `sig_prop_pass_encode`, merging new significance
/// into `coeffs`.
pub fn sig_prop_pass_decode(
    data: &[u8],
    coeffs: &mut [i32],
    w: usize,
    h: usize,
    plane: u8,
) -> Result<(), J2kError> {
    let mut input = BitReader::new(data);
    for y0 in (0..h).step_by(4) {
        for x in 0..w {
            for y in y0..(y0 + 4).min(h) {
                let mag = coeffs[y * w + x].unsigned_abs();
                if mag >> (plane + 1) != 0 {
                    continue;
                }
                let any = (-1i64..=1).any(|dy| {
                    (-1i64..=1).any(|dx| {
                        if (dx, dy) == (0, 0) {
                            return false;
                        }
                        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                        nx >= 0
                            && ny >= 0
                            && (nx as usize) < w
                            && (ny as usize) < h
                            && coeffs[ny as usize * w + nx as usize].unsigned_abs()
                                >> (plane + 1)
                                != 0
                    })
                });
                if !any {
                    continue;
                }
                if input.read_bit()? == 1 {
                    let neg = input.read_bit()? == 1;
                    let v = (mag | 1 << plane) as i32;
                    coeffs[y * w + x] = if neg { -v } else { v };
                }
            }
        }
    }
    Ok(())
}

/// Raw HT magnitude-refinement pass: one bit per sample already
/// significant above `plane`.
pub fn mag_ref_pass_encode(coeffs: &[i32], w: usize, h: usize, plane: u8) -> Vec<u8> {
    let mut out = BitWriter::new();
    for y0 in (0..h).step_by(4) {
        for x in 0..w {
            for y in y0..(y0 + 4).min(h) {
                let mag = coeffs[y * w + x].unsigned_abs();
                if mag >> (plane + 1) != 0 {
                    out.write_bit(((mag >> plane) & 1) as u8);
                }
            }
        }
    }
    out.finish_raw()
}

pub fn mag_ref_pass_decode(
    data: &[u8],
    coeffs: &mut [i32],
    w: usize,
    h: usize,
    plane: u8,
) -> Result<(), J2kError> {
    let mut input = BitReader::new(data);
    for y0 in (0..h).step_by(4) {
        for x in 0..w {
            for y in y0..(y0 + 4).min(h) {
                let mag = coeffs[y * w + x].unsigned_abs();
                if mag >> (plane + 1) != 0 && input.read_bit()? == 1 {
                    let v = (mag | 1 << plane) as i32;
                    coeffs[y * w + x] = if coeffs[y * w + x] < 0 { -v } else { v };
                }
            }
        }
    }
    Ok(())
}
