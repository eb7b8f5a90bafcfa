//! FBCOT cleanup-pass decoder.
//!
//! Reads the three sub-streams through their pointers: MagSgn forward
//! from the start of the block data, MEL and VLC out of the suffix whose
//! length the trailer records. A malformed tail yields the quads decoded
//! so far rather than an error; the block simply contributes fewer
//! coefficients.

use byteorder::{BigEndian, ByteOrder};

use crate::bit_io::BitReader;
use crate::error::J2kError;

use super::mag_sgn::MagSgnDecoder;
use super::mel::MelDecoder;
use super::{quad_context, vlc, QUAD_OFFSETS, TRAILER_LEN};

pub fn decode_block(data: &[u8], w: usize, h: usize, k: u8) -> Vec<i32> {
    let mut out = vec![0i32; w * h];
    if k == 0 || data.len() < TRAILER_LEN || w == 0 || h == 0 {
        return out;
    }
    if let Err(e) = decode_into(data, &mut out, w, h) {
        log::warn!("HT cleanup decode stopped early: {e}");
    }
    out
}

fn decode_into(data: &[u8], out: &mut [i32], w: usize, h: usize) -> Result<(), J2kError> {
    let trailer = &data[data.len() - TRAILER_LEN..];
    let scup = BigEndian::read_u16(&trailer[0..2]) as usize;
    let mel_len = BigEndian::read_u16(&trailer[2..4]) as usize;
    if scup < TRAILER_LEN || scup > data.len() || mel_len > scup - TRAILER_LEN {
        return Err(J2kError::malformed(0, "HT block trailer out of range"));
    }
    let suffix_start = data.len() - scup;
    let magsgn_bytes = &data[..suffix_start];
    let mel_bytes = &data[suffix_start..suffix_start + mel_len];
    let vlc_bytes = &data[suffix_start + mel_len..data.len() - TRAILER_LEN];

    let mut mel = MelDecoder::new(mel_bytes);
    let mut vlc_in = BitReader::new(vlc_bytes);
    let mut magsgn = MagSgnDecoder::new(magsgn_bytes);

    let qw = w.div_ceil(2);
    let qh = h.div_ceil(2);
    let mut rho_grid = vec![0u8; qw * qh];

    for qy in 0..qh {
        for qx in 0..qw {
            let (initial, ctx) = quad_context(&rho_grid, qw, qx, qy);
            if ctx == 0 && !mel.decode() {
                continue;
            }
            let (rho, u_off) = vlc::decode(&mut vlc_in, initial, ctx)?;
            if rho == 0 {
                if ctx == 0 {
                    return Err(J2kError::malformed(0, "MEL promised a significant quad"));
                }
                continue;
            }
            rho_grid[qy * qw + qx] = rho;

            let u = if u_off {
                vlc::decode_u_suffix(&mut vlc_in)? + 2
            } else {
                1
            };
            for (n, (dx, dy)) in QUAD_OFFSETS.iter().enumerate() {
                if rho & (1 << n) == 0 {
                    continue;
                }
                let (x, y) = (2 * qx + dx, 2 * qy + dy);
                let (mag, neg) = magsgn.pull(u as u8)?;
                if x < w && y < h {
                    out[y * w + x] = if neg { -(mag as i32) } else { mag as i32 };
                }
            }
        }
    }
    Ok(())
}
