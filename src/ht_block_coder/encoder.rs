//! FBCOT cleanup-pass encoder.

use byteorder::{BigEndian, ByteOrder};

use crate::bit_io::BitWriter;
use crate::bit_plane_coder::{EncodedBlock, PassInfo, PassType};
use crate::error::J2kError;

use super::mag_sgn::MagSgnEncoder;
use super::mel::MelEncoder;
use super::{quad_context, vlc, QUAD_OFFSETS, TRAILER_LEN};

/// Encode one code-block with the HT cleanup pass. Produces a single
/// coding pass whose rate is the whole block contribution; `dist_weight`
/// scales the distortion estimate like the EBCOT encoder's.
pub fn encode_block(
    coeffs: &[i32],
    w: usize,
    h: usize,
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

    let qw = w.div_ceil(2);
    let qh = h.div_ceil(2);
    let mut rho_grid = vec![0u8; qw * qh];

    let mut mel = MelEncoder::new();
    let mut vlc_out = BitWriter::new();
    let mut magsgn = MagSgnEncoder::new();
    let mut distortion = 0.0f64;

    for qy in 0..qh {
        for qx in 0..qw {
            let mut mags = [0u32; 4];
            let mut negs = [false; 4];
            let mut rho = 0u8;
            for (n, (dx, dy)) in QUAD_OFFSETS.iter().enumerate() {
                let (x, y) = (2 * qx + dx, 2 * qy + dy);
                if x < w && y < h {
                    let c = coeffs[y * w + x];
                    mags[n] = c.unsigned_abs();
                    negs[n] = c < 0;
                    if mags[n] != 0 {
                        rho |= 1 << n;
                    }
                }
            }

            let (initial, ctx) = quad_context(&rho_grid, qw, qx, qy);
            if ctx == 0 {
                mel.encode(rho != 0);
                if rho == 0 {
                    continue;
                }
            } else if rho == 0 {
                vlc::encode(&mut vlc_out, initial, ctx, 0, false);
                continue;
            }
            rho_grid[qy * qw + qx] = rho;

            let u = mags
                .iter()
                .map(|&m| 32 - m.leading_zeros())
                .max()
                .unwrap_or(1)
                .max(1);
            let u_off = u > 1;
            vlc::encode(&mut vlc_out, initial, ctx, rho, u_off);
            if u_off {
                vlc::encode_u_suffix(&mut vlc_out, u - 2);
            }
            for n in 0..4 {
                if rho & (1 << n) != 0 {
                    magsgn.push(mags[n], negs[n], u as u8);
                    distortion += dist_weight * (mags[n] as f64) * (mags[n] as f64);
                }
            }
        }
    }

    let magsgn_bytes = magsgn.finish();
    let mel_bytes = mel.finish();
    let vlc_bytes = vlc_out.finish_raw();

    let scup = mel_bytes.len() + vlc_bytes.len() + TRAILER_LEN;
    let mut data =
        Vec::with_capacity(magsgn_bytes.len() + scup);
    data.extend_from_slice(&magsgn_bytes);
    data.extend_from_slice(&mel_bytes);
    data.extend_from_slice(&vlc_bytes);
    let mut trailer = [0u8; TRAILER_LEN];
    BigEndian::write_u16(&mut trailer[0..2], scup as u16);
    BigEndian::write_u16(&mut trailer[2..4], mel_bytes.len() as u16);
    data.extend_from_slice(&trailer);

    let rate = data.len();
    Ok(EncodedBlock {
        data,
        passes: vec![PassInfo {
            pass_type: PassType::Cleanup,
            plane: 0,
            rate,
            distortion,
            terminated: true,
        }],
        num_planes: k,
        zero_planes: mb - k,
    })
}
