//! Scalar dead-zone quantization (ISO/IEC 15444-1 Annex E).
//!
//! Irreversible subbands carry an 11-bit mantissa and 5-bit exponent per
//! step size; the reversible path quantizes with step 1 and only shifts
//! bit-planes by the subband gain. Dequantization uses midpoint
//! reconstruction (r = 0.5) in the irreversible path and r = 0 in the
//! reversible path.

use crate::geometry::SubbandKind;

/// Signalled step size (SPqcd / SPqcc): exponent 0..=31, mantissa 0..=2047.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSize {
    pub exponent: u8,
    pub mantissa: u16,
}

impl StepSize {
    pub fn to_wire(self) -> u16 {
        ((self.exponent as u16) << 11) | (self.mantissa & 0x7FF)
    }

    pub fn from_wire(v: u16) -> Self {
        Self {
            exponent: (v >> 11) as u8,
            mantissa: v & 0x7FF,
        }
    }

    /// Reversible style signals only an exponent, in the top 5 bits of a
    /// single byte.
    pub fn to_wire_reversible(self) -> u8 {
        self.exponent << 3
    }

    pub fn from_wire_reversible(v: u8) -> Self {
        Self {
            exponent: v >> 3,
            mantissa: 0,
        }
    }

    /// Actual step value: delta = 2^(Rb - exponent) * (1 + mantissa/2^11),
    /// where Rb is the nominal dynamic range of the subband.
    pub fn value(self, rb: u8) -> f64 {
        let e = rb as i32 - self.exponent as i32;
        (2f64).powi(e) * (1.0 + self.mantissa as f64 / 2048.0)
    }

    /// Closest signallable step size not larger in exponent range than
    /// `delta`; the encoder must quantize with the reconstruction of this
    /// value, not with `delta` itself.
    pub fn for_delta(delta: f64, rb: u8) -> Self {
        let t = delta / (2f64).powi(rb as i32);
        let eps = (-t.log2()).ceil().clamp(0.0, 31.0) as u8;
        let rem = t * (2f64).powi(eps as i32);
        let mantissa = (((rem - 1.0) * 2048.0).round()).clamp(0.0, 2047.0) as u16;
        Self {
            exponent: eps,
            mantissa,
        }
    }
}

/// Dead-zone quantizer: q = sign(c) * floor(|c| / delta). The implicit
/// dead zone is 2*delta wide because of the floor at zero.
pub fn quantize(coeff: f32, delta: f32) -> i32 {
    let q = (coeff.abs() / delta) as i32;
    if coeff < 0.0 {
        -q
    } else {
        q
    }
}

/// Midpoint reconstruction: c' = sign(q) * (|q| + r) * delta, zero stays
/// zero.
pub fn dequantize(q: i32, delta: f32, r: f32) -> f32 {
    if q == 0 {
        return 0.0;
    }
    let mag = (q.unsigned_abs() as f32 + r) * delta;
    if q < 0 {
        -mag
    } else {
        mag
    }
}

/// Exponent signalled for a reversible subband: component depth plus the
/// subband gain.
pub fn reversible_exponent(bit_depth: u8, kind: SubbandKind) -> u8 {
    bit_depth + kind.gain()
}

/// Number of magnitude bit-planes Tier-1 walks for a subband:
/// Mb = exponent + guard_bits - 1.
pub fn max_bitplanes(exponent: u8, guard_bits: u8) -> u8 {
    exponent + guard_bits - 1
}

/// Derived quantization (Sqcd style 1): one signalled step for the LL
/// band; band at decomposition level `lev` (LL uses `n_levels`) gets
/// exponent eps0 - n_levels + lev with the shared mantissa.
pub fn derived_step(base: StepSize, n_levels: u8, lev: u8) -> StepSize {
    let exponent = (base.exponent as i32 - n_levels as i32 + lev as i32).clamp(0, 31) as u8;
    StepSize {
        exponent,
        mantissa: base.mantissa,
    }
}

// Synthesis-basis L2 norms per decomposition level, used to weight
// distortion estimates across subbands and to spread the base step over
// the decomposition. Index by level, LL entry 0 meaning "no
// decomposition". Values beyond the table converge to doubling.
const NORM_97_LL: [f64; 10] = [
    1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9,
];
const NORM_97_HL: [f64; 10] = [
    1.000, 1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9,
];
const NORM_97_HH: [f64; 10] = [
    1.000, 0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93,
];
const NORM_53_LL: [f64; 10] = [
    1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3,
];
const NORM_53_HL: [f64; 10] = [
    1.000, 1.038, 1.588, 2.925, 5.793, 11.54, 23.07, 46.13, 92.26, 184.5,
];
const NORM_53_HH: [f64; 10] = [
    1.000, 0.7186, 0.9271, 1.749, 3.443, 6.865, 13.72, 27.44, 54.88, 109.8,
];

/// L2 norm of the synthesis basis vectors of a subband; `lev` is the
/// band's decomposition level (LL passes the full level count).
pub fn band_norm(reversible: bool, kind: SubbandKind, lev: u8) -> f64 {
    let idx = (lev as usize).min(9);
    let table = match (reversible, kind) {
        (false, SubbandKind::LL) => &NORM_97_LL,
        (false, SubbandKind::HL) | (false, SubbandKind::LH) => &NORM_97_HL,
        (false, SubbandKind::HH) => &NORM_97_HH,
        (true, SubbandKind::LL) => &NORM_53_LL,
        (true, SubbandKind::HL) | (true, SubbandKind::LH) => &NORM_53_HL,
        (true, SubbandKind::HH) => &NORM_53_HH,
    };
    table[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_floor_and_sign() {
        assert_eq!(quantize(10.5, 2.0), 5);
        assert_eq!(quantize(-10.5, 2.0), -5);
        assert_eq!(quantize(1.99, 2.0), 0);
        assert_eq!(quantize(-1.99, 2.0), 0);
    }

    #[test]
    fn test_dequantize_midpoint_error_bound() {
        let delta = 2.0;
        for c in [-11.3f32, -2.0, 0.0, 0.4, 5.9, 100.01] {
            let q = quantize(c, delta);
            let r = dequantize(q, delta, 0.5);
            assert!((c - r).abs() <= delta, "{c} -> {q} -> {r}");
        }
    }

    #[test]
    fn test_step_size_wire_roundtrip() {
        let s = StepSize {
            exponent: 13,
            mantissa: 1534,
        };
        assert_eq!(StepSize::from_wire(s.to_wire()), s);
        assert_eq!(
            StepSize::from_wire_reversible(s.to_wire_reversible()).exponent,
            13
        );
    }

    #[test]
    fn test_for_delta_inverts_value() {
        for rb in [8u8, 10, 12] {
            for delta in [0.001, 0.03, 0.25, 1.0, 3.7] {
                let s = StepSize::for_delta(delta, rb);
                let v = s.value(rb);
                // Signalled step is within one mantissa ulp of requested.
                let rel = (v - delta).abs() / delta;
                assert!(rel < 1e-3, "delta {delta} rb {rb}: got {v}");
            }
        }
    }

    #[test]
    fn test_reversible_bitplane_budget() {
        let eps = reversible_exponent(8, SubbandKind::HH);
        assert_eq!(eps, 10);
        assert_eq!(max_bitplanes(eps, 2), 11);
    }

    #[test]
    fn test_derived_step_chain() {
        let base = StepSize {
            exponent: 16,
            mantissa: 100,
        };
        let finest = derived_step(base, 5, 1);
        let coarsest = derived_step(base, 5, 5);
        assert_eq!(coarsest.exponent, 16);
        assert_eq!(finest.exponent, 12);
        assert!(finest.value(10) > coarsest.value(10));
    }
}
