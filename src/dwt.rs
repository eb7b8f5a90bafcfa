//! Discrete wavelet transforms (ISO/IEC 15444-1 Annex F).
//!
//! 1-D lifting for the reversible 5/3 and irreversible 9/7 filter banks,
//! separable 2-D application, and multi-level dyadic decomposition in the
//! Mallat arrangement (LL at the top-left after every level). Arbitrary
//! filters run through the generic `LiftingKernel` engine; 5/3 and 9/7
//! are specialized fast paths of the same lifting structure.
//!
//! Boundary handling is whole-sample symmetric extension, applied within
//! the tile-component only: a tile never reads samples of its neighbours.
//! Signals carry their absolute grid origin so an odd-origin interval
//! lifts with the correct phase (high-pass samples sit at odd absolute
//! positions).

/// Reflect an out-of-range index into `[0, len)` (period 2(len-1)).
fn reflect(mut i: isize, len: isize) -> usize {
    debug_assert!(len >= 1);
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    i = i.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

/// 5/3 reversible integer filter.
pub struct Dwt53;

impl Dwt53 {
    /// Forward lifting of one interleaved line whose first sample sits at
    /// an odd absolute position when `odd_start` is set. After the call,
    /// even absolute positions hold low-pass, odd hold high-pass values.
    pub fn forward_line(x: &mut [i32], odd_start: bool) {
        let len = x.len() as isize;
        if len == 0 {
            return;
        }
        if len == 1 {
            if odd_start {
                x[0] <<= 1;
            }
            return;
        }
        let phase = usize::from(odd_start);
        // Predict: y[2n+1] -= (y[2n] + y[2n+2]) >> 1
        let mut i = (1 + phase) % 2;
        while (i as isize) < len {
            if (i + phase) % 2 == 1 {
                let l = x[reflect(i as isize - 1, len)];
                let r = x[reflect(i as isize + 1, len)];
                x[i] -= (l + r) >> 1;
            }
            i += 1;
        }
        // Update: y[2n] += (y[2n-1] + y[2n+1] + 2) >> 2
        for i in 0..len as usize {
            if (i + phase) % 2 == 0 {
                let l = x[reflect(i as isize - 1, len)];
                let r = x[reflect(i as isize + 1, len)];
                x[i] += (l + r + 2) >> 2;
            }
        }
    }

    pub fn inverse_line(x: &mut [i32], odd_start: bool) {
        let len = x.len() as isize;
        if len == 0 {
            return;
        }
        if len == 1 {
            if odd_start {
                x[0] >>= 1;
            }
            return;
        }
        let phase = usize::from(odd_start);
        for i in 0..len as usize {
            if (i + phase) % 2 == 0 {
                let l = x[reflect(i as isize - 1, len)];
                let r = x[reflect(i as isize + 1, len)];
                x[i] -= (l + r + 2) >> 2;
            }
        }
        for i in 0..len as usize {
            if (i + phase) % 2 == 1 {
                let l = x[reflect(i as isize - 1, len)];
                let r = x[reflect(i as isize + 1, len)];
                x[i] += (l + r) >> 1;
            }
        }
    }
}

/// 9/7 irreversible filter, f32 lifting.
pub struct Dwt97;

impl Dwt97 {
    pub const ALPHA: f32 = -1.586_134_3;
    pub const BETA: f32 = -0.052_980_12;
    pub const GAMMA: f32 = 0.882_911_1;
    pub const DELTA: f32 = 0.443_506_85;
    pub const K: f32 = 1.230_174_1;
    pub const INV_K: f32 = 1.0 / Self::K;

    fn lift(x: &mut [f32], phase: usize, odd_targets: bool, c: f32) {
        let len = x.len() as isize;
        for i in 0..x.len() {
            let odd = (i + phase) % 2 == 1;
            if odd == odd_targets {
                let l = x[reflect(i as isize - 1, len)];
                let r = x[reflect(i as isize + 1, len)];
                x[i] += c * (l + r);
            }
        }
    }

    pub fn forward_line(x: &mut [f32], odd_start: bool) {
        let len = x.len();
        if len == 0 {
            return;
        }
        if len == 1 {
            if odd_start {
                x[0] *= 2.0;
            }
            return;
        }
        let phase = usize::from(odd_start);
        Self::lift(x, phase, true, Self::ALPHA);
        Self::lift(x, phase, false, Self::BETA);
        Self::lift(x, phase, true, Self::GAMMA);
        Self::lift(x, phase, false, Self::DELTA);
        for (i, v) in x.iter_mut().enumerate() {
            if (i + phase) % 2 == 0 {
                *v *= Self::INV_K;
            } else {
                *v *= Self::K;
            }
        }
    }

    pub fn inverse_line(x: &mut [f32], odd_start: bool) {
        let len = x.len();
        if len == 0 {
            return;
        }
        if len == 1 {
            if odd_start {
                x[0] *= 0.5;
            }
            return;
        }
        let phase = usize::from(odd_start);
        for (i, v) in x.iter_mut().enumerate() {
            if (i + phase) % 2 == 0 {
                *v *= Self::K;
            } else {
                *v *= Self::INV_K;
            }
        }
        Self::lift(x, phase, false, -Self::DELTA);
        Self::lift(x, phase, true, -Self::GAMMA);
        Self::lift(x, phase, false, -Self::BETA);
        Self::lift(x, phase, true, -Self::ALPHA);
    }
}

/// One lifting step of an arbitrary two-tap symmetric kernel:
/// `x[i] += coeff * (x[i-1] + x[i+1])` at odd or even absolute positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiftingStep {
    pub coeff: f32,
    pub on_odd: bool,
}

/// A user-defined lifting kernel (arbitrary decomposition styles). The
/// 5/3 and 9/7 filters are expressible here; the dedicated fast paths
/// above are what the codec pipeline dispatches to.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftingKernel {
    pub steps: Vec<LiftingStep>,
    pub scale_low: f32,
    pub scale_high: f32,
}

impl LiftingKernel {
    pub fn irreversible_97() -> Self {
        Self {
            steps: vec![
                LiftingStep { coeff: Dwt97::ALPHA, on_odd: true },
                LiftingStep { coeff: Dwt97::BETA, on_odd: false },
                LiftingStep { coeff: Dwt97::GAMMA, on_odd: true },
                LiftingStep { coeff: Dwt97::DELTA, on_odd: false },
            ],
            scale_low: Dwt97::INV_K,
            scale_high: Dwt97::K,
        }
    }

    pub fn forward_line(&self, x: &mut [f32], odd_start: bool) {
        if x.len() <= 1 {
            return;
        }
        let phase = usize::from(odd_start);
        for step in &self.steps {
            Dwt97::lift(x, phase, step.on_odd, step.coeff);
        }
        for (i, v) in x.iter_mut().enumerate() {
            if (i + phase) % 2 == 0 {
                *v *= self.scale_low;
            } else {
                *v *= self.scale_high;
            }
        }
    }

    pub fn inverse_line(&self, x: &mut [f32], odd_start: bool) {
        if x.len() <= 1 {
            return;
        }
        let phase = usize::from(odd_start);
        for (i, v) in x.iter_mut().enumerate() {
            if (i + phase) % 2 == 0 {
                *v /= self.scale_low;
            } else {
                *v /= self.scale_high;
            }
        }
        for step in self.steps.iter().rev() {
            Dwt97::lift(x, phase, step.on_odd, -step.coeff);
        }
    }
}

/// Level-by-level dimensions of a multi-level decomposition of the
/// absolute interval `[o, o + n)`: returns (origin, length) per level,
/// level 0 first (the full interval).
pub fn level_intervals(o: u32, n: u32, levels: u8) -> Vec<(u32, u32)> {
    let mut v = Vec::with_capacity(levels as usize + 1);
    let (mut o, mut n) = (o, n);
    v.push((o, n));
    for _ in 0..levels {
        let end = o + n;
        let no = o.div_ceil(2);
        n = end.div_ceil(2) - no;
        o = no;
        v.push((o, n));
    }
    v
}

macro_rules! separable_2d {
    ($name:ident, $inv_name:ident, $ty:ty, $fwd_line:path, $inv_line:path) => {
        /// Multi-level forward transform over a `w x h` buffer whose
        /// top-left sample sits at absolute grid position `(x0, y0)`.
        /// After each level the low-pass quadrant occupies the top-left
        /// and is the input of the next level.
        pub fn $name(buf: &mut [$ty], w: usize, h: usize, x0: u32, y0: u32, levels: u8) {
            let mut cw = w;
            let mut ch = h;
            let mut cx0 = x0;
            let mut cy0 = y0;
            let mut line: Vec<$ty> = Vec::new();
            for _ in 0..levels {
                if cw == 0 || ch == 0 {
                    break;
                }
                let odd_x = cx0 % 2 == 1;
                let odd_y = cy0 % 2 == 1;
                // Horizontal pass, per row: lift then deinterleave into
                // [low | high].
                for row in 0..ch {
                    line.clear();
                    line.extend_from_slice(&buf[row * w..row * w + cw]);
                    $fwd_line(&mut line, odd_x);
                    let mut li = 0;
                    let mut hi = crate::geometry::low_count(cx0, cx0 + cw as u32) as usize;
                    for (i, &v) in line.iter().enumerate() {
                        if (cx0 as usize + i) % 2 == 0 {
                            buf[row * w + li] = v;
                            li += 1;
                        } else {
                            buf[row * w + hi] = v;
                            hi += 1;
                        }
                    }
                }
                // Vertical pass, per column.
                for col in 0..cw {
                    line.clear();
                    for row in 0..ch {
                        line.push(buf[row * w + col]);
                    }
                    $fwd_line(&mut line, odd_y);
                    let mut li = 0;
                    let mut hi = crate::geometry::low_count(cy0, cy0 + ch as u32) as usize;
                    for (i, &v) in line.iter().enumerate() {
                        if (cy0 as usize + i) % 2 == 0 {
                            buf[li * w + col] = v;
                            li += 1;
                        } else {
                            buf[hi * w + col] = v;
                            hi += 1;
                        }
                    }
                }
                let nx0 = cx0.div_ceil(2);
                let ny0 = cy0.div_ceil(2);
                cw = crate::geometry::low_count(cx0, cx0 + cw as u32) as usize;
                ch = crate::geometry::low_count(cy0, cy0 + ch as u32) as usize;
                cx0 = nx0;
                cy0 = ny0;
            }
        }

        /// Multi-level inverse of the forward transform above.
        pub fn $inv_name(buf: &mut [$ty], w: usize, h: usize, x0: u32, y0: u32, levels: u8) {
            // Recompute the per-level geometry, then undo levels deepest
            // first.
            let mut dims = Vec::new();
            let (mut cw, mut ch, mut cx0, mut cy0) = (w, h, x0, y0);
            for _ in 0..levels {
                if cw == 0 || ch == 0 {
                    break;
                }
                dims.push((cw, ch, cx0, cy0));
                let nx0 = cx0.div_ceil(2);
                let ny0 = cy0.div_ceil(2);
                cw = crate::geometry::low_count(cx0, cx0 + cw as u32) as usize;
                ch = crate::geometry::low_count(cy0, cy0 + ch as u32) as usize;
                cx0 = nx0;
                cy0 = ny0;
            }
            let mut line: Vec<$ty> = Vec::new();
            for &(cw, ch, cx0, cy0) in dims.iter().rev() {
                let odd_x = cx0 % 2 == 1;
                let odd_y = cy0 % 2 == 1;
                // Vertical pass, per column: interleave then lift.
                for col in 0..cw {
                    line.clear();
                    line.resize(ch, Default::default());
                    let mut li = 0;
                    let mut hi = crate::geometry::low_count(cy0, cy0 + ch as u32) as usize;
                    for (i, slot) in line.iter_mut().enumerate() {
                        if (cy0 as usize + i) % 2 == 0 {
                            *slot = buf[li * w + col];
                            li += 1;
                        } else {
                            *slot = buf[hi * w + col];
                            hi += 1;
                        }
                    }
                    $inv_line(&mut line, odd_y);
                    for (row, &v) in line.iter().enumerate() {
                        buf[row * w + col] = v;
                    }
                }
                // Horizontal pass, per row.
                for row in 0..ch {
                    line.clear();
                    line.resize(cw, Default::default());
                    let mut li = 0;
                    let mut hi = crate::geometry::low_count(cx0, cx0 + cw as u32) as usize;
                    for (i, slot) in line.iter_mut().enumerate() {
                        if (cx0 as usize + i) % 2 == 0 {
                            *slot = buf[row * w + li];
                            li += 1;
                        } else {
                            *slot = buf[row * w + hi];
                            hi += 1;
                        }
                    }
                    $inv_line(&mut line, odd_x);
                    buf[row * w..row * w + cw].copy_from_slice(&line);
                }
            }
        }
    };
}

separable_2d!(
    forward_2d_53,
    inverse_2d_53,
    i32,
    Dwt53::forward_line,
    Dwt53::inverse_line
);
separable_2d!(
    forward_2d_97,
    inverse_2d_97,
    f32,
    Dwt97::forward_line,
    Dwt97::inverse_line
);
