//! Post-compression rate-distortion optimization (PCRD-opt).
//!
//! Every code-block contributes an ordered list of candidate truncation
//! points (cumulative rate, cumulative distortion reduction). Truncation
//! is restricted to the convex hull of those points; a global Lagrangian
//! threshold lambda then selects, per block, the deepest hull point whose
//! distortion-rate slope still exceeds lambda. Lambda is bisected until
//! the layer's byte budget binds. Layers reuse the same machinery with
//! growing budgets, so per-block truncation points are monotone across
//! layers by construction.

use crate::bit_plane_coder::PassInfo;

#[derive(Debug, Clone, Copy)]
struct HullPoint {
    passes: u32,
    rate: usize,
    dist: f64,
    slope: f64,
}

/// Convex-hull truncation candidates of one block.
#[derive(Debug, Clone, Default)]
pub struct BlockHull {
    points: Vec<HullPoint>,
}

impl BlockHull {
    pub fn from_passes(passes: &[PassInfo]) -> Self {
        let mut points: Vec<HullPoint> = Vec::new();
        for (i, p) in passes.iter().enumerate() {
            let candidate = HullPoint {
                passes: i as u32 + 1,
                rate: p.rate,
                dist: p.distortion,
                slope: 0.0,
            };
            // Drop candidates that add no rate and no distortion, then
            // restore convexity by popping points with flatter slopes.
            let (mut pr, mut pd) = (0usize, 0f64);
            if let Some(last) = points.last() {
                pr = last.rate;
                pd = last.dist;
            }
            if candidate.rate <= pr {
                if candidate.dist > pd {
                    points.pop();
                } else {
                    continue;
                }
            }
            let mut cand = candidate;
            loop {
                let (pr, pd) = match points.last() {
                    Some(last) => (last.rate, last.dist),
                    None => (0, 0.0),
                };
                let dr = cand.rate.saturating_sub(pr).max(1) as f64;
                cand.slope = (cand.dist - pd) / dr;
                match points.last() {
                    Some(last) if last.slope <= cand.slope => {
                        points.pop();
                    }
                    _ => break,
                }
            }
            if cand.slope > 0.0 {
                points.push(cand);
            }
        }
        Self { points }
    }

    /// Truncation selected by a slope threshold: the deepest hull point
    /// whose slope is at least lambda.
    fn select(&self, lambda: f64) -> Option<HullPoint> {
        self.points
            .iter()
            .take_while(|p| p.slope >= lambda)
            .last()
            .copied()
    }

    pub fn max_passes(&self) -> u32 {
        self.points.last().map(|p| p.passes).unwrap_or(0)
    }

    pub fn total_rate(&self) -> usize {
        self.points.last().map(|p| p.rate).unwrap_or(0)
    }

    pub fn max_slope(&self) -> f64 {
        self.points.first().map(|p| p.slope).unwrap_or(0.0)
    }

    /// True when every point lies on a strictly decreasing slope chain;
    /// the invariant the selection logic relies on.
    pub fn is_convex(&self) -> bool {
        self.points.windows(2).all(|w| w[1].slope < w[0].slope)
    }
}

/// Per-layer byte budgets for the block contributions (headers already
/// subtracted); `None` means "no constraint".
pub fn allocate_layers(
    hulls: &[BlockHull],
    budgets: &[Option<usize>],
    per_block_overhead: usize,
) -> Vec<Vec<u32>> {
    let mut cuts: Vec<Vec<u32>> = vec![Vec::with_capacity(budgets.len()); hulls.len()];
    let mut floor: Vec<u32> = vec![0; hulls.len()];

    for &budget in budgets {
        match budget {
            None => {
                for (k, hull) in hulls.iter().enumerate() {
                    let n = hull.max_passes().max(floor[k]);
                    floor[k] = n;
                    cuts[k].push(n);
                }
            }
            Some(budget) => {
                let total = |lambda: f64| -> usize {
                    let mut sum = 0usize;
                    for (k, hull) in hulls.iter().enumerate() {
                        let sel = hull.select(lambda);
                        let (passes, rate) = match sel {
                            Some(p) => (p.passes, p.rate),
                            None => (0, 0),
                        };
                        let passes = passes.max(floor[k]);
                        let rate = if passes > 0 {
                            rate.max(rate_of(hull, floor[k]))
                        } else {
                            0
                        };
                        if passes > 0 {
                            sum += rate + per_block_overhead;
                        }
                    }
                    sum
                };

                let mut lo = 0.0f64;
                let mut hi = hulls
                    .iter()
                    .map(|h| h.max_slope())
                    .fold(0.0f64, f64::max)
                    * 2.0
                    + 1.0;
                // Bisect lambda: high lambda keeps few passes (low rate).
                for _ in 0..60 {
                    let mid = 0.5 * (lo + hi);
                    if total(mid) > budget {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                let lambda = if total(hi) <= budget { hi } else { f64::INFINITY };
                for (k, hull) in hulls.iter().enumerate() {
                    let n = hull
                        .select(lambda)
                        .map(|p| p.passes)
                        .unwrap_or(0)
                        .max(floor[k]);
                    floor[k] = n;
                    cuts[k].push(n);
                }
            }
        }
    }
    cuts
}

fn rate_of(hull: &BlockHull, passes: u32) -> usize {
    hull.points
        .iter()
        .filter(|p| p.passes <= passes)
        .next_back()
        .map(|p| p.rate)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_plane_coder::PassType;

    fn passes(pairs: &[(usize, f64)]) -> Vec<PassInfo> {
        pairs
            .iter()
            .map(|&(rate, distortion)| PassInfo {
                pass_type: PassType::Cleanup,
                plane: 0,
                rate,
                distortion,
                terminated: false,
            })
            .collect()
    }

    #[test]
    fn test_hull_prunes_non_convex_points() {
        // The middle point has a flatter slope than its successor and
        // must fall off the hull.
        let p = passes(&[(10, 100.0), (20, 105.0), (30, 200.0)]);
        let hull = BlockHull::from_passes(&p);
        assert!(hull.is_convex());
        assert_eq!(hull.max_passes(), 3);
        assert_eq!(hull.points.len(), 2);
    }

    #[test]
    fn test_hull_ignores_zero_gain_passes() {
        let p = passes(&[(10, 50.0), (10, 50.0), (15, 60.0)]);
        let hull = BlockHull::from_passes(&p);
        assert!(hull.is_convex());
    }

    #[test]
    fn test_allocation_respects_budget() {
        let hulls: Vec<BlockHull> = (0..8)
            .map(|i| {
                BlockHull::from_passes(&passes(&[
                    (10, 1000.0 / (i + 1) as f64),
                    (25, 1400.0 / (i + 1) as f64),
                    (60, 1600.0 / (i + 1) as f64),
                ]))
            })
            .collect();
        let budget = 200;
        let cuts = allocate_layers(&hulls, &[Some(budget)], 2);
        let mut spent = 0;
        for (hull, c) in hulls.iter().zip(&cuts) {
            if c[0] > 0 {
                spent += rate_of(hull, c[0]) + 2;
            }
        }
        assert!(spent <= budget, "spent {spent} of {budget}");
        assert!(spent > 0);
    }

    #[test]
    fn test_layers_are_monotone() {
        let hulls: Vec<BlockHull> = (0..4)
            .map(|i| {
                BlockHull::from_passes(&passes(&[
                    (100, 900.0 * (i + 1) as f64),
                    (220, 1300.0 * (i + 1) as f64),
                    (400, 1500.0 * (i + 1) as f64),
                ]))
            })
            .collect();
        let cuts = allocate_layers(&hulls, &[Some(300), Some(800), None], 2);
        for c in &cuts {
            assert_eq!(c.len(), 3);
            assert!(c[0] <= c[1] && c[1] <= c[2], "{c:?}");
            assert_eq!(c[2], 3);
        }
    }

    #[test]
    fn test_unconstrained_layer_takes_everything() {
        let hulls = vec![BlockHull::from_passes(&passes(&[(5, 10.0), (9, 12.0)]))];
        let cuts = allocate_layers(&hulls, &[None], 0);
        assert_eq!(cuts[0], vec![2]);
    }
}
