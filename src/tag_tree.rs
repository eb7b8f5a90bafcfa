//! Tag trees (ISO/IEC 15444-1 B.10.2).
//!
//! A tag tree encodes a 2-D grid of non-negative integers; every internal
//! node holds the minimum of its children. Queries are lower-bound
//! refinements against a threshold, so values emerge progressively as
//! thresholds grow across layers. Nodes live in flat per-level arrays
//! indexed by grid coordinates; parents are index arithmetic, not
//! pointers.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::J2kError;

const UNSET: u32 = u32::MAX;

struct Levels {
    /// (width, height, offset) per level, leaves first.
    dims: Vec<(u32, u32, usize)>,
    node_count: usize,
}

impl Levels {
    fn new(width: u32, height: u32) -> Self {
        let mut dims = Vec::new();
        let mut w = width.max(1);
        let mut h = height.max(1);
        let mut offset = 0;
        loop {
            dims.push((w, h, offset));
            offset += (w * h) as usize;
            if w == 1 && h == 1 {
                break;
            }
            w = w.div_ceil(2);
            h = h.div_ceil(2);
        }
        Self {
            dims,
            node_count: offset,
        }
    }

    fn node(&self, level: usize, x: u32, y: u32) -> usize {
        let (w, _, offset) = self.dims[level];
        offset + (y * w + x) as usize
    }

    /// Nodes from the root down to leaf (x, y).
    fn path(&self, x: u32, y: u32) -> Vec<usize> {
        (0..self.dims.len())
            .rev()
            .map(|l| self.node(l, x >> l, y >> l))
            .collect()
    }
}

pub struct TagTreeEncoder {
    levels: Levels,
    value: Vec<u32>,
    low: Vec<u32>,
    known: Vec<bool>,
}

impl TagTreeEncoder {
    pub fn new(width: u32, height: u32) -> Self {
        let levels = Levels::new(width, height);
        let n = levels.node_count;
        Self {
            levels,
            value: vec![UNSET; n],
            low: vec![0; n],
            known: vec![false; n],
        }
    }

    /// Set a leaf value. All leaves must be set before the first `encode`.
    pub fn set_value(&mut self, x: u32, y: u32, v: u32) {
        let leaf = self.levels.node(0, x, y);
        self.value[leaf] = v;
    }

    /// Propagate minima up the tree; call once after the leaves are set.
    pub fn reduce(&mut self) {
        for l in 1..self.levels.dims.len() {
            let (w, h, _) = self.levels.dims[l];
            let (cw, ch, _) = self.levels.dims[l - 1];
            for y in 0..h {
                for x in 0..w {
                    let mut m = UNSET;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let (cx, cy) = (2 * x + dx, 2 * y + dy);
                        if cx < cw && cy < ch {
                            m = m.min(self.value[self.levels.node(l - 1, cx, cy)]);
                        }
                    }
                    let ni = self.levels.node(l, x, y);
                    self.value[ni] = m;
                }
            }
        }
    }

    /// Emit the bits that refine leaf (x, y) up to `threshold`. Calls with
    /// growing thresholds continue where the previous one stopped.
    pub fn encode(&mut self, bio: &mut BitWriter, x: u32, y: u32, threshold: u32) {
        let mut low = 0u32;
        for ni in self.levels.path(x, y) {
            if low > self.low[ni] {
                self.low[ni] = low;
            } else {
                low = self.low[ni];
            }
            while low < threshold {
                if low >= self.value[ni] {
                    if !self.known[ni] {
                        bio.write_bit(1);
                        self.known[ni] = true;
                    }
                    break;
                }
                bio.write_bit(0);
                low += 1;
            }
            self.low[ni] = low;
        }
    }
}

pub struct TagTreeDecoder {
    levels: Levels,
    value: Vec<u32>,
    low: Vec<u32>,
}

impl TagTreeDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        let levels = Levels::new(width, height);
        let n = levels.node_count;
        Self {
            levels,
            value: vec![UNSET; n],
            low: vec![0; n],
        }
    }

    /// Consume refinement bits for leaf (x, y) up to `threshold`; returns
    /// whether the leaf value is now known to be below it.
    pub fn decode(
        &mut self,
        bio: &mut BitReader,
        x: u32,
        y: u32,
        threshold: u32,
    ) -> Result<bool, J2kError> {
        let path = self.levels.path(x, y);
        let mut low = 0u32;
        let mut leaf = 0;
        for &ni in &path {
            leaf = ni;
            if low > self.low[ni] {
                self.low[ni] = low;
            } else {
                low = self.low[ni];
            }
            while low < threshold {
                if low >= self.value[ni] {
                    break;
                }
                if bio.read_bit()? == 1 {
                    self.value[ni] = low;
                } else {
                    low += 1;
                }
            }
            self.low[ni] = low;
        }
        Ok(self.value[leaf] < threshold)
    }

    /// Fully resolve the value at leaf (x, y) by raising the threshold
    /// until the tree commits to it.
    pub fn decode_value(
        &mut self,
        bio: &mut BitReader,
        x: u32,
        y: u32,
    ) -> Result<u32, J2kError> {
        let mut t = 1;
        while !self.decode(bio, x, y, t)? {
            t += 1;
            if t > 4096 {
                return Err(J2kError::malformed(0, "unbounded tag-tree value"));
            }
        }
        Ok(t - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The worked example of B.10.2, figure B.12: a 6x3 grid.
    const GRID: [[u32; 6]; 3] = [
        [1, 3, 2, 3, 2, 3],
        [2, 2, 1, 4, 3, 2],
        [2, 2, 2, 2, 1, 2],
    ];

    fn encode_grid() -> (TagTreeEncoder, Vec<u8>) {
        let mut enc = TagTreeEncoder::new(6, 3);
        for (y, row) in GRID.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                enc.set_value(x as u32, y as u32, v);
            }
        }
        enc.reduce();
        let mut bio = BitWriter::new();
        for y in 0..3u32 {
            for x in 0..6u32 {
                enc.encode(&mut bio, x, y, 6);
            }
        }
        let bytes = bio.finish_header();
        (enc, bytes)
    }

    #[test]
    fn test_roundtrip_full_values() {
        let (_, bytes) = encode_grid();
        let mut dec = TagTreeDecoder::new(6, 3);
        let mut bio = BitReader::new(&bytes);
        for y in 0..3u32 {
            for x in 0..6u32 {
                let v = dec.decode_value(&mut bio, x, y).unwrap();
                assert_eq!(v, GRID[y as usize][x as usize], "leaf ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_threshold_refinement_is_incremental() {
        // Raising the threshold layer by layer must consume the same bit
        // stream as resolving values outright.
        let mut enc = TagTreeEncoder::new(2, 2);
        for (i, v) in [0u32, 2, 1, 3].iter().enumerate() {
            enc.set_value((i % 2) as u32, (i / 2) as u32, *v);
        }
        enc.reduce();
        let mut bio = BitWriter::new();
        for t in 1..=4u32 {
            for y in 0..2 {
                for x in 0..2 {
                    enc.encode(&mut bio, x, y, t);
                }
            }
        }
        let bytes = bio.finish_header();

        let mut dec = TagTreeDecoder::new(2, 2);
        let mut bio = BitReader::new(&bytes);
        let mut resolved = [[None::<u32>; 2]; 2];
        for t in 1..=4u32 {
            for y in 0..2u32 {
                for x in 0..2u32 {
                    if dec.decode(&mut bio, x, y, t).unwrap()
                        && resolved[y as usize][x as usize].is_none()
                    {
                        resolved[y as usize][x as usize] = Some(t - 1);
                    }
                }
            }
        }
        assert_eq!(resolved[0][0], Some(0));
        assert_eq!(resolved[0][1], Some(2));
        assert_eq!(resolved[1][0], Some(1));
        assert_eq!(resolved[1][1], Some(3));
    }

    #[test]
    fn test_single_leaf_tree() {
        let mut enc = TagTreeEncoder::new(1, 1);
        enc.set_value(0, 0, 5);
        enc.reduce();
        let mut bio = BitWriter::new();
        enc.encode(&mut bio, 0, 0, 6);
        let bytes = bio.finish_header();
        let mut dec = TagTreeDecoder::new(1, 1);
        let mut bio = BitReader::new(&bytes);
        assert_eq!(dec.decode_value(&mut bio, 0, 0).unwrap(), 5);
    }
}
