//! Planar image representation shared by the encoder input and decoder
//! output surfaces.

use crate::error::J2kError;

/// Per-component signalled properties (Ssiz / XRsiz / YRsiz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Bit depth, 1..=38.
    pub bit_depth: u8,
    pub signed: bool,
    /// Horizontal and vertical subsampling on the reference grid.
    pub dx: u8,
    pub dy: u8,
}

impl ComponentInfo {
    pub fn new(bit_depth: u8, signed: bool) -> Self {
        Self {
            bit_depth,
            signed,
            dx: 1,
            dy: 1,
        }
    }
}

/// A planar pixel buffer: one row-major `i32` plane per component, each on
/// its own subsampled grid. Samples of unsigned components occupy
/// `0..2^bit_depth`; signed components use two's-complement values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub components: Vec<ComponentInfo>,
    pub planes: Vec<Vec<i32>>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, components: Vec<ComponentInfo>) -> Self {
        let planes = components
            .iter()
            .map(|c| {
                let w = width.div_ceil(c.dx as u32) as usize;
                let h = height.div_ceil(c.dy as u32) as usize;
                vec![0i32; w * h]
            })
            .collect();
        Self {
            width,
            height,
            components,
            planes,
        }
    }

    pub fn new_gray(width: u32, height: u32, bit_depth: u8) -> Self {
        Self::new(width, height, vec![ComponentInfo::new(bit_depth, false)])
    }

    pub fn new_rgb(width: u32, height: u32, bit_depth: u8) -> Self {
        Self::new(
            width,
            height,
            vec![ComponentInfo::new(bit_depth, false); 3],
        )
    }

    /// Width of a component's sampled grid.
    pub fn comp_width(&self, c: usize) -> u32 {
        self.width.div_ceil(self.components[c].dx as u32)
    }

    pub fn comp_height(&self, c: usize) -> u32 {
        self.height.div_ceil(self.components[c].dy as u32)
    }

    pub fn validate(&self) -> Result<(), J2kError> {
        if self.width == 0 || self.height == 0 {
            return Err(J2kError::InvalidConfiguration(
                "image dimensions must be non-zero".into(),
            ));
        }
        if self.components.is_empty() || self.components.len() > 16384 {
            return Err(J2kError::InvalidConfiguration(format!(
                "component count {} out of range 1..=16384",
                self.components.len()
            )));
        }
        for (i, c) in self.components.iter().enumerate() {
            if c.bit_depth == 0 || c.bit_depth > 38 {
                return Err(J2kError::InvalidConfiguration(format!(
                    "component {i}: bit depth {} out of range 1..=38",
                    c.bit_depth
                )));
            }
            if c.dx == 0 || c.dy == 0 {
                return Err(J2kError::InvalidConfiguration(format!(
                    "component {i}: zero subsampling factor"
                )));
            }
            let expected = self.comp_width(i) as usize * self.comp_height(i) as usize;
            if self.planes[i].len() != expected {
                return Err(J2kError::InvalidConfiguration(format!(
                    "component {i}: plane holds {} samples, expected {expected}",
                    self.planes[i].len()
                )));
            }
        }
        Ok(())
    }
}

/// Decoded-quality metadata returned alongside the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeMeta {
    /// Quality layers actually applied.
    pub layers: u16,
    /// Resolution level reconstructed (N = full size).
    pub resolution: u8,
    /// True when the input ended before the codestream did.
    pub truncated: bool,
}

/// Decoder output: pixels plus how much of the stream produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub image: ImageBuffer,
    pub meta: DecodeMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsampled_plane_dims() {
        let mut comps = vec![ComponentInfo::new(8, false); 3];
        comps[1].dx = 2;
        comps[1].dy = 2;
        let img = ImageBuffer::new(65, 33, comps);
        assert_eq!(img.comp_width(0), 65);
        assert_eq!(img.comp_width(1), 33);
        assert_eq!(img.comp_height(1), 17);
        assert!(img.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_depth() {
        let mut img = ImageBuffer::new_gray(4, 4, 8);
        img.components[0].bit_depth = 39;
        assert!(img.validate().is_err());
    }
}
