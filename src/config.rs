//! Encoder and decoder configuration.
//!
//! `EncodeParams` mirrors the signalled coding parameters (COD, QCD, CAP)
//! plus the rate-control targets; `DecodeParams` constrains how much of a
//! codestream is reconstructed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::J2kError;

/// Packet progression order (ISO/IEC 15444-1 B.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProgressionOrder {
    /// Layer - resolution - component - position: progressive by quality.
    #[default]
    Lrcp = 0,
    /// Resolution - layer - component - position.
    Rlcp = 1,
    /// Resolution - position - component - layer.
    Rpcl = 2,
    /// Position - component - resolution - layer.
    Pcrl = 3,
    /// Component - position - resolution - layer.
    Cprl = 4,
}

impl ProgressionOrder {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Lrcp),
            1 => Some(Self::Rlcp),
            2 => Some(Self::Rpcl),
            3 => Some(Self::Pcrl),
            4 => Some(Self::Cprl),
            _ => None,
        }
    }
}

/// Wavelet filter selection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WaveletFilter {
    /// 5/3 integer lifting; reversible.
    #[default]
    Reversible53,
    /// 9/7 float lifting; irreversible.
    Irreversible97,
    /// User-supplied lifting kernel. Recognized but not signallable in a
    /// Part 1 codestream; encode rejects it with `UnsupportedFeature`.
    Arbitrary(crate::dwt::LiftingKernel),
}

/// Quantization style (Sqcd / Sqcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QuantizationStyle {
    /// No quantization; reversible path.
    #[default]
    None = 0,
    /// One base step size, others derived from decomposition level.
    ScalarDerived = 1,
    /// One explicit step size per subband.
    ScalarExpounded = 2,
}

bitflags! {
    /// Code-block coding style flags (SPcod byte, ISO 15444-1 Table A.19
    /// with the Part 15 HT bits from 15444-15 Table 5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CblkStyle: u8 {
        const SELECTIVE_BYPASS         = 0x01;
        const RESET_CONTEXT            = 0x02;
        const TERMINATION_ON_EACH_PASS = 0x04;
        const VERTICALLY_CAUSAL        = 0x08;
        const PREDICTABLE_TERMINATION  = 0x10;
        const SEGMENTATION_SYMBOLS     = 0x20;
        const HT_FAST                  = 0x40;
        const HT_ONLY                  = 0x80;
    }
}

bitflags! {
    /// Coding style flags (Scod byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodingStyle: u8 {
        const PRECINCTS_DEFINED = 0x01;
        const USE_SOP           = 0x02;
        const USE_EPH           = 0x04;
    }
}

/// Multi-component transform applied to the first three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorTransform {
    #[default]
    None,
    /// Integer RCT; pairs with the 5/3 filter.
    ReversibleRct,
    /// Float ICT (YCbCr); pairs with the 9/7 filter.
    IrreversibleIct,
}

/// Tier-1 coder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HtMode {
    /// Legacy EBCOT unless the codestream demands otherwise.
    #[default]
    Auto,
    /// Force EBCOT (Part 1).
    Legacy,
    /// HT code-blocks, EBCOT permitted per block (HT_FAST).
    Ht,
    /// Every code-block HT coded (HT_ONLY).
    HtOnly,
}

/// Part 15 profile signalled through CPF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum CpfProfile {
    #[default]
    Htj2kMain = 0,
    Htj2kRestricted = 1,
}

/// Per-layer rate target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerTarget {
    /// Total codestream bytes through this layer.
    Bytes(usize),
    /// Bits per pixel of the reference grid through this layer.
    BitsPerPixel(f64),
    /// No constraint: include every remaining coding pass.
    Any,
}

/// Region-of-interest parameters (RGN, max-shift method).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiParams {
    pub component: u16,
    /// SPrgn: binary shift applied to background coefficients.
    pub shift: u8,
}

/// Cooperative cancellation handle, polled at stage boundaries and
/// between code-blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), J2kError> {
        if self.is_cancelled() {
            Err(J2kError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Encoder configuration.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Tile dimensions on the reference grid; 0 means a single tile
    /// covering the whole image.
    pub tile_width: u32,
    pub tile_height: u32,
    /// DWT decomposition levels, 0..=32.
    pub decomposition_levels: u8,
    /// log2 of code-block width and height, each 2..=10.
    pub cblk_width_exp: u8,
    pub cblk_height_exp: u8,
    pub progression: ProgressionOrder,
    /// One target per quality layer, outermost last. Empty means a single
    /// unconstrained layer.
    pub layer_targets: Vec<LayerTarget>,
    pub filter: WaveletFilter,
    pub color_transform: ColorTransform,
    pub ht: HtMode,
    pub cblk_style: CblkStyle,
    /// Per-resolution precinct exponents (PPx, PPy), resolution 0 first.
    /// None selects the maximal 2^15 precinct.
    pub precinct_exps: Option<Vec<(u8, u8)>>,
    pub quant_style: QuantizationStyle,
    /// Base quantization step for the irreversible path, expressed as a
    /// fraction of the nominal dynamic range.
    pub base_step: f64,
    pub guard_bits: u8,
    pub roi: Option<RoiParams>,
    /// Profile declared through CPF when HT coding is selected.
    pub cpf_profile: CpfProfile,
    pub use_sop: bool,
    pub use_eph: bool,
    /// Main-header comment; written as a COM segment.
    pub comment: Option<String>,
    pub cancel: CancelToken,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            tile_width: 0,
            tile_height: 0,
            decomposition_levels: 5,
            cblk_width_exp: 6,
            cblk_height_exp: 6,
            progression: ProgressionOrder::Lrcp,
            layer_targets: vec![LayerTarget::Any],
            filter: WaveletFilter::Reversible53,
            color_transform: ColorTransform::None,
            ht: HtMode::Auto,
            cblk_style: CblkStyle::empty(),
            precinct_exps: None,
            quant_style: QuantizationStyle::None,
            base_step: 1.0 / 256.0,
            guard_bits: 2,
            roi: None,
            cpf_profile: CpfProfile::Htj2kMain,
            use_sop: false,
            use_eph: false,
            comment: None,
            cancel: CancelToken::new(),
        }
    }
}

impl EncodeParams {
    /// A lossless configuration: 5/3, reversible quantization, RCT off.
    pub fn lossless() -> Self {
        Self::default()
    }

    /// A lossy configuration: 9/7, expounded quantization.
    pub fn lossy() -> Self {
        Self {
            filter: WaveletFilter::Irreversible97,
            quant_style: QuantizationStyle::ScalarExpounded,
            ..Self::default()
        }
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.filter, WaveletFilter::Reversible53)
    }

    pub fn uses_ht(&self) -> bool {
        matches!(self.ht, HtMode::Ht | HtMode::HtOnly)
    }

    pub fn num_layers(&self) -> u16 {
        self.layer_targets.len().max(1) as u16
    }

    /// Range and consistency checks, applied synchronously at encode setup.
    pub fn validate(&self, num_components: usize) -> Result<(), J2kError> {
        if let WaveletFilter::Arbitrary(_) = self.filter {
            return Err(J2kError::UnsupportedFeature(
                "arbitrary wavelet kernels cannot be signalled in a Part 1 codestream".into(),
            ));
        }
        if self.decomposition_levels > 32 {
            return Err(J2kError::InvalidConfiguration(format!(
                "decomposition levels {} out of range 0..=32",
                self.decomposition_levels
            )));
        }
        let (wx, wy) = (self.cblk_width_exp, self.cblk_height_exp);
        if !(2..=10).contains(&wx) || !(2..=10).contains(&wy) {
            return Err(J2kError::InvalidConfiguration(format!(
                "code-block exponents ({wx}, {wy}) out of range 2..=10"
            )));
        }
        let area_limit = if self.uses_ht() { 14 } else { 12 };
        if wx + wy > area_limit {
            return Err(J2kError::InvalidConfiguration(format!(
                "code-block area 2^{} exceeds the 2^{area_limit} limit",
                wx + wy
            )));
        }
        if self.guard_bits > 7 {
            return Err(J2kError::InvalidConfiguration(
                "guard bits out of range 0..=7".into(),
            ));
        }
        if self.layer_targets.is_empty() {
            return Err(J2kError::InvalidConfiguration(
                "at least one quality layer is required".into(),
            ));
        }
        if self.layer_targets.len() > 65535 {
            return Err(J2kError::InvalidConfiguration(
                "more than 65535 quality layers".into(),
            ));
        }
        if self.color_transform != ColorTransform::None && num_components < 3 {
            return Err(J2kError::InvalidConfiguration(
                "color transform requires at least three components".into(),
            ));
        }
        if self.color_transform == ColorTransform::ReversibleRct && !self.is_reversible() {
            return Err(J2kError::InvalidConfiguration(
                "RCT requires the reversible 5/3 filter".into(),
            ));
        }
        if self.color_transform == ColorTransform::IrreversibleIct && self.is_reversible() {
            return Err(J2kError::InvalidConfiguration(
                "ICT requires the irreversible 9/7 filter".into(),
            ));
        }
        if self.is_reversible() && self.quant_style != QuantizationStyle::None {
            return Err(J2kError::InvalidConfiguration(
                "reversible filter requires quantization style None".into(),
            ));
        }
        if !self.is_reversible() && self.quant_style == QuantizationStyle::None {
            return Err(J2kError::InvalidConfiguration(
                "irreversible filter requires a scalar quantization style".into(),
            ));
        }
        if let Some(exps) = &self.precinct_exps {
            if exps.len() != self.decomposition_levels as usize + 1 {
                return Err(J2kError::InvalidConfiguration(format!(
                    "{} precinct sizes signalled for {} resolutions",
                    exps.len(),
                    self.decomposition_levels + 1
                )));
            }
            for &(px, py) in exps {
                if px > 15 || py > 15 || px == 0 || py == 0 {
                    return Err(J2kError::InvalidConfiguration(format!(
                        "precinct exponents ({px}, {py}) out of range 1..=15"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The code-block style byte written to COD, including the HT bits.
    pub fn wire_cblk_style(&self) -> CblkStyle {
        let mut style = self.cblk_style;
        style.remove(CblkStyle::HT_FAST | CblkStyle::HT_ONLY);
        match self.ht {
            HtMode::Auto | HtMode::Legacy => {}
            HtMode::Ht => style.insert(CblkStyle::HT_FAST),
            HtMode::HtOnly => style.insert(CblkStyle::HT_FAST | CblkStyle::HT_ONLY),
        }
        style
    }
}

/// Decoder constraints; the default reconstructs everything present.
#[derive(Debug, Clone, Default)]
pub struct DecodeParams {
    /// Highest resolution level to reconstruct; `None` means full size.
    pub max_resolution: Option<u8>,
    /// Quality layers to apply; `None` means all.
    pub max_layers: Option<u16>,
    /// Component subset to return; `None` means all components.
    pub components: Option<Vec<u16>>,
    /// Spatial region of interest on the reference grid (x0, y0, x1, y1);
    /// the decoded image is cropped to it.
    pub region: Option<(u32, u32, u32, u32)>,
    pub cancel: CancelToken,
}
