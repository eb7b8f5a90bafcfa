//! JPEG 2000 marker codes (ISO/IEC 15444-1 Annex A, 15444-15 Annex A).
//!
//! Markers are two big-endian bytes, the first always 0xFF. All markers
//! except SOC, SOD, SOP, EPH and EOC are followed by a 16-bit segment
//! length that counts the length field itself but not the marker.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MarkerCode {
    /// SOC: start of codestream.
    StartOfCodestream = 0xFF4F,
    /// CAP: extended capability (Part 15).
    Capability = 0xFF50,
    /// SIZ: image and tile size.
    ImageAndTileSize = 0xFF51,
    /// COD: coding style default.
    CodingStyleDefault = 0xFF52,
    /// COC: coding style component.
    CodingStyleComponent = 0xFF53,
    /// TLM: tile-part lengths.
    TilePartLengths = 0xFF55,
    /// PLM: packet lengths, main header.
    PacketLengthMain = 0xFF57,
    /// PLT: packet lengths, tile-part header.
    PacketLengthTilePart = 0xFF58,
    /// CPF: corresponding profile (Part 15).
    CorrespondingProfile = 0xFF59,
    /// QCD: quantization default.
    QuantizationDefault = 0xFF5C,
    /// QCC: quantization component.
    QuantizationComponent = 0xFF5D,
    /// RGN: region of interest.
    RegionOfInterest = 0xFF5E,
    /// POC: progression order change.
    ProgressionOrderChange = 0xFF5F,
    /// PPM: packed packet headers, main header.
    PackedPacketHeadersMain = 0xFF60,
    /// PPT: packed packet headers, tile-part header.
    PackedPacketHeadersTilePart = 0xFF61,
    /// CRG: component registration.
    ComponentRegistration = 0xFF63,
    /// COM: comment.
    Comment = 0xFF64,
    /// SOT: start of tile-part.
    StartOfTile = 0xFF90,
    /// SOP: start of packet.
    StartOfPacket = 0xFF91,
    /// EPH: end of packet header.
    EndOfPacketHeader = 0xFF92,
    /// SOD: start of data.
    StartOfData = 0xFF93,
    /// EOC: end of codestream.
    EndOfCodestream = 0xFFD9,
}

impl MarkerCode {
    /// Markers that stand alone, without a length-prefixed segment body.
    pub fn is_delimiter(self) -> bool {
        matches!(
            self,
            Self::StartOfCodestream
                | Self::EndOfPacketHeader
                | Self::StartOfData
                | Self::EndOfCodestream
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(u16::from(MarkerCode::StartOfCodestream), 0xFF4F);
        assert_eq!(u16::from(MarkerCode::ImageAndTileSize), 0xFF51);
        assert_eq!(u16::from(MarkerCode::StartOfTile), 0xFF90);
        assert_eq!(u16::from(MarkerCode::EndOfCodestream), 0xFFD9);
    }

    #[test]
    fn test_try_from_unknown_marker() {
        assert!(MarkerCode::try_from(0xFF00u16).is_err());
        assert_eq!(
            MarkerCode::try_from(0xFF50u16).unwrap(),
            MarkerCode::Capability
        );
    }
}
