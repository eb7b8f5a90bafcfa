/*!
# j2k-rs

`j2k-rs` is a pure Rust implementation of the JPEG 2000 codestream codec
core: ISO/IEC 15444-1 (Part 1) and the ISO/IEC 15444-15 (HTJ2K / Part 15)
block coder, plus a lossless transcoder between the two.

## Pipeline

- **Codestream**: marker-segment `parser` / `writer` (SOC, SIZ, COD, COC,
  QCD, QCC, CAP, CPF, RGN, SOT, SOD, EOC, ...).
- **Tier-2**: `packet` header coding over `tag_tree`s, the five
  progression orders in `progression`.
- **Tier-1**: EBCOT bit-plane coding over the `mq_coder`
  (`bit_plane_coder`), and the HT cleanup coder with its MEL, VLC and
  MagSgn sub-streams (`ht_block_coder`).
- **Transforms**: 5/3 and 9/7 lifting in `dwt`, scalar `quantization`,
  RCT/ICT and DC level shifting in `mct`.
- **Rate control**: PCRD-opt truncation-point selection in
  `rate_control`.

The encode and decode surfaces are planar `i32` pixel buffers
([`ImageBuffer`]); the codestream surface is a plain byte sequence.
Tiles run in parallel end-to-end, with code-blocks as a second
parallelism grain.

## Example

```
use j2k_rs::{decode, encode, DecodeParams, EncodeParams, ImageBuffer};

let mut image = ImageBuffer::new_gray(64, 64, 8);
for (i, p) in image.planes[0].iter_mut().enumerate() {
    *p = (i % 256) as i32;
}
let bytes = encode(&image, &EncodeParams::lossless()).unwrap();
let decoded = decode(&bytes, &DecodeParams::default()).unwrap();
assert_eq!(decoded.image.planes[0], image.planes[0]);
```
*/

pub mod bit_io;
pub mod bit_plane_coder;
pub mod config;
pub mod decoder;
pub mod dwt;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod ht_block_coder;
pub mod image;
pub mod marker_code;
pub mod mct;
pub mod mq_coder;
pub mod packet;
pub mod parser;
pub mod progression;
pub mod quantization;
pub mod rate_control;
pub mod stream_reader;
pub mod stream_writer;
pub mod tag_tree;
pub mod tile;
pub mod transcode;
pub mod writer;

pub use config::{
    CancelToken, CblkStyle, ColorTransform, CpfProfile, DecodeParams, EncodeParams, HtMode,
    LayerTarget, ProgressionOrder, QuantizationStyle, RoiParams, WaveletFilter,
};
pub use decoder::decode;
pub use encoder::encode;
pub use error::J2kError;
pub use image::{ComponentInfo, DecodeMeta, DecodedImage, ImageBuffer};
pub use transcode::{transcode, TranscodeTarget};
