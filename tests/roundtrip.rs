//! End-to-end codestream tests: lossless roundtrips, progression and
//! layer behavior, marker well-formedness, HT coding and transcoding.

use j2k_rs::marker_code::MarkerCode;
use j2k_rs::{
    decode, encode, transcode, ColorTransform, DecodeParams, EncodeParams, HtMode, ImageBuffer,
    LayerTarget, ProgressionOrder, TranscodeTarget, WaveletFilter,
};

fn gray_ramp(w: u32, h: u32) -> ImageBuffer {
    let mut img = ImageBuffer::new_gray(w, h, 8);
    for y in 0..h {
        for x in 0..w {
            img.planes[0][(y * w + x) as usize] = ((y * w + x) % 256) as i32;
        }
    }
    img
}

fn gray_noise(w: u32, h: u32, seed: u32) -> ImageBuffer {
    let mut img = ImageBuffer::new_gray(w, h, 8);
    let mut s = seed | 1;
    for p in img.planes[0].iter_mut() {
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        *p = (s % 256) as i32;
    }
    img
}

fn rgb_gradient(w: u32, h: u32) -> ImageBuffer {
    let mut img = ImageBuffer::new_rgb(w, h, 8);
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            img.planes[0][i] = ((x * 255) / w.max(1)) as i32;
            img.planes[1][i] = 128;
            img.planes[2][i] = 64;
        }
    }
    img
}

fn psnr(a: &[i32], b: &[i32], peak: f64) -> f64 {
    let mse: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        / a.len() as f64;
    if mse == 0.0 {
        f64::INFINITY
    } else {
        10.0 * ((peak * peak) / mse).log10()
    }
}

/// Every marker length lands on the next marker; SOC first, EOC last.
fn check_well_formed(bytes: &[u8]) -> Vec<MarkerCode> {
    assert_eq!(&bytes[..2], &[0xFF, 0x4F], "SOC at offset 0");
    assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9], "EOC at tail");
    let mut markers = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let code = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
        let marker = MarkerCode::try_from(code).expect("known marker");
        markers.push(marker);
        pos += 2;
        match marker {
            MarkerCode::StartOfCodestream | MarkerCode::EndOfCodestream => {}
            MarkerCode::StartOfTile => {
                // Jump over the whole tile-part via Psot.
                let psot = u32::from_be_bytes([
                    bytes[pos + 4],
                    bytes[pos + 5],
                    bytes[pos + 6],
                    bytes[pos + 7],
                ]) as usize;
                pos = pos - 2 + psot;
            }
            _ => {
                let len =
                    u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as usize;
                pos += len;
            }
        }
    }
    markers
}

#[test]
fn test_scenario_a_lossless_ramp_16x16() {
    let img = gray_ramp(16, 16);
    let params = EncodeParams {
        decomposition_levels: 3,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    assert!(bytes.len() < 400, "codestream took {} bytes", bytes.len());

    let markers = check_well_formed(&bytes);
    use MarkerCode::*;
    for m in [
        StartOfCodestream,
        ImageAndTileSize,
        CodingStyleDefault,
        QuantizationDefault,
        StartOfTile,
        EndOfCodestream,
    ] {
        assert!(markers.contains(&m), "missing {m:?}");
    }
    assert_eq!(
        markers
            .iter()
            .filter(|&&m| m == StartOfCodestream)
            .count(),
        1
    );

    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.planes[0], img.planes[0]);
    assert!(!out.meta.truncated);
}

#[test]
fn test_lossless_noise_with_tiles_and_blocks() {
    let img = gray_noise(70, 50, 0xBEEF);
    let params = EncodeParams {
        tile_width: 32,
        tile_height: 32,
        decomposition_levels: 2,
        cblk_width_exp: 4,
        cblk_height_exp: 4,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    check_well_formed(&bytes);
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.planes[0], img.planes[0]);
}

#[test]
fn test_lossless_rgb_rct_roundtrip() {
    let mut img = rgb_gradient(33, 17);
    img.planes[2][5] = 255;
    let params = EncodeParams {
        decomposition_levels: 2,
        color_transform: ColorTransform::ReversibleRct,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    for c in 0..3 {
        assert_eq!(out.image.planes[c], img.planes[c], "component {c}");
    }
}

#[test]
fn test_progression_orders_decode_identically() {
    let img = gray_noise(48, 48, 7);
    let mut streams = Vec::new();
    for order in [
        ProgressionOrder::Lrcp,
        ProgressionOrder::Rlcp,
        ProgressionOrder::Rpcl,
        ProgressionOrder::Pcrl,
        ProgressionOrder::Cprl,
    ] {
        let params = EncodeParams {
            decomposition_levels: 3,
            progression: order,
            ..EncodeParams::lossless()
        };
        streams.push(encode(&img, &params).unwrap());
    }
    for bytes in &streams {
        let out = decode(bytes, &DecodeParams::default()).unwrap();
        assert_eq!(out.image.planes[0], img.planes[0]);
    }
}

#[test]
fn test_scenario_c_progressive_resolution() {
    let img = gray_noise(128, 128, 42);
    let params = EncodeParams {
        decomposition_levels: 4,
        progression: ProgressionOrder::Rlcp,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();

    let reduced = decode(
        &bytes,
        &DecodeParams {
            max_resolution: Some(2),
            ..DecodeParams::default()
        },
    )
    .unwrap();
    assert_eq!(reduced.image.width, 32);
    assert_eq!(reduced.image.height, 32);
    assert_eq!(reduced.meta.resolution, 2);

    let full = decode(
        &bytes,
        &DecodeParams {
            max_resolution: Some(4),
            ..DecodeParams::default()
        },
    )
    .unwrap();
    assert_eq!(full.image.width, 128);
    assert_eq!(full.image.planes[0], img.planes[0]);
}

#[test]
fn test_scenario_d_progressive_quality_layers() {
    let img = gray_noise(64, 64, 3);
    let params = EncodeParams {
        decomposition_levels: 4,
        layer_targets: vec![
            LayerTarget::Bytes(500),
            LayerTarget::Bytes(1000),
            LayerTarget::Bytes(2000),
            LayerTarget::Any,
        ],
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    check_well_formed(&bytes);

    // Decoding with growing layer limits must not lose quality.
    let mut last_psnr = 0.0f64;
    for layers in 1..=4u16 {
        let out = decode(
            &bytes,
            &DecodeParams {
                max_layers: Some(layers),
                ..DecodeParams::default()
            },
        )
        .unwrap();
        let p = psnr(&out.image.planes[0], &img.planes[0], 255.0);
        assert!(
            p >= last_psnr - 0.01,
            "layer {layers}: PSNR fell from {last_psnr:.2} to {p:.2}"
        );
        last_psnr = p;
    }
    assert!(last_psnr.is_infinite(), "final layer set is lossless");
}

#[test]
fn test_truncated_stream_yields_partial_image() {
    let img = gray_noise(64, 64, 11);
    let params = EncodeParams {
        decomposition_levels: 3,
        layer_targets: vec![LayerTarget::Bytes(600), LayerTarget::Any],
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    // Cut deep inside the tile body.
    let cut = &bytes[..bytes.len() * 2 / 3];
    let out = decode(cut, &DecodeParams::default()).unwrap();
    assert!(out.meta.truncated);
    assert_eq!(out.image.width, 64);
    // The salvaged prefix still carries signal.
    let p = psnr(&out.image.planes[0], &img.planes[0], 255.0);
    assert!(p > 10.0, "salvaged PSNR {p:.2}");
}

#[test]
fn test_scenario_b_lossy_97_quality() {
    let img = rgb_gradient(64, 64);
    let params = EncodeParams {
        decomposition_levels: 5,
        color_transform: ColorTransform::IrreversibleIct,
        ..EncodeParams::lossy()
    };
    let bytes = encode(&img, &params).unwrap();
    check_well_formed(&bytes);
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    for c in 0..3 {
        let p = psnr(&out.image.planes[c], &img.planes[c], 255.0);
        assert!(p >= 35.0, "component {c}: PSNR {p:.2} below 35 dB");
    }
}

#[test]
fn test_lossy_rate_target_respected() {
    let img = gray_noise(64, 64, 99);
    let target = 2000;
    let params = EncodeParams {
        decomposition_levels: 4,
        layer_targets: vec![LayerTarget::Bytes(target)],
        ..EncodeParams::lossy()
    };
    let bytes = encode(&img, &params).unwrap();
    assert!(
        bytes.len() <= target,
        "codestream {} exceeds target {target}",
        bytes.len()
    );
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    let p = psnr(&out.image.planes[0], &img.planes[0], 255.0);
    assert!(p > 15.0, "rate-limited PSNR {p:.2}");
}

#[test]
fn test_rate_below_overhead_is_infeasible() {
    let img = gray_noise(32, 32, 5);
    let params = EncodeParams {
        layer_targets: vec![LayerTarget::Bytes(10)],
        ..EncodeParams::lossless()
    };
    match encode(&img, &params) {
        Err(j2k_rs::J2kError::RateControlInfeasible { requested, minimum }) => {
            assert_eq!(requested, 10);
            assert!(minimum > 10);
        }
        other => panic!("expected RateControlInfeasible, got {other:?}"),
    }
}

#[test]
fn test_scenario_e_ht_roundtrip() {
    let img = gray_noise(32, 32, 0x5EED);
    let params = EncodeParams {
        decomposition_levels: 2,
        ht: HtMode::HtOnly,
        layer_targets: vec![LayerTarget::Any, LayerTarget::Any],
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    let markers = check_well_formed(&bytes);
    assert!(
        markers.contains(&MarkerCode::Capability),
        "CAP missing from HT stream"
    );

    // COD carries the HT_ONLY bits in the code-block style byte.
    let header = j2k_rs::parser::Parser::parse_main_header(
        &mut j2k_rs::stream_reader::StreamReader::new(&bytes),
    )
    .unwrap();
    assert!(header
        .params
        .comp[0]
        .cblk_style
        .contains(j2k_rs::CblkStyle::HT_ONLY));
    assert_eq!(header.params.cap, Some(1 << 14));

    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.planes[0], img.planes[0]);
}

#[test]
fn test_ht_lossy_pipeline() {
    let img = gray_noise(40, 24, 0xACE);
    let params = EncodeParams {
        decomposition_levels: 2,
        ht: HtMode::Ht,
        ..EncodeParams::lossy()
    };
    let bytes = encode(&img, &params).unwrap();
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    let p = psnr(&out.image.planes[0], &img.planes[0], 255.0);
    assert!(p > 30.0, "HT lossy PSNR {p:.2}");
}

#[test]
fn test_scenario_f_transcode_roundtrip() {
    let img = gray_noise(32, 32, 0xF00D);
    let params = EncodeParams {
        decomposition_levels: 2,
        ht: HtMode::HtOnly,
        ..EncodeParams::lossless()
    };
    let ht_bytes = encode(&img, &params).unwrap();

    let p1_bytes = transcode(&ht_bytes, TranscodeTarget::Part1).unwrap();
    check_well_formed(&p1_bytes);
    let p1_decoded = decode(&p1_bytes, &DecodeParams::default()).unwrap();
    assert_eq!(p1_decoded.image.planes[0], img.planes[0]);

    let ht_again = transcode(&p1_bytes, TranscodeTarget::Part15).unwrap();
    assert_eq!(ht_again, ht_bytes, "HT -> Part 1 -> HT is bit-exact");
}

#[test]
fn test_transcode_part1_source() {
    let img = gray_noise(48, 32, 0xCAFE);
    let params = EncodeParams {
        decomposition_levels: 3,
        ..EncodeParams::lossless()
    };
    let p1 = encode(&img, &params).unwrap();
    let ht = transcode(&p1, TranscodeTarget::Part15).unwrap();
    let out = decode(&ht, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.planes[0], img.planes[0]);
    // And back again, matching the original stream byte for byte.
    let p1_again = transcode(&ht, TranscodeTarget::Part1).unwrap();
    assert_eq!(p1_again, p1);
}

#[test]
fn test_component_subset_and_region() {
    let img = rgb_gradient(64, 48);
    let params = EncodeParams {
        decomposition_levels: 2,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();

    let one = decode(
        &bytes,
        &DecodeParams {
            components: Some(vec![1]),
            ..DecodeParams::default()
        },
    )
    .unwrap();
    assert_eq!(one.image.planes.len(), 1);
    assert_eq!(one.image.planes[0], img.planes[1]);

    let cropped = decode(
        &bytes,
        &DecodeParams {
            region: Some((8, 4, 24, 20)),
            ..DecodeParams::default()
        },
    )
    .unwrap();
    assert_eq!(cropped.image.width, 16);
    assert_eq!(cropped.image.height, 16);
    for y in 0..16u32 {
        for x in 0..16u32 {
            assert_eq!(
                cropped.image.planes[0][(y * 16 + x) as usize],
                img.planes[0][((y + 4) * 64 + x + 8) as usize]
            );
        }
    }
}

#[test]
fn test_signed_and_deep_components() {
    let mut img = ImageBuffer::new(24, 24, vec![j2k_rs::ComponentInfo::new(12, true)]);
    let mut s = 0x1234_5679u32;
    for p in img.planes[0].iter_mut() {
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        *p = (s % 4096) as i32 - 2048;
    }
    let params = EncodeParams {
        decomposition_levels: 2,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.components[0].bit_depth, 12);
    assert!(out.image.components[0].signed);
    assert_eq!(out.image.planes[0], img.planes[0]);
}

#[test]
fn test_cblk_style_flags_roundtrip() {
    let img = gray_noise(32, 32, 0x77);
    for style in [
        j2k_rs::CblkStyle::TERMINATION_ON_EACH_PASS,
        j2k_rs::CblkStyle::SELECTIVE_BYPASS,
        j2k_rs::CblkStyle::RESET_CONTEXT | j2k_rs::CblkStyle::SEGMENTATION_SYMBOLS,
        j2k_rs::CblkStyle::VERTICALLY_CAUSAL,
    ] {
        let params = EncodeParams {
            decomposition_levels: 2,
            cblk_style: style,
            ..EncodeParams::lossless()
        };
        let bytes = encode(&img, &params).unwrap();
        let out = decode(&bytes, &DecodeParams::default()).unwrap();
        assert_eq!(out.image.planes[0], img.planes[0], "style {style:?}");
    }
}

#[test]
fn test_explicit_precincts_roundtrip() {
    let img = gray_noise(64, 64, 0xAB);
    let params = EncodeParams {
        decomposition_levels: 2,
        cblk_width_exp: 4,
        cblk_height_exp: 4,
        precinct_exps: Some(vec![(5, 5), (5, 5), (5, 5)]),
        use_eph: true,
        use_sop: true,
        ..EncodeParams::lossless()
    };
    let bytes = encode(&img, &params).unwrap();
    let out = decode(&bytes, &DecodeParams::default()).unwrap();
    assert_eq!(out.image.planes[0], img.planes[0]);
}

#[test]
fn test_arbitrary_filter_is_rejected() {
    let img = gray_ramp(8, 8);
    let params = EncodeParams {
        filter: WaveletFilter::Arbitrary(j2k_rs::dwt::LiftingKernel::irreversible_97()),
        ..EncodeParams::default()
    };
    assert!(matches!(
        encode(&img, &params),
        Err(j2k_rs::J2kError::UnsupportedFeature(_))
    ));
}
