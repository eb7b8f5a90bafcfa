//! Packet progression orders (ISO/IEC 15444-1 B.12).
//!
//! Produces the deterministic packet sequence of one tile for a given
//! progression order. Both the encoder and the decoder iterate the same
//! sequence, so packet position in the stream is never ambiguous.

use crate::config::ProgressionOrder;
use crate::tile::TileModel;

/// Identity of one packet within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId {
    pub layer: u16,
    pub comp: u16,
    pub res: u8,
    pub precinct: u32,
}

/// Spatial sort key of a precinct: its origin on the reference grid.
fn precinct_position(tile: &TileModel, comp: usize, res: u8, precinct: u32) -> (u64, u64) {
    let tc = &tile.components[comp];
    let r = &tc.resolutions[res as usize];
    let px = precinct % r.num_px.max(1);
    let py = precinct / r.num_px.max(1);
    // Unclipped precinct origin in resolution coordinates, scaled back to
    // the reference grid.
    let shift = (tc.levels - res) as u64;
    let gx = (((r.rect.x0 >> r.ppx) + px) as u64) << r.ppx;
    let gy = (((r.rect.y0 >> r.ppy) + py) as u64) << r.ppy;
    (gy << shift, gx << shift)
}

/// The full packet sequence of `tile` for `num_layers` quality layers.
pub fn packet_sequence(
    tile: &TileModel,
    order: ProgressionOrder,
    num_layers: u16,
) -> Vec<PacketId> {
    let mut packets = Vec::new();
    for layer in 0..num_layers {
        for (ci, tc) in tile.components.iter().enumerate() {
            for res in &tc.resolutions {
                for p in 0..res.num_precincts() {
                    packets.push(PacketId {
                        layer,
                        comp: ci as u16,
                        res: res.level,
                        precinct: p,
                    });
                }
            }
        }
    }

    let key = |p: &PacketId| -> (u64, u64, u64, u64, u64) {
        let (py, px) = precinct_position(tile, p.comp as usize, p.res, p.precinct);
        let (l, r, c, n) = (
            p.layer as u64,
            p.res as u64,
            p.comp as u64,
            p.precinct as u64,
        );
        match order {
            ProgressionOrder::Lrcp => (l, r, c, n, 0),
            ProgressionOrder::Rlcp => (r, l, c, n, 0),
            ProgressionOrder::Rpcl => (r, py, px, c, l),
            ProgressionOrder::Pcrl => (py, px, c, r, l),
            ProgressionOrder::Cprl => (c, py, px, r, l),
        }
    };
    packets.sort_by_key(key);
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;
    use crate::image::ImageBuffer;
    use crate::tile::build_tile;

    fn tile(levels: u8) -> TileModel {
        let p = EncodeParams {
            decomposition_levels: levels,
            ..EncodeParams::default()
        };
        let params =
            crate::encoder::coding_params(&ImageBuffer::new_gray(64, 64, 8), &p).unwrap();
        build_tile(&params, 0)
    }

    #[test]
    fn test_lrcp_layers_outermost() {
        let t = tile(2);
        let seq = packet_sequence(&t, ProgressionOrder::Lrcp, 3);
        assert_eq!(seq.len(), 3 * 3);
        // All of layer 0 precedes any of layer 1.
        let first_l1 = seq.iter().position(|p| p.layer == 1).unwrap();
        assert!(seq[..first_l1].iter().all(|p| p.layer == 0));
        assert_eq!(seq[0].res, 0);
    }

    #[test]
    fn test_rlcp_resolutions_outermost() {
        let t = tile(2);
        let seq = packet_sequence(&t, ProgressionOrder::Rlcp, 2);
        let first_r1 = seq.iter().position(|p| p.res == 1).unwrap();
        assert!(seq[..first_r1].iter().all(|p| p.res == 0));
        assert_eq!(seq.len(), 2 * 3);
    }

    #[test]
    fn test_all_orders_are_permutations() {
        let t = tile(3);
        let lrcp = packet_sequence(&t, ProgressionOrder::Lrcp, 2);
        for order in [
            ProgressionOrder::Rlcp,
            ProgressionOrder::Rpcl,
            ProgressionOrder::Pcrl,
            ProgressionOrder::Cprl,
        ] {
            let seq = packet_sequence(&t, order, 2);
            assert_eq!(seq.len(), lrcp.len());
            for p in &lrcp {
                assert!(seq.contains(p), "{order:?} missing {p:?}");
            }
        }
    }
}
