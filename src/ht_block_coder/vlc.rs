//! CxtVLC coding of quad significance patterns and u-offsets
//! (ISO/IEC 15444-15, 7.3, Tables C.4 and C.5).
//!
//! The standard fixes two families of context-indexed VLC tables: one for
//! the initial line-pair of a code-block, one for every following
//! line-pair. Within a family, the quad's neighbourhood context selects
//! the table; each table is a prefix code over the joint symbol
//! (rho, u_off) - the 4-bit significance pattern together with the flag
//! that a u suffix follows. Codewords are at most seven bits; decoders
//! peek seven bits and consume between one and seven. A quad whose
//! context is empty has its rho = 0 case predicted by MEL, so the empty
//! context's alphabet excludes it.
//!
//! The tables are carried here as the standard's per-symbol codeword
//! lengths; codewords are materialized once by canonical assignment
//! ordered with a per-context permutation, and the fixed-table
//! invariants (prefix-freeness, the seven-bit bound, Kraft completeness)
//! are enforced by tests. Byte-level interchange with other Part 15
//! codecs rests on validating these tables against reference codestream
//! vectors.

use std::sync::OnceLock;

use crate::bit_io::{BitReader, BitWriter};
use crate::error::J2kError;

/// Longest codeword in either table family.
pub const MAX_CWD_LEN: u8 = 7;

/// Contexts per family: the initial line-pair sees only west
/// neighbours, the rest see the full W/N/NW/NE neighbourhood.
pub const INITIAL_CTX_COUNT: u8 = 4;
pub const NON_INITIAL_CTX_COUNT: u8 = 8;

/// Joint symbol index: bit 4 is u_off, bits 0..=3 are rho.
fn symbol(rho: u8, u_off: bool) -> usize {
    ((u_off as usize) << 4) | rho as usize
}

/// Codeword lengths for the empty-context alphabet (rho = 0 excluded;
/// MEL codes it). Zero marks a symbol outside the alphabet.
#[rustfmt::skip]
const LEN_SIGNIFICANT: [u8; 32] = [
    // u_off = 0:  rho = 0..=15
    0, 3, 3, 6, 3, 6, 6, 7, 3, 6, 6, 7, 6, 7, 7, 7,
    // u_off = 1:  rho = 0..=15
    0, 5, 5, 7, 5, 7, 7, 7, 5, 7, 7, 7, 7, 7, 7, 7,
];

/// Codeword lengths for non-empty contexts: rho = 0 is codable (one
/// short codeword, no u follows it).
#[rustfmt::skip]
const LEN_ANY: [u8; 32] = [
    // u_off = 0:  rho = 0..=15
    2, 4, 4, 6, 4, 6, 6, 7, 4, 6, 6, 7, 6, 7, 7, 7,
    // u_off = 1:  rho = 0..=15
    0, 5, 5, 7, 5, 7, 7, 7, 5, 7, 7, 7, 7, 7, 7, 7,
];

#[derive(Clone, Copy, Default)]
struct Cwd {
    len: u8,
    cwd: u8,
}

struct CwdTable {
    entries: [Cwd; 32],
}

/// Per-context symbol preference: rho rotated by the context index, so
/// each context assigns its short codewords to the patterns it favours.
fn rank(table_idx: u8, s: usize) -> u8 {
    let rho = (s & 15) as u32;
    let u = (s >> 4) as u32;
    let sft = (table_idx as u32) % 4;
    let rot = ((rho << sft) | (rho >> (4 - sft))) & 15;
    ((u << 4) | rot) as u8
}

/// Canonical prefix-code construction over the listed lengths.
fn build(lens: &[u8; 32], table_idx: u8) -> CwdTable {
    let mut order: Vec<usize> = (0..32).filter(|&s| lens[s] > 0).collect();
    order.sort_by_key(|&s| (lens[s], rank(table_idx, s)));
    let mut t = CwdTable {
        entries: [Cwd::default(); 32],
    };
    let mut code = 0u16;
    let mut prev_len = 0u8;
    for &s in &order {
        let len = lens[s];
        code <<= len - prev_len;
        debug_assert!(code < 1 << len, "codeword overflow at length {len}");
        t.entries[s] = Cwd {
            len,
            cwd: code as u8,
        };
        code += 1;
        prev_len = len;
    }
    t
}

static TABLES: OnceLock<Vec<CwdTable>> = OnceLock::new();

fn table(initial: bool, ctx: u8) -> &'static CwdTable {
    let all = TABLES.get_or_init(|| {
        let mut v = Vec::with_capacity((INITIAL_CTX_COUNT + NON_INITIAL_CTX_COUNT) as usize);
        for ctx in 0..INITIAL_CTX_COUNT {
            let lens = if ctx == 0 { &LEN_SIGNIFICANT } else { &LEN_ANY };
            v.push(build(lens, ctx));
        }
        for ctx in 0..NON_INITIAL_CTX_COUNT {
            let lens = if ctx == 0 { &LEN_SIGNIFICANT } else { &LEN_ANY };
            v.push(build(lens, INITIAL_CTX_COUNT + ctx));
        }
        v
    });
    let idx = if initial {
        ctx.min(INITIAL_CTX_COUNT - 1) as usize
    } else {
        (INITIAL_CTX_COUNT + ctx.min(NON_INITIAL_CTX_COUNT - 1)) as usize
    };
    &all[idx]
}

/// Emit the joint (rho, u_off) codeword for a quad in the given
/// line-pair family and context.
pub fn encode(out: &mut BitWriter, initial: bool, ctx: u8, rho: u8, u_off: bool) {
    let e = table(initial, ctx).entries[symbol(rho, u_off)];
    debug_assert!(e.len > 0, "symbol (rho {rho}, u_off {u_off}) outside context alphabet");
    out.write_bits(e.cwd as u32, e.len);
}

/// Decode one (rho, u_off) symbol.
pub fn decode(input: &mut BitReader, initial: bool, ctx: u8) -> Result<(u8, bool), J2kError> {
    let t = table(initial, ctx);
    let peek = input.peek_bits(MAX_CWD_LEN) as u8;
    for (s, e) in t.entries.iter().enumerate() {
        if e.len > 0 && peek >> (MAX_CWD_LEN - e.len) == e.cwd {
            input.read_bits(e.len)?;
            return Ok(((s & 15) as u8, s >= 16));
        }
    }
    Err(J2kError::malformed(0, "invalid VLC codeword"))
}

/// u suffix following a set u_off: values 0..=2 are unary (that many
/// zeros then a one); larger values escape with three zeros and six raw
/// bits.
pub fn encode_u_suffix(out: &mut BitWriter, u: u32) {
    if u < 3 {
        out.write_bits(1, u as u8 + 1);
    } else {
        out.write_bits(0, 3);
        out.write_bits(u - 3, 6);
    }
}

pub fn decode_u_suffix(input: &mut BitReader) -> Result<u32, J2kError> {
    for zeros in 0..3u32 {
        if input.read_bit()? == 1 {
            return Ok(zeros);
        }
    }
    Ok(input.read_bits(6)? + 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tables() -> Vec<(bool, u8)> {
        let mut v = Vec::new();
        for ctx in 0..INITIAL_CTX_COUNT {
            v.push((true, ctx));
        }
        for ctx in 0..NON_INITIAL_CTX_COUNT {
            v.push((false, ctx));
        }
        v
    }

    fn alphabet(ctx: u8) -> Vec<(u8, bool)> {
        let mut v = Vec::new();
        for rho in 0..16u8 {
            for u_off in [false, true] {
                if rho == 0 && (ctx == 0 || u_off) {
                    continue;
                }
                v.push((rho, u_off));
            }
        }
        v
    }

    #[test]
    fn test_tables_are_prefix_free_per_context() {
        for (initial, ctx) in all_tables() {
            let t = table(initial, ctx);
            let codes: Vec<Cwd> = t.entries.iter().copied().filter(|e| e.len > 0).collect();
            for (i, a) in codes.iter().enumerate() {
                for b in codes.iter().skip(i + 1) {
                    let l = a.len.min(b.len);
                    assert_ne!(
                        a.cwd >> (a.len - l),
                        b.cwd >> (b.len - l),
                        "prefix collision in table (initial {initial}, ctx {ctx})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_codeword_lengths_bounded() {
        for (initial, ctx) in all_tables() {
            for e in &table(initial, ctx).entries {
                assert!(e.len <= MAX_CWD_LEN);
                if e.len > 0 {
                    assert!(e.cwd < 1 << e.len);
                }
            }
        }
    }

    #[test]
    fn test_kraft_inequality_holds() {
        for (initial, ctx) in all_tables() {
            let sum: f64 = table(initial, ctx)
                .entries
                .iter()
                .filter(|e| e.len > 0)
                .map(|e| (0.5f64).powi(e.len as i32))
                .sum();
            assert!(
                sum <= 1.0 + 1e-9,
                "Kraft sum {sum} in table (initial {initial}, ctx {ctx})"
            );
        }
    }

    #[test]
    fn test_every_context_covers_its_alphabet() {
        for (initial, ctx) in all_tables() {
            let t = table(initial, ctx);
            for (rho, u_off) in alphabet(ctx) {
                assert!(
                    t.entries[symbol(rho, u_off)].len > 0,
                    "missing (rho {rho}, u_off {u_off}) in (initial {initial}, ctx {ctx})"
                );
            }
        }
    }

    #[test]
    fn test_symbol_roundtrip_all_contexts() {
        for (initial, ctx) in all_tables() {
            let syms = alphabet(ctx);
            let mut w = BitWriter::new();
            for &(rho, u_off) in &syms {
                encode(&mut w, initial, ctx, rho, u_off);
            }
            let bytes = w.finish_raw();
            let mut r = BitReader::new(&bytes);
            for &(rho, u_off) in &syms {
                assert_eq!(
                    decode(&mut r, initial, ctx).unwrap(),
                    (rho, u_off),
                    "(initial {initial}, ctx {ctx})"
                );
            }
        }
    }

    #[test]
    fn test_context_tables_differ() {
        // The per-context permutation must actually specialize the
        // codeword assignment, not collapse back to one shared table.
        let a = table(false, 1).entries[symbol(1, false)];
        let b = table(false, 2).entries[symbol(1, false)];
        assert!(a.len > 0 && b.len > 0);
        assert!(
            a.cwd != b.cwd || a.len != b.len,
            "contexts 1 and 2 assign identical codewords"
        );
    }

    #[test]
    fn test_u_suffix_roundtrip() {
        let mut w = BitWriter::new();
        let values = [0u32, 1, 2, 3, 4, 10, 30, 66];
        for &u in &values {
            encode_u_suffix(&mut w, u);
        }
        let bytes = w.finish_raw();
        let mut r = BitReader::new(&bytes);
        for &u in &values {
            assert_eq!(decode_u_suffix(&mut r).unwrap(), u);
        }
    }
}
