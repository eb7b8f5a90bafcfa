//! MEL adaptive run-length coder (ISO/IEC 15444-15, 7.2).
//!
//! Codes the "is this quad all-zero?" events of the HT cleanup pass. The
//! run-length threshold adapts through a 13-state exponent table: a 0 bit
//! commits a full run of 2^E[k] zero events, a 1 bit carries E[k]
//! position bits giving the number of zeros that preceded a one event.

use crate::bit_io::{BitReader, BitWriter};

/// Exponent table; state advances on full runs, retreats on ones.
const MEL_E: [u8; 13] = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 4, 5];

pub struct MelEncoder {
    out: BitWriter,
    k: usize,
    run: u32,
}

impl Default for MelEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MelEncoder {
    pub fn new() -> Self {
        Self {
            out: BitWriter::new(),
            k: 0,
            run: 0,
        }
    }

    /// Code one event; `significant` is the improbable symbol.
    pub fn encode(&mut self, significant: bool) {
        if !significant {
            self.run += 1;
            if self.run == 1 << MEL_E[self.k] {
                self.out.write_bit(0);
                self.run = 0;
                self.k = (self.k + 1).min(12);
            }
        } else {
            self.out.write_bit(1);
            self.out.write_bits(self.run, MEL_E[self.k]);
            self.run = 0;
            self.k = self.k.saturating_sub(1);
        }
    }

    /// Close the stream. A pending partial run is committed as a full
    /// run; the decoder never consumes the surplus zero events.
    pub fn finish(mut self) -> Vec<u8> {
        if self.run > 0 {
            self.out.write_bit(0);
        }
        self.out.finish_raw()
    }
}

pub struct MelDecoder<'a> {
    input: BitReader<'a>,
    k: usize,
    pending_zeros: u32,
    pending_one: bool,
}

impl<'a> MelDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            input: BitReader::new(data),
            k: 0,
            pending_zeros: 0,
            pending_one: false,
        }
    }

    pub fn decode(&mut self) -> bool {
        if self.pending_zeros > 0 {
            self.pending_zeros -= 1;
            return false;
        }
        if self.pending_one {
            self.pending_one = false;
            return true;
        }
        let bit = self.input.read_bit().unwrap_or(0);
        if bit == 0 {
            // A full run of 2^E[k] zeros; this call consumes the first.
            self.pending_zeros = (1 << MEL_E[self.k]) - 1;
            self.k = (self.k + 1).min(12);
            false
        } else {
            let r = self.input.read_bits(MEL_E[self.k]).unwrap_or(0);
            self.k = self.k.saturating_sub(1);
            if r == 0 {
                true
            } else {
                self.pending_zeros = r - 1;
                self.pending_one = true;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(events: &[bool]) {
        let mut enc = MelEncoder::new();
        for &e in events {
            enc.encode(e);
        }
        let bytes = enc.finish();
        let mut dec = MelDecoder::new(&bytes);
        for (i, &e) in events.iter().enumerate() {
            assert_eq!(dec.decode(), e, "event {i}");
        }
    }

    #[test]
    fn test_all_zero_run() {
        roundtrip(&[false; 100]);
    }

    #[test]
    fn test_alternating() {
        let events: Vec<bool> = (0..64).map(|i| i % 2 == 0).collect();
        roundtrip(&events);
    }

    #[test]
    fn test_bursty_pattern() {
        let mut events = vec![false; 40];
        events.extend([true; 5]);
        events.extend([false; 17]);
        events.push(true);
        events.extend([false; 3]);
        roundtrip(&events);
    }

    #[test]
    fn test_adaptation_grows_runs() {
        // Long zero stretches compress to far fewer bits than events.
        let mut enc = MelEncoder::new();
        for _ in 0..1000 {
            enc.encode(false);
        }
        let bytes = enc.finish();
        assert!(bytes.len() < 16, "1000 zero events took {} bytes", bytes.len());
    }
}
