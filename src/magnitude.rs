//! I/Q to magnitude conversion
//!
//! Converts raw 8-bit I/Q sample pairs to 16-bit magnitude values using a
//! precomputed lookup table, and keeps the per-block magnitude buffer with
//! its lookahead carry.

/// Lookup table for I/Q to magnitude conversion.
/// Index: packed (I, Q) byte pair `(i << 8) | q`.
/// Value: sqrt((I-127.5)^2 + (Q-127.5)^2) rescaled so the corner pair
/// (0 or 255 on both axes) maps to 65535.
pub struct MagnitudeLut {
    table: Box<[u16; 65536]>,
}

impl MagnitudeLut {
    pub fn new() -> Self {
        // Maximum distance from center: sqrt(2) * 127.5
        let scale = 65535.0 / (2.0f64 * 127.5 * 127.5).sqrt();

        let mut table = vec![0u16; 65536].into_boxed_slice();
        for i in 0..256usize {
            for q in 0..256usize {
                let fi = i as f64 - 127.5;
                let fq = q as f64 - 127.5;
                let mag = (fi * fi + fq * fq).sqrt() * scale;
                table[(i << 8) | q] = mag.round() as u16;
            }
        }

        let table: Box<[u16; 65536]> = table.try_into().unwrap();
        Self { table }
    }

    /// Look up the magnitude for a raw (I, Q) byte pair.
    #[inline]
    pub fn lookup(&self, i: u8, q: u8) -> u16 {
        self.table[((i as usize) << 8) | q as usize]
    }
}

impl Default for MagnitudeLut {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup table mapping a 16-bit magnitude to `round(100 * log10(x))`.
/// Used by the demodulators to compute SNR in 0.2 dB units without
/// floating point on the hot path.
pub struct Log10Lut {
    table: Box<[u16; 65536]>,
}

impl Log10Lut {
    pub fn new() -> Self {
        let mut table = vec![0u16; 65536].into_boxed_slice();
        for x in 1..65536usize {
            table[x] = (100.0 * (x as f64).log10()).round() as u16;
        }
        let table: Box<[u16; 65536]> = table.try_into().unwrap();
        Self { table }
    }

    #[inline]
    pub fn lookup(&self, x: u32) -> i32 {
        self.table[(x & 0xFFFF) as usize] as i32
    }
}

impl Default for Log10Lut {
    fn default() -> Self {
        Self::new()
    }
}

/// Magnitude buffer reused block to block.
///
/// The head of the buffer holds the last `lookahead` samples of the previous
/// block, so a demodulator handed an index near the end of a block can still
/// read a full frame's worth of samples past it.
pub struct MagnitudeBuffer {
    data: Vec<u16>,
    lookahead: usize,
    /// Samples carried over from the previous block, currently at the head.
    carried: usize,
}

impl MagnitudeBuffer {
    pub fn new(lookahead: usize) -> Self {
        Self {
            data: Vec::new(),
            lookahead,
            carried: 0,
        }
    }

    /// Convert a block of interleaved I/Q bytes, keeping the tail of the
    /// previous block at the head of the buffer.
    pub fn convert_block(&mut self, iq: &[u8], lut: &MagnitudeLut) {
        // Carry the tail of the previous block forward.
        let keep = self.lookahead.min(self.data.len());
        let start = self.data.len() - keep;
        self.data.copy_within(start.., 0);
        self.data.truncate(keep);
        self.carried = keep;

        self.data.reserve(iq.len() / 2);
        for chunk in iq.chunks_exact(2) {
            self.data.push(lut.lookup(chunk[0], chunk[1]));
        }
    }

    /// All samples: carried lookahead followed by the current block.
    pub fn samples(&self) -> &[u16] {
        &self.data
    }

    /// Number of samples carried over from the previous block.
    pub fn carried(&self) -> usize {
        self.carried
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_lut_range() {
        let lut = MagnitudeLut::new();

        // Center pair has the smallest distance from (127.5, 127.5)
        assert!(lut.lookup(127, 127) < 300);
        assert!(lut.lookup(128, 128) < 300);

        // Corner pairs use the full range
        assert_eq!(lut.lookup(0, 0), 65535);
        assert_eq!(lut.lookup(255, 255), 65535);
        assert_eq!(lut.lookup(0, 255), 65535);

        // Single axis at full deviation: 127.5 * scale
        let single = lut.lookup(255, 127) as i32;
        let expected = (65535.0 / (2.0f64).sqrt()).round() as i32;
        assert!((single - expected).abs() <= 200);
    }

    #[test]
    fn test_magnitude_symmetry() {
        let lut = MagnitudeLut::new();
        // +d and -d around the midpoint give the same magnitude
        assert_eq!(lut.lookup(127, 200), lut.lookup(128, 55));
        assert_eq!(lut.lookup(10, 127), lut.lookup(245, 128));
    }

    #[test]
    fn test_log10_lut() {
        let lut = Log10Lut::new();
        assert_eq!(lut.lookup(1), 0);
        assert_eq!(lut.lookup(10), 100);
        assert_eq!(lut.lookup(100), 200);
        assert_eq!(lut.lookup(1000), 300);
        // round(100*log10(2)) = 30
        assert_eq!(lut.lookup(2), 30);
    }

    #[test]
    fn test_buffer_carry() {
        let lut = MagnitudeLut::new();
        let mut buf = MagnitudeBuffer::new(4);

        let block1: Vec<u8> = vec![0, 0, 255, 255, 127, 127, 0, 255, 255, 0, 200, 50];
        buf.convert_block(&block1, &lut);
        assert_eq!(buf.samples().len(), 6);
        assert_eq!(buf.carried(), 0);
        let tail: Vec<u16> = buf.samples()[2..].to_vec();

        let block2: Vec<u8> = vec![127, 127, 127, 127];
        buf.convert_block(&block2, &lut);
        assert_eq!(buf.carried(), 4);
        assert_eq!(buf.samples().len(), 6);
        assert_eq!(&buf.samples()[..4], tail.as_slice());
    }
}
