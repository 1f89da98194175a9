//! 2.4 MS/s Mode S demodulator
//!
//! At 2.4 MS/s there are exactly 6 samples per 5 symbols: each symbol is
//! 500 ns wide, each sample 416.7 ns. A phase offset expressed in fifths of
//! a sample (one sixth of a symbol) cycles 0..5 as symbols are consumed.
//!
//! The slicers below correlate a 1-0 symbol pair (one manchester bit)
//! starting at a fixed sample phase. They sum to zero, so a DC offset in
//! the input does not change the result: >0 is a one bit, <0 a zero bit.

use crate::decoder::{self, Engine, LONG_MSG_BITS, LONG_MSG_BYTES, ParsedMessage};
use crate::magnitude::Log10Lut;

/// Samples from the first preamble sample to the end of a long frame, with
/// slicer slack: 19 preamble samples + 112 bits at 12/5 samples each.
pub const LOOKAHEAD: usize = 19 + (LONG_MSG_BITS * 12) / 5 + 12;

/// Slicing ambiguity budget per candidate.
const MAX_ENCODING_ERRORS: u32 = 3;

#[inline]
fn slice_phase0(m: &[u16]) -> i32 {
    5 * m[0] as i32 - 3 * m[1] as i32 - 2 * m[2] as i32
}
#[inline]
fn slice_phase1(m: &[u16]) -> i32 {
    4 * m[0] as i32 - m[1] as i32 - 3 * m[2] as i32
}
#[inline]
fn slice_phase2(m: &[u16]) -> i32 {
    3 * m[0] as i32 + m[1] as i32 - 4 * m[2] as i32
}
#[inline]
fn slice_phase3(m: &[u16]) -> i32 {
    2 * m[0] as i32 + 3 * m[1] as i32 - 5 * m[2] as i32
}
#[inline]
fn slice_phase4(m: &[u16]) -> i32 {
    m[0] as i32 + 5 * m[1] as i32 - 5 * m[2] as i32 - m[3] as i32
}

// The correlators scale each slicer so their peak magnitudes are
// comparable across phases.

#[inline]
fn correlate_phase0(m: &[u16]) -> i32 {
    slice_phase0(m) * 26
}
#[inline]
fn correlate_phase1(m: &[u16]) -> i32 {
    slice_phase1(m) * 38
}
#[inline]
fn correlate_phase2(m: &[u16]) -> i32 {
    slice_phase2(m) * 38
}
#[inline]
fn correlate_phase3(m: &[u16]) -> i32 {
    slice_phase3(m) * 26
}
#[inline]
fn correlate_phase4(m: &[u16]) -> i32 {
    slice_phase4(m) * 19
}

// Correlation quality for the 10 symbols (5 bits) starting at m[0] with the
// given phase offset; used to pick the decode phase.

fn correlate_check_0(m: &[u16]) -> i32 {
    correlate_phase0(&m[0..]).abs()
        + correlate_phase2(&m[2..]).abs()
        + correlate_phase4(&m[4..]).abs()
        + correlate_phase1(&m[7..]).abs()
        + correlate_phase3(&m[9..]).abs()
}

fn correlate_check_1(m: &[u16]) -> i32 {
    correlate_phase1(&m[0..]).abs()
        + correlate_phase3(&m[2..]).abs()
        + correlate_phase0(&m[5..]).abs()
        + correlate_phase2(&m[7..]).abs()
        + correlate_phase4(&m[9..]).abs()
}

fn correlate_check_2(m: &[u16]) -> i32 {
    correlate_phase2(&m[0..]).abs()
        + correlate_phase4(&m[2..]).abs()
        + correlate_phase1(&m[5..]).abs()
        + correlate_phase3(&m[7..]).abs()
        + correlate_phase0(&m[10..]).abs()
}

fn correlate_check_3(m: &[u16]) -> i32 {
    correlate_phase3(&m[0..]).abs()
        + correlate_phase0(&m[3..]).abs()
        + correlate_phase2(&m[5..]).abs()
        + correlate_phase4(&m[7..]).abs()
        + correlate_phase1(&m[10..]).abs()
}

fn correlate_check_4(m: &[u16]) -> i32 {
    correlate_phase4(&m[0..]).abs()
        + correlate_phase1(&m[3..]).abs()
        + correlate_phase3(&m[5..]).abs()
        + correlate_phase0(&m[8..]).abs()
        + correlate_phase2(&m[10..]).abs()
}

/// Work out the best phase offset for a message whose first data symbol
/// starts at m[0]. Peak detection puts the symbol at phase 4..8; testing a
/// wider range risks locking onto a half-bit offset.
fn best_phase(m: &[u16]) -> Option<usize> {
    // Minimum correlation quality we will accept
    let mut bestval =
        m[0] as i32 + m[1] as i32 + m[2] as i32 + m[3] as i32 + m[4] as i32 + m[5] as i32;
    let mut best = None;

    for (phase, test) in [
        (4, correlate_check_4(&m[0..])),
        (5, correlate_check_0(&m[1..])),
        (6, correlate_check_1(&m[1..])),
        (7, correlate_check_2(&m[1..])),
        (8, correlate_check_3(&m[1..])),
    ] {
        if test > bestval {
            bestval = test;
            best = Some(phase);
        }
    }
    best
}

pub struct Demod2400 {
    phase_enhance: bool,
    log10: Log10Lut,
}

impl Demod2400 {
    pub fn new(phase_enhance: bool) -> Self {
        Self {
            phase_enhance,
            log10: Log10Lut::new(),
        }
    }

    pub fn process_block(
        &mut self,
        m: &[u16],
        base_ts: u64,
        engine: &mut Engine,
        out: &mut Vec<ParsedMessage>,
    ) {
        if m.len() < LOOKAHEAD {
            return;
        }
        let limit = m.len() - LOOKAHEAD;
        engine.stats.samples_processed += limit as u64;

        // Rolling noise estimate over samples outside any accepted message
        let mut noise_power: u64 = 0;
        let mut noise_count: u32 = 0;
        let mut last_message_end: i64 = -1;

        // Demodulate into two alternating buffers so the best candidate is
        // not clobbered by a later phase attempt.
        let mut bufs = [[0u8; LONG_MSG_BYTES]; 2];
        let mut cur = 0usize;

        let mut j = 0;
        while j < limit {
            // We don't know yet whether m[j] is part of a message, so the
            // noise estimate works one sample in arrears.
            if j as i64 - 1 > last_message_end && j > 0 {
                let s = m[j - 1] as u64;
                noise_power += s * s;
                noise_count += 1;
            }

            let preamble = &m[j..];

            // Quick gate: rising edge into sample 1, falling edge out of 12
            if !(preamble[0] < preamble[1] && preamble[12] > preamble[13]) {
                j += 1;
                continue;
            }

            // Match against the five preamble templates (phases 3..7); each
            // prescribes the pulse peaks among samples 1..12.
            let (high, base_signal, base_noise) = if preamble[1] > preamble[2]
                && preamble[2] < preamble[3]
                && preamble[3] > preamble[4]
                && preamble[8] < preamble[9]
                && preamble[9] > preamble[10]
                && preamble[10] < preamble[11]
            {
                // peaks at 1,3,9,11-12: phase 3
                (
                    (preamble[1] as u32
                        + preamble[3] as u32
                        + preamble[9] as u32
                        + preamble[11] as u32
                        + preamble[12] as u32)
                        / 4,
                    preamble[1] as u32 + preamble[3] as u32 + preamble[9] as u32,
                    preamble[5] as u32 + preamble[6] as u32 + preamble[7] as u32,
                )
            } else if preamble[1] > preamble[2]
                && preamble[2] < preamble[3]
                && preamble[3] > preamble[4]
                && preamble[8] < preamble[9]
                && preamble[9] > preamble[10]
                && preamble[11] < preamble[12]
            {
                // peaks at 1,3,9,12: phase 4
                (
                    (preamble[1] as u32
                        + preamble[3] as u32
                        + preamble[9] as u32
                        + preamble[12] as u32)
                        / 4,
                    preamble[1] as u32
                        + preamble[3] as u32
                        + preamble[9] as u32
                        + preamble[12] as u32,
                    preamble[5] as u32
                        + preamble[6] as u32
                        + preamble[7] as u32
                        + preamble[8] as u32,
                )
            } else if preamble[1] > preamble[2]
                && preamble[2] < preamble[3]
                && preamble[4] > preamble[5]
                && preamble[8] < preamble[9]
                && preamble[10] > preamble[11]
                && preamble[11] < preamble[12]
            {
                // peaks at 1,3-4,9-10,12: phase 5
                (
                    (preamble[1] as u32
                        + preamble[3] as u32
                        + preamble[4] as u32
                        + preamble[9] as u32
                        + preamble[10] as u32
                        + preamble[12] as u32)
                        / 4,
                    preamble[1] as u32 + preamble[12] as u32,
                    preamble[6] as u32 + preamble[7] as u32,
                )
            } else if preamble[1] > preamble[2]
                && preamble[3] < preamble[4]
                && preamble[4] > preamble[5]
                && preamble[9] < preamble[10]
                && preamble[10] > preamble[11]
                && preamble[11] < preamble[12]
            {
                // peaks at 1,4,10,12: phase 6
                (
                    (preamble[1] as u32
                        + preamble[4] as u32
                        + preamble[10] as u32
                        + preamble[12] as u32)
                        / 4,
                    preamble[1] as u32
                        + preamble[4] as u32
                        + preamble[10] as u32
                        + preamble[12] as u32,
                    preamble[5] as u32
                        + preamble[6] as u32
                        + preamble[7] as u32
                        + preamble[8] as u32,
                )
            } else if preamble[2] > preamble[3]
                && preamble[3] < preamble[4]
                && preamble[4] > preamble[5]
                && preamble[9] < preamble[10]
                && preamble[10] > preamble[11]
                && preamble[11] < preamble[12]
            {
                // peaks at 1-2,4,10,12: phase 7
                (
                    (preamble[1] as u32
                        + preamble[2] as u32
                        + preamble[4] as u32
                        + preamble[10] as u32
                        + preamble[12] as u32)
                        / 4,
                    preamble[4] as u32 + preamble[10] as u32 + preamble[12] as u32,
                    preamble[6] as u32 + preamble[7] as u32 + preamble[8] as u32,
                )
            } else {
                // no suitable peaks
                j += 1;
                continue;
            };

            // About 3.5 dB SNR
            if base_signal * 2 < 3 * base_noise {
                j += 1;
                continue;
            }

            // The quiet symbols must actually be quiet
            let high = high as u16;
            if preamble[5] >= high
                || preamble[6] >= high
                || preamble[7] >= high
                || preamble[8] >= high
                || preamble[14] >= high
                || preamble[15] >= high
                || preamble[16] >= high
                || preamble[17] >= high
                || preamble[18] >= high
            {
                j += 1;
                continue;
            }

            let phases = if self.phase_enhance {
                // Try them all
                4..=8
            } else {
                // Cross-correlate the first five symbols for a likely phase
                match best_phase(&preamble[19..]) {
                    Some(p) => p..=p,
                    None => {
                        j += 1;
                        continue;
                    }
                }
            };

            engine.stats.valid_preambles += 1;

            let mut best: Option<(usize, i32, i32, usize)> = None; // (buf, score, snr, phase)

            for try_phase in phases {
                let msg = &mut bufs[cur];
                msg.fill(0);

                let mut sig_level = base_signal;
                let mut noise_level = base_noise;

                let mut ptr = j + 19 + try_phase / 5;
                let mut phase = try_phase % 5;
                let mut the_byte = 0u8;
                let mut errors = 0u32;
                let mut i = 0;

                while i < LONG_MSG_BITS && errors < MAX_ENCODING_ERRORS {
                    let test = match phase {
                        0 => {
                            let t = slice_phase0(&m[ptr..]);
                            phase = 2;
                            ptr += 2;
                            t
                        }
                        1 => {
                            let t = slice_phase1(&m[ptr..]);
                            phase = 3;
                            ptr += 2;
                            t
                        }
                        2 => {
                            let t = slice_phase2(&m[ptr..]);
                            phase = 4;
                            ptr += 2;
                            t
                        }
                        3 => {
                            let t = slice_phase3(&m[ptr..]);
                            phase = 0;
                            ptr += 3;
                            t
                        }
                        _ => {
                            let t = slice_phase4(&m[ptr..]);
                            // A phase-4 bit straddles a sample boundary, so
                            // samples 1 and 2 carry one symbol each: one is
                            // pure signal, the other pure noise.
                            if t < 0 {
                                noise_level += m[ptr + 1] as u32;
                                sig_level += m[ptr + 2] as u32;
                            } else {
                                sig_level += m[ptr + 1] as u32;
                                noise_level += m[ptr + 2] as u32;
                            }
                            phase = 1;
                            ptr += 3;
                            t
                        }
                    };

                    if test > 0 {
                        the_byte |= 1;
                    } else if test == 0 {
                        errors += 1;
                    }

                    if i & 7 == 7 {
                        msg[i / 8] = the_byte;
                    }
                    the_byte <<= 1;
                    i += 1;
                }

                if i < 8 {
                    // Didn't even make it past the first byte
                    continue;
                }
                let msglen = decoder::frame_bits(msg[0] >> 3);
                if i < msglen {
                    // Too many errors before the full message arrived
                    continue;
                }

                let score = engine.score(&msg[..]);
                if score < 0 {
                    continue;
                }

                // Fold the SNR into the score so less noisy decodes win,
                // all things being equal.
                // snr = 5 * 20log10(sig/noise), in units of 0.2 dB
                while sig_level > 65535 || noise_level > 65535 {
                    sig_level >>= 1;
                    noise_level >>= 1;
                }
                let snr = self.log10.lookup(sig_level) - self.log10.lookup(noise_level);
                let score = score + snr;

                if best.map(|(_, s, _, _)| score > s).unwrap_or(true) {
                    best = Some((cur, score, snr, try_phase));
                    // Swap buffers so a later attempt can't clobber this one
                    cur ^= 1;
                }
            }

            let Some((buf, _score, snr, bestphase)) = best else {
                engine.stats.bad_crc += 1;
                j += 1;
                continue;
            };

            let bestmsg = &bufs[buf];
            let msglen = decoder::frame_bits(bestmsg[0] >> 3);
            let timestamp = base_ts + j as u64 * 5 + bestphase as u64;
            let signal_level = snr.clamp(0, 255) as u8;

            let Some(pm) = engine.decode(&bestmsg[..msglen / 8], timestamp, signal_level) else {
                j += 1;
                continue;
            };

            // Skip to 8 bits before the end of the message: two frames that
            // almost collide can still both decode when the second preamble
            // only clobbered the tail of the first.
            last_message_end = j as i64 + ((8 + msglen) as i64 * 12) / 5;
            j += (msglen * 12) / 5;

            out.push(pm);
        }

        engine.stats.noise_power += noise_power;
        engine.stats.noise_count += noise_count as u64;
        while engine.stats.noise_power > 1 << 60 || engine.stats.noise_count > 1 << 30 {
            engine.stats.noise_power >>= 1;
            engine.stats.noise_count >>= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    /// Synthesize a 2.4 MS/s magnitude stream for one frame, symbol-exact
    /// at phase offset 0 of sample `offset + 19` (preamble phase 4).
    ///
    /// Each symbol is 6/5 of a sample. A symbol spanning fractional sample
    /// positions contributes proportionally to the samples it covers.
    fn synthesize(frame: &[u8], offset: usize) -> Vec<u16> {
        let total = offset + LOOKAHEAD + 1024;
        let mut power = vec![0f64; total];
        const HIGH: f64 = 10000.0;

        // Symbol stream: preamble pulses at symbol times 0, 2, 7, 9 (in
        // half-bit symbols of 500 ns), data starts at symbol 16.
        let mut symbols = vec![0f64; 16 + frame.len() * 16];
        for s in [0, 2, 7, 9] {
            symbols[s] = HIGH;
        }
        for (i, byte) in frame.iter().enumerate() {
            for b in 0..8 {
                let bit = byte & (0x80 >> b) != 0;
                let sym = 16 + (i * 8 + b) * 2;
                if bit {
                    symbols[sym] = HIGH;
                } else {
                    symbols[sym + 1] = HIGH;
                }
            }
        }

        // Project symbols (500 ns) onto samples (416.7 ns). The stream is
        // aligned so that symbol k spans samples [k*5/6, (k+1)*5/6) scaled
        // into sample units, with the preamble rising edge inside sample
        // offset+1 (template phase 4).
        for (k, &level) in symbols.iter().enumerate() {
            if level == 0.0 {
                continue;
            }
            let start = offset as f64 + 0.8 + k as f64 * 1.2;
            let end = start + 1.2;
            let mut s = start.floor() as usize;
            while (s as f64) < end {
                let lo = (s as f64).max(start);
                let hi = ((s + 1) as f64).min(end);
                if hi > lo {
                    power[s] += level * (hi - lo);
                }
                s += 1;
            }
        }

        power.iter().map(|&p| p.min(65535.0) as u16).collect()
    }

    fn decode_all(m: &[u16], phase_enhance: bool) -> Vec<ParsedMessage> {
        let mut demod = Demod2400::new(phase_enhance);
        let mut engine = Engine::new(1, false);
        let mut out = Vec::new();
        demod.process_block(m, 0, &mut engine, &mut out);
        out
    }

    #[test]
    fn test_slicers_are_zero_sum() {
        // A constant input must slice to exactly zero for every phase
        let flat = [1000u16; 8];
        assert_eq!(slice_phase0(&flat), 0);
        assert_eq!(slice_phase1(&flat), 0);
        assert_eq!(slice_phase2(&flat), 0);
        assert_eq!(slice_phase3(&flat), 0);
        assert_eq!(slice_phase4(&flat), 0);
    }

    #[test]
    fn test_slicer_polarity() {
        // A 1-0 symbol pair (energy early) must be positive, 0-1 negative
        let one_bit = [3000u16, 1000, 0, 0];
        let zero_bit = [0u16, 1000, 3000, 3000];
        assert!(slice_phase0(&one_bit) > 0);
        assert!(slice_phase0(&zero_bit) < 0);
        assert!(slice_phase4(&[3000, 3000, 0, 0]) > 0);
        assert!(slice_phase4(&[0, 0, 3000, 3000]) < 0);
    }

    #[test]
    fn test_decodes_synthesized_frame() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 50);
        let out = decode_all(&m, false);
        assert_eq!(out.len(), 1, "expected one decode");
        assert_eq!(out[0].payload(), &frame[..]);
        assert_eq!(out[0].addr, 0x4840D6);
    }

    #[test]
    fn test_decodes_with_phase_enhance() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 50);
        let out = decode_all(&m, true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), &frame[..]);
    }

    #[test]
    fn test_dc_offset_invariance() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 50);
        let shifted: Vec<u16> = m.iter().map(|&s| s + 700).collect();
        let a = decode_all(&m, false);
        let b = decode_all(&shifted, false);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].payload(), b[0].payload());
    }

    #[test]
    fn test_noise_estimate_excludes_message() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 50);
        let mut demod = Demod2400::new(false);
        let mut engine = Engine::new(1, false);
        let mut out = Vec::new();
        demod.process_block(&m, 0, &mut engine, &mut out);
        assert_eq!(out.len(), 1);
        // The quiet head of the buffer contributes zero power
        assert!(engine.stats.noise_count > 0);
        let mean = engine.stats.mean_noise_power().unwrap();
        assert!(mean < 100.0, "message samples leaked into noise: {mean}");
    }
}
