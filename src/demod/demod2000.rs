//! 2 MS/s Mode S demodulator
//!
//! At this rate each 0.5 us sample is one half-symbol: a bit is sliced by
//! comparing the two samples of its symbol pair. The preamble occupies 16
//! samples with pulses at 0, 2, 7 and 9.

use crate::decoder::{self, Engine, LONG_MSG_BITS, LONG_MSG_BYTES, ParsedMessage};
use crate::magnitude::Log10Lut;

/// Preamble length in samples.
const PREAMBLE_SAMPLES: usize = 16;

/// Samples a frame can extend past its starting index.
pub const LOOKAHEAD: usize = PREAMBLE_SAMPLES + LONG_MSG_BITS * 2 + 2;

/// Candidates with more slicing ambiguities than this are abandoned.
const MAX_ENCODING_ERRORS: u32 = 3;

/// Result of slicing one candidate: packed bytes plus the error bookkeeping
/// needed for the DF-guess recheck and the length decision.
struct Sliced {
    msg: [u8; LONG_MSG_BYTES],
    errors_56: u32,
    errors_112: u32,
    /// Bits 0..5 that had to be guessed because their sample pair was equal.
    guess_mask: u8,
}

pub struct Demod2000 {
    phase_enhance: bool,
    /// Squelch threshold: `2 * snr` (0.2 dB units) must exceed this.
    snr_threshold: i32,
    log10: Log10Lut,
    /// Scratch for the phase-corrected re-slice.
    scratch: Vec<u16>,
}

impl Demod2000 {
    pub fn new(phase_enhance: bool, squelch_db: f64) -> Self {
        Self {
            phase_enhance,
            snr_threshold: (10.0 * squelch_db).round() as i32,
            log10: Log10Lut::new(),
            scratch: vec![0; LOOKAHEAD],
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

        let mut j = 0;
        while j < limit {
            // Exact pulse ordering of the preamble
            if !(m[j] > m[j + 1]
                && m[j + 1] < m[j + 2]
                && m[j + 2] > m[j + 3]
                && m[j + 3] < m[j]
                && m[j + 4] < m[j]
                && m[j + 5] < m[j]
                && m[j + 6] < m[j]
                && m[j + 7] > m[j + 8]
                && m[j + 8] < m[j + 9]
                && m[j + 9] > m[j + 6])
            {
                j += 1;
                continue;
            }

            let high =
                ((m[j] as u32 + m[j + 2] as u32 + m[j + 7] as u32 + m[j + 9] as u32) / 6) as u16;

            // The troughs inside the preamble must stay below the pulse level
            if m[j + 4] >= high || m[j + 5] >= high {
                j += 1;
                continue;
            }
            // So must the quiet gap before the first data symbol
            if m[j + 11] >= high || m[j + 12] >= high || m[j + 13] >= high || m[j + 14] >= high {
                j += 1;
                continue;
            }

            engine.stats.valid_preambles += 1;

            let first = self.try_candidate(&m[j..], base_ts + j as u64 * 6, engine);

            let retry_worthwhile = match &first {
                None => true,
                Some(pm) => pm.corrected_bits > 0,
            };

            let result = if retry_worthwhile
                && self.phase_enhance
                && detect_phase_skew(m, j) != 0
            {
                // Copy the candidate's samples, redistribute energy between
                // adjacent half-symbols and slice exactly once more.
                self.scratch.clear();
                self.scratch.extend_from_slice(&m[j..j + LOOKAHEAD]);
                apply_phase_correction(&mut self.scratch);
                let scratch = std::mem::take(&mut self.scratch);
                let retry = self.try_candidate(&scratch, base_ts + j as u64 * 6, engine);
                self.scratch = scratch;

                match (first, retry) {
                    (Some(a), Some(b)) => {
                        if b.corrected_bits < a.corrected_bits {
                            Some(b)
                        } else {
                            Some(a)
                        }
                    }
                    (None, b) => b,
                    (a, None) => a,
                }
            } else {
                first
            };

            if let Some(pm) = result {
                j += PREAMBLE_SAMPLES + pm.bits * 2;
                out.push(pm);
            } else {
                j += 1;
            }
        }
    }

    /// Slice, squelch and decode one candidate whose preamble starts at
    /// `m[0]`.
    fn try_candidate(
        &self,
        m: &[u16],
        timestamp: u64,
        engine: &mut Engine,
    ) -> Option<ParsedMessage> {
        let sliced = slice_candidate(&m[PREAMBLE_SAMPLES..]);

        let mut msg = sliced.msg;
        let mut df = msg[0] >> 3;

        // If one DF bit was guessed and the result is not an assigned
        // format, the other guess may be the right one.
        if !decoder::is_known_df(df) && sliced.guess_mask.count_ones() == 1 {
            let bit = sliced.guess_mask.trailing_zeros() as u8;
            let flipped = msg[0] ^ (0x80 >> bit);
            if decoder::is_known_df(flipped >> 3) {
                msg[0] = flipped;
                df = flipped >> 3;
            }
        }
        if !decoder::is_known_df(df) {
            return None;
        }

        let bits = decoder::frame_bits(df);
        let errors = if bits == 112 {
            sliced.errors_112
        } else {
            sliced.errors_56
        };
        if errors > MAX_ENCODING_ERRORS {
            return None;
        }

        // SNR over the first 56 bits: one sample of each pair is signal,
        // the other noise.
        let mut sig: u32 = 0;
        let mut noise: u32 = 0;
        for i in 0..56 {
            let idx = PREAMBLE_SAMPLES + i * 2;
            let bit = msg[i / 8] & (0x80 >> (i % 8)) != 0;
            if bit {
                sig += m[idx] as u32;
                noise += m[idx + 1] as u32;
            } else {
                sig += m[idx + 1] as u32;
                noise += m[idx] as u32;
            }
        }
        while sig > 0xFFFF || noise > 0xFFFF {
            sig >>= 1;
            noise >>= 1;
        }
        let snr = self.log10.lookup(sig) - self.log10.lookup(noise);
        if 2 * snr <= self.snr_threshold {
            engine.stats.low_snr += 1;
            return None;
        }

        engine.decode(&msg[..bits / 8], timestamp, snr.clamp(0, 255) as u8)
    }
}

/// Slice all 112 bit positions from the payload samples, guessing the
/// ambiguous bits of the DF field and counting ambiguities elsewhere.
fn slice_candidate(payload: &[u16]) -> Sliced {
    let mut msg = [0u8; LONG_MSG_BYTES];
    let mut errors_56 = 0;
    let mut errors_112 = 0;
    let mut guess_mask = 0u8;

    for i in 0..LONG_MSG_BITS {
        let a = payload[i * 2];
        let b = payload[i * 2 + 1];

        let bit = if a > b {
            1u8
        } else if a < b {
            0u8
        } else {
            // Equal samples: an encoding error. In the DF field guess the
            // statistically likely value so the length decision can still
            // be made.
            if i < 56 {
                errors_56 += 1;
            }
            errors_112 += 1;
            if i < 5 {
                guess_mask |= 1 << i;
                if i == 0 { 1 } else { 0 }
            } else {
                0
            }
        };
        msg[i / 8] |= bit << (7 - i % 8);
    }

    Sliced {
        msg,
        errors_56,
        errors_112,
        guess_mask,
    }
}

/// Compare energy just before and after the expected pulse positions to
/// detect a half-sample skew. Positive means the signal runs late, negative
/// early, zero means aligned.
fn detect_phase_skew(m: &[u16], j: usize) -> i32 {
    if m[j + 3] > m[j + 2] / 3 {
        return 1;
    }
    if m[j + 10] > m[j + 9] / 3 {
        return 1;
    }
    if m[j + 6] > m[j + 7] / 3 {
        return -1;
    }
    if j > 0 && m[j - 1] > m[j + 1] / 3 {
        return -1;
    }
    0
}

/// Redistribute energy between adjacent payload samples: after a one bit
/// the following sample is boosted, after a zero bit it is attenuated.
/// Operates on a copy of the candidate's samples (preamble at index 0).
fn apply_phase_correction(samples: &mut [u16]) {
    for i in (0..(LONG_MSG_BITS - 1) * 2).step_by(2) {
        let idx = PREAMBLE_SAMPLES + i;
        if idx + 2 >= samples.len() {
            break;
        }
        if samples[idx] > samples[idx + 1] {
            samples[idx + 2] = ((samples[idx + 2] as u32 * 5) / 4).min(65535) as u16;
        } else {
            samples[idx + 2] = ((samples[idx + 2] as u32 * 4) / 5) as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    const HIGH: u16 = 2000;
    const LOW: u16 = 100;

    /// Build a magnitude buffer containing one frame at the given offset.
    fn synthesize(frame: &[u8], offset: usize) -> Vec<u16> {
        let mut m = vec![LOW; offset + LOOKAHEAD + 512];
        // Preamble pulses at 0, 2, 7, 9
        for p in [0, 2, 7, 9] {
            m[offset + p] = HIGH;
        }
        for (i, byte) in frame.iter().enumerate() {
            for b in 0..8 {
                let bit = byte & (0x80 >> b) != 0;
                let idx = offset + PREAMBLE_SAMPLES + (i * 8 + b) * 2;
                if bit {
                    m[idx] = HIGH;
                } else {
                    m[idx + 1] = HIGH;
                }
            }
        }
        m
    }

    fn decode_all(m: &[u16]) -> Vec<ParsedMessage> {
        let mut demod = Demod2000::new(false, 4.0);
        let mut engine = Engine::new(1, false);
        let mut out = Vec::new();
        demod.process_block(m, 0, &mut engine, &mut out);
        out
    }

    #[test]
    fn test_decodes_synthesized_frame() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 40);
        let out = decode_all(&m);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), &frame[..]);
        assert_eq!(out[0].addr, 0x4840D6);
        assert_eq!(out[0].timestamp, 40 * 6);
    }

    #[test]
    fn test_dc_offset_invariance() {
        // Adding a constant to every sample must not change the decode
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 40);
        let shifted: Vec<u16> = m.iter().map(|&s| s + 500).collect();

        let a = decode_all(&m);
        let b = decode_all(&shifted);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].payload(), b[0].payload());
    }

    #[test]
    fn test_rejects_on_low_snr() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let mut m = synthesize(&frame, 40);
        // Raise the noise floor close to the signal: the preamble gate
        // still passes (troughs stay under the pulse threshold) but the
        // squelch must reject the candidate.
        for s in m.iter_mut() {
            if *s == LOW {
                *s = HIGH - 700;
            }
        }
        let mut demod = Demod2000::new(false, 4.0);
        let mut engine = Engine::new(1, false);
        let mut out = Vec::new();
        demod.process_block(&m, 0, &mut engine, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_skips_past_decoded_frame() {
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let m = synthesize(&frame, 40);
        let out = decode_all(&m);
        // The frame body must not be re-detected as a second frame
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_slice_guesses_df_bits() {
        // Equal pair in bit 0: guessed as one
        let mut payload = vec![LOW; LONG_MSG_BITS * 2];
        payload[0] = 500;
        payload[1] = 500; // ambiguous
        for i in 1..LONG_MSG_BITS {
            payload[i * 2 + 1] = HIGH; // zeros elsewhere
        }
        let sliced = slice_candidate(&payload);
        assert_eq!(sliced.guess_mask, 0x01);
        assert_eq!(sliced.msg[0] & 0x80, 0x80);
        assert_eq!(sliced.errors_112, 1);
    }
}
