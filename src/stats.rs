//! Receiver statistics
//!
//! Counters incremented along the pipeline. Rejections at the demodulator,
//! CRC and parser levels surface here and nowhere else.

use std::fmt;

#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Raw sample blocks handed to the decoder.
    pub blocks_processed: u64,
    /// Blocks dropped because the ring was full.
    pub blocks_dropped: u64,
    /// Magnitude samples examined.
    pub samples_processed: u64,
    /// Preambles that passed the gate checks.
    pub valid_preambles: u64,
    /// Candidates rejected for low SNR.
    pub low_snr: u64,
    /// Candidates that failed scoring or CRC with no viable repair.
    pub bad_crc: u64,
    /// Messages accepted after repairing n bit errors (index n-1).
    pub crc_fixed: [u64; crate::crc::MAX_FIX_BITS],
    /// Accepted with zero corrected bits.
    pub good_crc: u64,
    /// Address/Parity frames whose recovered address was never seen.
    pub unknown_address: u64,
    /// Frames dropped because --check-crc forbids corrected bits.
    pub rejected_corrected: u64,
    /// Frames with a downlink format the parser always rejects.
    pub unknown_format: u64,
    /// Messages fully decoded and delivered to the tracker.
    pub messages: u64,
    /// Frames received over the network inputs.
    pub net_frames: u64,
    /// Mode A/C frames seen on BEAST input (counted, not decoded).
    pub mode_ac_frames: u64,
    /// CPR outcomes.
    pub cpr_global: u64,
    pub cpr_relative: u64,
    pub cpr_failed: u64,
    /// Rolling noise estimate kept by the 2.4 MS/s demodulator.
    pub noise_power: u64,
    pub noise_count: u64,
}

impl Stats {
    pub fn record_fix(&mut self, corrected_bits: u8) {
        if corrected_bits == 0 {
            self.good_crc += 1;
        } else {
            let idx = (corrected_bits as usize - 1).min(self.crc_fixed.len() - 1);
            self.crc_fixed[idx] += 1;
        }
    }

    /// Mean noise power per sample, if any noise was measured.
    pub fn mean_noise_power(&self) -> Option<f64> {
        if self.noise_count == 0 {
            None
        } else {
            Some(self.noise_power as f64 / self.noise_count as f64)
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} sample blocks processed", self.blocks_processed)?;
        writeln!(f, "{} sample blocks dropped", self.blocks_dropped)?;
        writeln!(f, "{} samples examined", self.samples_processed)?;
        writeln!(f, "{} valid preambles", self.valid_preambles)?;
        writeln!(f, "{} rejected: low SNR", self.low_snr)?;
        writeln!(f, "{} rejected: bad CRC", self.bad_crc)?;
        writeln!(f, "{} rejected: unknown address", self.unknown_address)?;
        writeln!(f, "{} rejected: unknown format", self.unknown_format)?;
        writeln!(f, "{} rejected: corrected bits not allowed", self.rejected_corrected)?;
        writeln!(f, "{} accepted with correct CRC", self.good_crc)?;
        for (i, n) in self.crc_fixed.iter().enumerate() {
            if *n > 0 {
                writeln!(f, "{} accepted after fixing {} bit(s)", n, i + 1)?;
            }
        }
        writeln!(f, "{} network frames", self.net_frames)?;
        if self.mode_ac_frames > 0 {
            writeln!(f, "{} Mode A/C frames (not decoded)", self.mode_ac_frames)?;
        }
        writeln!(
            f,
            "{} global / {} relative CPR fixes, {} failures",
            self.cpr_global, self.cpr_relative, self.cpr_failed
        )?;
        if let Some(noise) = self.mean_noise_power() {
            writeln!(f, "mean noise power: {:.1}", noise)?;
        }
        write!(f, "{} messages delivered", self.messages)
    }
}
