//! Configuration and command-line argument parsing

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::InitError;

#[derive(Debug, Clone)]
pub struct Config {
    // Sampling
    /// 2_000_000 or 2_400_000; selects the demodulator variant.
    pub sample_rate: u32,
    pub dev_index: u32,
    pub freq: u32,
    /// Gain in tenths of dB; negative means automatic.
    pub gain: i32,

    // Input
    pub filename: Option<String>,
    pub loop_file: bool,

    // Processing
    /// Max correctable bit errors, 0 disables repair.
    pub fix_bits: usize,
    pub phase_enhance: bool,
    /// Reject frames that needed any correction.
    pub check_crc: bool,
    /// Minimum SNR in dB.
    pub squelch_db: f64,
    pub receiver_lat: Option<f64>,
    pub receiver_lon: Option<f64>,
    /// Accept Mode A/C frames on BEAST input (counted only).
    pub mode_ac: bool,
    /// Aircraft expiry in seconds.
    pub ttl_secs: u64,

    // Networking
    pub net: bool,
    pub net_only: bool,
    pub net_bind_address: String,
    pub net_ri_port: u16,
    pub net_ro_port: u16,
    pub net_sbs_port: u16,
    pub net_bi_port: u16,
    pub net_bo_port: u16,
    pub net_http_port: u16,

    // Output
    pub json_path: Option<PathBuf>,
    pub json_interval: u64,
    pub stats: bool,
    pub raw: bool,
    pub onlyaddr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 2_400_000,
            dev_index: 0,
            freq: 1_090_000_000,
            gain: 999_999, // max
            filename: None,
            loop_file: false,
            fix_bits: 1,
            phase_enhance: false,
            check_crc: false,
            squelch_db: 4.0,
            receiver_lat: None,
            receiver_lon: None,
            mode_ac: false,
            ttl_secs: 300,
            net: false,
            net_only: false,
            net_bind_address: "0.0.0.0".to_string(),
            net_ri_port: 30001,
            net_ro_port: 30002,
            net_sbs_port: 30003,
            net_bi_port: 30004,
            net_bo_port: 30005,
            net_http_port: 8080,
            json_path: None,
            json_interval: 1,
            stats: false,
            raw: false,
            onlyaddr: false,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, InitError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| InitError::Config(format!("{flag} requires a value")))
}

fn parse<T: FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, InitError> {
    let v = value(args, i, flag)?;
    v.parse()
        .map_err(|_| InitError::Config(format!("{flag}: cannot parse '{v}'")))
}

impl Config {
    pub fn parse_args() -> Result<Self, InitError> {
        let args: Vec<String> = env::args().skip(1).collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, InitError> {
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--sample-rate" => {
                    i += 1;
                    config.sample_rate = parse(args, i, "--sample-rate")?;
                }
                "--device-index" => {
                    i += 1;
                    config.dev_index = parse(args, i, "--device-index")?;
                }
                "--freq" => {
                    i += 1;
                    config.freq = parse(args, i, "--freq")?;
                }
                "--gain" => {
                    i += 1;
                    let db: f64 = parse(args, i, "--gain")?;
                    config.gain = (db * 10.0) as i32;
                }
                "--ifile" => {
                    i += 1;
                    config.filename = Some(value(args, i, "--ifile")?.to_string());
                }
                "--loop" => config.loop_file = true,
                "--fix" => {
                    i += 1;
                    config.fix_bits = parse(args, i, "--fix")?;
                }
                "--no-fix" => config.fix_bits = 0,
                "--phase-enhance" => config.phase_enhance = true,
                "--check-crc" => config.check_crc = true,
                "--squelch" => {
                    i += 1;
                    config.squelch_db = parse(args, i, "--squelch")?;
                }
                "--lat" => {
                    i += 1;
                    config.receiver_lat = Some(parse(args, i, "--lat")?);
                }
                "--lon" => {
                    i += 1;
                    config.receiver_lon = Some(parse(args, i, "--lon")?);
                }
                "--modeac" => config.mode_ac = true,
                "--ttl" => {
                    i += 1;
                    config.ttl_secs = parse(args, i, "--ttl")?;
                }
                "--net" => config.net = true,
                "--net-only" => {
                    config.net = true;
                    config.net_only = true;
                }
                "--net-bind-address" => {
                    i += 1;
                    config.net_bind_address = value(args, i, "--net-bind-address")?.to_string();
                }
                "--net-ri-port" => {
                    i += 1;
                    config.net_ri_port = parse(args, i, "--net-ri-port")?;
                }
                "--net-ro-port" => {
                    i += 1;
                    config.net_ro_port = parse(args, i, "--net-ro-port")?;
                }
                "--net-sbs-port" => {
                    i += 1;
                    config.net_sbs_port = parse(args, i, "--net-sbs-port")?;
                }
                "--net-bi-port" => {
                    i += 1;
                    config.net_bi_port = parse(args, i, "--net-bi-port")?;
                }
                "--net-bo-port" => {
                    i += 1;
                    config.net_bo_port = parse(args, i, "--net-bo-port")?;
                }
                "--net-http-port" => {
                    i += 1;
                    config.net_http_port = parse(args, i, "--net-http-port")?;
                }
                "--json-path" => {
                    i += 1;
                    config.json_path = Some(PathBuf::from(value(args, i, "--json-path")?));
                }
                "--json-interval" => {
                    i += 1;
                    config.json_interval = parse(args, i, "--json-interval")?;
                }
                "--stats" => config.stats = true,
                "--raw" => config.raw = true,
                "--onlyaddr" => config.onlyaddr = true,
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                unknown => {
                    return Err(InitError::Config(format!("unknown option: {unknown}")));
                }
            }
            i += 1;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), InitError> {
        if self.sample_rate != 2_000_000 && self.sample_rate != 2_400_000 {
            return Err(InitError::Config(format!(
                "--sample-rate must be 2000000 or 2400000, got {}",
                self.sample_rate
            )));
        }
        if self.fix_bits > 6 {
            return Err(InitError::Config(format!(
                "--fix must be 0..6, got {}",
                self.fix_bits
            )));
        }
        if let Some(lat) = self.receiver_lat {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(InitError::Config(format!("--lat out of range: {lat}")));
            }
        }
        if let Some(lon) = self.receiver_lon {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(InitError::Config(format!("--lon out of range: {lon}")));
            }
        }
        if self.squelch_db < 0.0 {
            return Err(InitError::Config(format!(
                "--squelch must be non-negative, got {}",
                self.squelch_db
            )));
        }
        if self.json_interval == 0 {
            return Err(InitError::Config("--json-interval must be at least 1".into()));
        }
        Ok(())
    }

    /// The receiver reference, when both coordinates were given.
    pub fn receiver_position(&self) -> Option<(f64, f64)> {
        match (self.receiver_lat, self.receiver_lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

fn print_help() {
    println!(
        r#"rx1090 - Mode S / ADS-B software receiver

Usage: rx1090 [OPTIONS]

Options:
  --sample-rate <hz>     2000000 or 2400000 (default: 2400000)
  --device-index <n>     Select SDR device (default: 0)
  --freq <hz>            Tuner frequency (default: 1090 MHz)
  --gain <db>            Gain in dB; negative for automatic
  --ifile <path>         Read samples from file ('-' for stdin)
  --loop                 With --ifile, read the file in a loop
  --fix <n>              Max correctable bit errors, 0..6 (default: 1;
                         table build cost grows steeply past 2)
  --no-fix               Same as --fix 0
  --phase-enhance        Try harder on out-of-phase candidates
  --check-crc            Reject frames that needed bit corrections
  --squelch <db>         Minimum SNR (default: 4.0)
  --lat <deg>            Receiver latitude
  --lon <deg>            Receiver longitude
  --modeac               Accept Mode A/C frames on BEAST input
  --ttl <s>              Aircraft expiry (default: 300)
  --net                  Enable network servers
  --net-only             Network servers only, no demodulation
  --net-bind-address <a> Bind address for all servers (default: 0.0.0.0)
  --net-ri-port <port>   Raw (AVR) input (default: 30001)
  --net-ro-port <port>   Raw (AVR) output (default: 30002)
  --net-sbs-port <port>  SBS/BaseStation output (default: 30003)
  --net-bi-port <port>   BEAST input (default: 30004; 10001 also bound)
  --net-bo-port <port>   BEAST output (default: 30005)
  --net-http-port <port> HTTP JSON (default: 8080)
  --json-path <path>     Periodic aircraft snapshot file
  --json-interval <s>    Snapshot period (default: 1)
  --stats                Print statistics at exit
  --raw                  Print raw frames to stdout
  --onlyaddr             Print only ICAO addresses
  --help                 Show this help
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(&[]).unwrap();
        assert_eq!(config.sample_rate, 2_400_000);
        assert_eq!(config.fix_bits, 1);
        assert_eq!(config.ttl_secs, 300);
        assert_eq!(config.net_ri_port, 30001);
        assert!((config.squelch_db - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_options() {
        let config = Config::from_args(&args(&[
            "--sample-rate",
            "2000000",
            "--fix",
            "2",
            "--phase-enhance",
            "--lat",
            "52.0",
            "--lon",
            "4.1",
            "--net",
        ]))
        .unwrap();
        assert_eq!(config.sample_rate, 2_000_000);
        assert_eq!(config.fix_bits, 2);
        assert!(config.phase_enhance);
        assert_eq!(config.receiver_position(), Some((52.0, 4.1)));
        assert!(config.net);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(Config::from_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_args(&args(&["--sample-rate", "1000000"])).is_err());
        assert!(Config::from_args(&args(&["--fix", "7"])).is_err());
        assert!(Config::from_args(&args(&["--lat", "95"])).is_err());
        assert!(Config::from_args(&args(&["--squelch"])).is_err());
    }

    #[test]
    fn test_partial_position_is_not_a_reference() {
        let config = Config::from_args(&args(&["--lat", "52.0"])).unwrap();
        assert_eq!(config.receiver_position(), None);
    }
}
