//! Mode S frame parser and plausibility scorer
//!
//! The `Engine` owns every table the parser needs: the CRC syndrome tables,
//! the recently-seen address filter and the statistics counters. Scoring is
//! read-only; decoding repairs the frame where allowed and populates a
//! `ParsedMessage`.

use std::fmt;

use crate::cpr::RawCpr;
use crate::crc::{self, Crc, ErrorInfo};
use crate::icao_filter::IcaoFilter;
use crate::stats::Stats;

pub const LONG_MSG_BITS: usize = 112;
pub const SHORT_MSG_BITS: usize = 56;
pub const LONG_MSG_BYTES: usize = 14;
pub const SHORT_MSG_BYTES: usize = 7;

/// Frame length is a pure function of the top five bits.
pub fn frame_bits(df_raw: u8) -> usize {
    if df_raw >= 16 { LONG_MSG_BITS } else { SHORT_MSG_BITS }
}

/// Downlink formats the receiver will ever accept. Anything else is
/// `Other` and always rejected.
pub fn is_known_df(df_raw: u8) -> bool {
    matches!(df_raw, 0 | 4 | 5 | 11 | 16 | 17 | 18 | 19 | 20 | 21 | 22 | 24)
}

/// Downlink Format, the top 5 bits of every Mode S frame.
/// Raw values 24..=31 all carry Comm-D (only the first two bits count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkFormat {
    /// DF 0, short air-air surveillance (ACAS)
    ShortAirAir,
    /// DF 4, surveillance altitude reply
    SurveillanceAltitude,
    /// DF 5, surveillance identity reply
    SurveillanceIdentity,
    /// DF 11, all-call reply
    AllCallReply,
    /// DF 16, long air-air surveillance (ACAS)
    LongAirAir,
    /// DF 17, extended squitter
    ExtendedSquitter,
    /// DF 18, extended squitter from a non-transponder
    ExtendedSquitterNt,
    /// DF 20, Comm-B altitude reply
    CommBAltitude,
    /// DF 21, Comm-B identity reply
    CommBIdentity,
    /// DF 24, Comm-D extended length message
    CommD,
    Other(u8),
}

impl DownlinkFormat {
    pub fn from_raw(df_raw: u8) -> Self {
        match df_raw {
            0 => Self::ShortAirAir,
            4 => Self::SurveillanceAltitude,
            5 => Self::SurveillanceIdentity,
            11 => Self::AllCallReply,
            16 => Self::LongAirAir,
            17 => Self::ExtendedSquitter,
            18 => Self::ExtendedSquitterNt,
            20 => Self::CommBAltitude,
            21 => Self::CommBIdentity,
            24..=31 => Self::CommD,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::ShortAirAir => 0,
            Self::SurveillanceAltitude => 4,
            Self::SurveillanceIdentity => 5,
            Self::AllCallReply => 11,
            Self::LongAirAir => 16,
            Self::ExtendedSquitter => 17,
            Self::ExtendedSquitterNt => 18,
            Self::CommBAltitude => 20,
            Self::CommBIdentity => 21,
            Self::CommD => 24,
            Self::Other(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltitudeUnit {
    Feet,
    Meters,
}

/// A fully decoded Mode S message. Optional fields are populated when the
/// downlink format carries them; `None` means not present in this frame.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub raw: [u8; LONG_MSG_BYTES],
    pub bits: usize,
    pub df: DownlinkFormat,
    /// 24-bit ICAO address, from the frame or recovered from the parity
    /// overlay.
    pub addr: u32,
    /// Syndrome before any repair.
    pub syndrome: u32,
    pub corrected_bits: u8,
    /// 12 MHz sample clock at frame start.
    pub timestamp: u64,
    /// SNR in 0.2 dB units, clamped to a byte.
    pub signal_level: u8,

    /// CA field (DF 11/17), FS field meaning for DF 4/5/20/21.
    pub capability: u8,
    pub flight_status: Option<u8>,
    pub me_type: u8,
    pub me_sub: u8,

    pub altitude: Option<i32>,
    pub altitude_unit: AltitudeUnit,
    pub squawk: Option<u16>,
    /// 8 characters, AIS charset, trailing spaces preserved.
    pub callsign: Option<String>,
    pub category: Option<u8>,
    pub ground_speed: Option<u16>,
    pub airspeed: Option<u16>,
    pub heading: Option<f64>,
    pub ew_velocity: Option<i32>,
    pub ns_velocity: Option<i32>,
    pub vert_rate: Option<i32>,
    pub cpr: Option<RawCpr>,
    pub on_ground: Option<bool>,
}

impl ParsedMessage {
    fn new(raw: [u8; LONG_MSG_BYTES], bits: usize, df: DownlinkFormat) -> Self {
        Self {
            raw,
            bits,
            df,
            addr: 0,
            syndrome: 0,
            corrected_bits: 0,
            timestamp: 0,
            signal_level: 0,
            capability: 0,
            flight_status: None,
            me_type: 0,
            me_sub: 0,
            altitude: None,
            altitude_unit: AltitudeUnit::Feet,
            squawk: None,
            callsign: None,
            category: None,
            ground_speed: None,
            airspeed: None,
            heading: None,
            ew_velocity: None,
            ns_velocity: None,
            vert_rate: None,
            cpr: None,
            on_ground: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[..self.bits / 8]
    }
}

impl fmt::Display for ParsedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*")?;
        for byte in self.payload() {
            write!(f, "{byte:02X}")?;
        }
        writeln!(f, ";")?;

        if self.corrected_bits > 0 {
            writeln!(
                f,
                "CRC: {:06x} ({} bit(s) corrected)",
                self.syndrome, self.corrected_bits
            )?;
        } else {
            writeln!(f, "CRC: {:06x}", self.syndrome)?;
        }
        writeln!(f, "ICAO Address: {:06x}", self.addr)?;

        match self.df {
            DownlinkFormat::ShortAirAir => writeln!(f, "DF 0: Short Air-Air Surveillance.")?,
            DownlinkFormat::SurveillanceAltitude => {
                writeln!(f, "DF 4: Surveillance, Altitude Reply.")?
            }
            DownlinkFormat::SurveillanceIdentity => {
                writeln!(f, "DF 5: Surveillance, Identity Reply.")?
            }
            DownlinkFormat::AllCallReply => writeln!(f, "DF 11: All Call Reply.")?,
            DownlinkFormat::LongAirAir => writeln!(f, "DF 16: Long Air-Air Surveillance.")?,
            DownlinkFormat::ExtendedSquitter | DownlinkFormat::ExtendedSquitterNt => {
                writeln!(f, "DF {}: Extended Squitter.", self.df.as_u8())?;
                writeln!(f, "  ME Type: {} Sub: {}", self.me_type, self.me_sub)?;
            }
            DownlinkFormat::CommBAltitude => writeln!(f, "DF 20: Comm-B, Altitude Reply.")?,
            DownlinkFormat::CommBIdentity => writeln!(f, "DF 21: Comm-B, Identity Reply.")?,
            DownlinkFormat::CommD => writeln!(f, "DF 24: Comm-D ELM.")?,
            DownlinkFormat::Other(v) => writeln!(f, "DF {v}: not decoded.")?,
        }

        if let Some(alt) = self.altitude {
            let unit = match self.altitude_unit {
                AltitudeUnit::Feet => "feet",
                AltitudeUnit::Meters => "meters",
            };
            writeln!(f, "  Altitude: {alt} {unit}")?;
        }
        if let Some(squawk) = self.squawk {
            writeln!(f, "  Squawk: {squawk:04}")?;
        }
        if let Some(ref callsign) = self.callsign {
            writeln!(f, "  Identification: {callsign}")?;
        }
        if let Some(speed) = self.ground_speed {
            writeln!(f, "  Ground Speed: {speed} kt")?;
        }
        if let Some(heading) = self.heading {
            writeln!(f, "  Heading: {heading:.1}")?;
        }
        if let Some(rate) = self.vert_rate {
            writeln!(f, "  Vertical rate: {rate} ft/min")?;
        }
        if let Some(cpr) = self.cpr {
            writeln!(
                f,
                "  CPR: lat {} lon {} ({}, {})",
                cpr.lat,
                cpr.lon,
                if cpr.odd { "odd" } else { "even" },
                if cpr.surface { "surface" } else { "airborne" }
            )?;
        }
        Ok(())
    }
}

/// The decode engine: tables, the seen-address filter and the statistics,
/// passed by reference through the pipeline.
pub struct Engine {
    crc: Crc,
    pub icao_filter: IcaoFilter,
    pub stats: Stats,
    /// Reject every frame that needed bit corrections.
    check_crc: bool,
}

impl Engine {
    pub fn new(fix_bits: usize, check_crc: bool) -> Self {
        Self {
            crc: Crc::new(fix_bits),
            icao_filter: IcaoFilter::new(),
            stats: Stats::default(),
            check_crc,
        }
    }

    /// Compute a plausibility score for a candidate byte sequence without
    /// touching any state. Negative means undecodable.
    pub fn score(&self, msg: &[u8]) -> i32 {
        if msg.is_empty() {
            return -1;
        }
        let df_raw = msg[0] >> 3;
        let bits = frame_bits(df_raw);
        if msg.len() < bits / 8 {
            return -1;
        }
        let syndrome = crc::checksum(msg, bits);

        match df_raw {
            // Address/Parity: the syndrome *is* the sender address
            0 | 4 | 5 | 16 | 24..=31 => {
                if self.icao_filter.test(syndrome) { 1000 } else { -1 }
            }
            11 => {
                if syndrome == 0 {
                    // IID 0, perfect frame
                    return 2000;
                }
                let iid = syndrome & 0x7F;
                let residual = syndrome & 0xFF_FF80;
                let addr = address_field(msg);
                if residual == 0 {
                    // Interrogator ID only; the address itself is clean
                    return if self.icao_filter.test(addr) { 1500 } else { -1 };
                }
                let Some(info) = self.crc.diagnose(residual, bits) else {
                    return -1;
                };
                let corrected = correct_address(addr, info);
                if !self.icao_filter.test(corrected) {
                    return -1;
                }
                match info.errors {
                    1 if iid == 0 => 1000,
                    1 => 750,
                    e => 1000 / e as i32,
                }
            }
            17 | 18 => {
                if syndrome == 0 {
                    return 3000;
                }
                let Some(info) = self.crc.diagnose(syndrome, bits) else {
                    return -1;
                };
                let addr = address_field(msg);
                let corrected = correct_address(addr, info);
                if corrected != addr && !self.icao_filter.test(corrected) {
                    return -1;
                }
                2000 / info.errors as i32
            }
            // Comm-B: parity overlaid with the address (or Data/Parity)
            20 | 21 => {
                if self.icao_filter.test(syndrome) { 1000 } else { -1 }
            }
            _ => -1,
        }
    }

    /// Decode a candidate frame: apply the same CRC/address acceptance as
    /// the scorer, repair where allowed, and populate the typed record.
    /// Only clean DF 11 (IID 0) and clean DF 17/18 frames feed the
    /// seen-address filter.
    pub fn decode(
        &mut self,
        raw: &[u8],
        timestamp: u64,
        signal_level: u8,
    ) -> Option<ParsedMessage> {
        if raw.is_empty() {
            return None;
        }
        let df_raw = raw[0] >> 3;
        let bits = frame_bits(df_raw);
        if raw.len() < bits / 8 {
            self.stats.unknown_format += 1;
            return None;
        }

        let mut msg = [0u8; LONG_MSG_BYTES];
        msg[..bits / 8].copy_from_slice(&raw[..bits / 8]);

        let df = DownlinkFormat::from_raw(df_raw);
        let syndrome = crc::checksum(&msg, bits);
        let mut corrected_bits = 0u8;

        let addr = match df {
            DownlinkFormat::ShortAirAir
            | DownlinkFormat::SurveillanceAltitude
            | DownlinkFormat::SurveillanceIdentity
            | DownlinkFormat::LongAirAir
            | DownlinkFormat::CommD => {
                // Address/Parity: plausible only if recently seen
                if !self.icao_filter.test(syndrome) {
                    self.stats.unknown_address += 1;
                    return None;
                }
                syndrome
            }
            DownlinkFormat::AllCallReply => {
                if syndrome == 0 {
                    address_field(&msg)
                } else {
                    let residual = syndrome & 0xFF_FF80;
                    if residual == 0 {
                        // Nonzero IID, address bits intact
                        let addr = address_field(&msg);
                        if !self.icao_filter.test(addr) {
                            self.stats.unknown_address += 1;
                            return None;
                        }
                        addr
                    } else {
                        let Some(info) = self.crc.diagnose(residual, bits).copied() else {
                            self.stats.bad_crc += 1;
                            return None;
                        };
                        Crc::repair(&mut msg, &info);
                        corrected_bits = info.errors;
                        let addr = address_field(&msg);
                        if !self.icao_filter.test(addr) {
                            self.stats.unknown_address += 1;
                            return None;
                        }
                        addr
                    }
                }
            }
            DownlinkFormat::ExtendedSquitter | DownlinkFormat::ExtendedSquitterNt => {
                if syndrome == 0 {
                    address_field(&msg)
                } else {
                    let Some(info) = self.crc.diagnose(syndrome, bits).copied() else {
                        self.stats.bad_crc += 1;
                        return None;
                    };
                    let before = address_field(&msg);
                    Crc::repair(&mut msg, &info);
                    corrected_bits = info.errors;
                    let addr = address_field(&msg);
                    // A repair touching the address needs independent
                    // corroboration
                    if addr != before && !self.icao_filter.test(addr) {
                        self.stats.unknown_address += 1;
                        return None;
                    }
                    addr
                }
            }
            DownlinkFormat::CommBAltitude | DownlinkFormat::CommBIdentity => {
                if self.icao_filter.test(syndrome) {
                    syndrome
                } else if let Some(full) = self.icao_filter.test_fuzzy(syndrome & 0xFFFF) {
                    // Data/Parity overlay: top byte of the syndrome is data
                    full
                } else {
                    self.stats.unknown_address += 1;
                    return None;
                }
            }
            DownlinkFormat::Other(_) => {
                self.stats.unknown_format += 1;
                return None;
            }
        };

        if self.check_crc && corrected_bits > 0 {
            self.stats.rejected_corrected += 1;
            return None;
        }

        let mut pm = ParsedMessage::new(msg, bits, df);
        pm.addr = addr;
        pm.syndrome = syndrome;
        pm.corrected_bits = corrected_bits;
        pm.timestamp = timestamp;
        pm.signal_level = signal_level;
        pm.capability = msg[0] & 0x07;

        match df {
            DownlinkFormat::ShortAirAir | DownlinkFormat::LongAirAir => {
                // VS bit: on the ground when set
                pm.on_ground = Some(msg[0] & 0x04 != 0);
                decode_ac13_into(&mut pm);
            }
            DownlinkFormat::SurveillanceAltitude | DownlinkFormat::CommBAltitude => {
                pm.flight_status = Some(msg[0] & 0x07);
                pm.on_ground = flight_status_ground(msg[0] & 0x07);
                decode_ac13_into(&mut pm);
            }
            DownlinkFormat::SurveillanceIdentity | DownlinkFormat::CommBIdentity => {
                pm.flight_status = Some(msg[0] & 0x07);
                pm.on_ground = flight_status_ground(msg[0] & 0x07);
                let field = ((msg[2] as u32 & 0x1F) << 8) | msg[3] as u32;
                if field != 0 {
                    pm.squawk = Some(squawk_decimal(decode_id13(field)));
                }
            }
            DownlinkFormat::AllCallReply => {}
            DownlinkFormat::ExtendedSquitter | DownlinkFormat::ExtendedSquitterNt => {
                decode_extended_squitter(&mut pm);
            }
            DownlinkFormat::CommD | DownlinkFormat::Other(_) => {}
        }

        // BDS 2,0: Comm-B aircraft identification register
        if matches!(
            df,
            DownlinkFormat::CommBAltitude | DownlinkFormat::CommBIdentity
        ) && msg[4] == 0x20
        {
            if let Some(callsign) = decode_ais_callsign(&msg[5..11]) {
                pm.callsign = Some(callsign);
            }
        }

        match df {
            DownlinkFormat::AllCallReply if syndrome == 0 => self.icao_filter.add(addr),
            DownlinkFormat::ExtendedSquitter | DownlinkFormat::ExtendedSquitterNt
                if corrected_bits == 0 =>
            {
                self.icao_filter.add(addr)
            }
            _ => {}
        }

        self.stats.record_fix(corrected_bits);
        self.stats.messages += 1;
        Some(pm)
    }
}

/// The AA field of DF 11/17/18 frames, message bits 8..32.
fn address_field(msg: &[u8]) -> u32 {
    ((msg[1] as u32) << 16) | ((msg[2] as u32) << 8) | msg[3] as u32
}

/// Apply the address-field part of a diagnosed error pattern to a
/// tentatively recovered address.
fn correct_address(addr: u32, info: &ErrorInfo) -> u32 {
    let mut addr = addr;
    for &bit in info.positions() {
        let bit = bit as u32;
        if (8..32).contains(&bit) {
            addr ^= 1 << (31 - bit);
        }
    }
    addr
}

/// FS field: 1 and 3 report on-ground, 0 and 2 airborne, the rest carry no
/// air/ground information.
fn flight_status_ground(fs: u8) -> Option<bool> {
    match fs {
        0 | 2 => Some(false),
        1 | 3 => Some(true),
        _ => None,
    }
}

/// AIS charset for callsign decoding (6 bits per character).
const AIS_CHARSET: &[u8; 64] = b"?ABCDEFGHIJKLMNOPQRSTUVWXYZ????? ???????????????0123456789??????";

/// Decode 8 AIS characters from 6 packed bytes. Returns None if any
/// character falls outside the charset or the result is all blank.
/// Trailing spaces are part of the callsign and preserved.
fn decode_ais_callsign(packed: &[u8]) -> Option<String> {
    let indices = [
        (packed[0] >> 2) as usize,
        (((packed[0] & 0x03) << 4) | (packed[1] >> 4)) as usize,
        (((packed[1] & 0x0F) << 2) | (packed[2] >> 6)) as usize,
        (packed[2] & 0x3F) as usize,
        (packed[3] >> 2) as usize,
        (((packed[3] & 0x03) << 4) | (packed[4] >> 4)) as usize,
        (((packed[4] & 0x0F) << 2) | (packed[5] >> 6)) as usize,
        (packed[5] & 0x3F) as usize,
    ];

    let mut callsign = String::with_capacity(8);
    for idx in indices {
        let c = AIS_CHARSET[idx];
        if c == b'?' {
            return None;
        }
        callsign.push(c as char);
    }
    if callsign.bytes().all(|c| c == b' ') {
        return None;
    }
    Some(callsign)
}

/// Extended squitter (DF 17/18) ME field dispatch.
fn decode_extended_squitter(pm: &mut ParsedMessage) {
    let msg = pm.raw;
    pm.me_type = msg[4] >> 3;
    pm.me_sub = msg[4] & 0x07;

    match pm.me_type {
        1..=4 => {
            // Aircraft identification and category
            pm.category = Some(pm.me_type - 1);
            pm.callsign = decode_ais_callsign(&msg[5..11]);
        }
        5..=8 => {
            // Surface position
            pm.on_ground = Some(true);
            let movement = ((msg[4] as u32 & 0x07) << 4) | (msg[5] as u32 >> 4);
            if (1..125).contains(&movement) {
                pm.ground_speed = Some(decode_movement(movement));
            }
            if msg[5] & 0x08 != 0 {
                let track = ((msg[5] as u32 & 0x07) << 4) | (msg[6] as u32 >> 4);
                pm.heading = Some(track as f64 * 360.0 / 128.0);
            }
            pm.cpr = Some(extract_cpr(&msg, true));
        }
        9..=18 | 20..=22 => {
            // Airborne position (baro for 9..18, GNSS height for 20..22)
            pm.on_ground = Some(false);
            let field = ((msg[5] as u32) << 4) | (msg[6] as u32 >> 4);
            if let Some((alt, unit)) = decode_ac12(field) {
                pm.altitude = Some(alt);
                pm.altitude_unit = unit;
            }
            pm.cpr = Some(extract_cpr(&msg, false));
        }
        19 if (1..=4).contains(&pm.me_sub) => {
            decode_airborne_velocity(pm);
        }
        23 if pm.me_sub == 7 => {
            // Test message carrying a squawk
            let field = (((msg[5] as u32) << 5) | (msg[6] as u32 >> 3)) & 0x1FFF;
            if field != 0 {
                pm.squawk = Some(squawk_decimal(decode_id13(field)));
            }
        }
        28 if pm.me_sub == 1 => {
            // Emergency / priority status
            let field = (((msg[5] as u32) << 8) | msg[6] as u32) & 0x1FFF;
            if field != 0 {
                pm.squawk = Some(squawk_decimal(decode_id13(field)));
            }
        }
        _ => {}
    }
}

fn extract_cpr(msg: &[u8; LONG_MSG_BYTES], surface: bool) -> RawCpr {
    RawCpr {
        lat: ((msg[6] as u32 & 0x03) << 15) | ((msg[7] as u32) << 7) | (msg[8] as u32 >> 1),
        lon: ((msg[8] as u32 & 0x01) << 16) | ((msg[9] as u32) << 8) | msg[10] as u32,
        odd: msg[6] & 0x04 != 0,
        surface,
    }
}

fn decode_airborne_velocity(pm: &mut ParsedMessage) {
    let msg = pm.raw;
    let supersonic = pm.me_sub == 2 || pm.me_sub == 4;
    let scale = if supersonic { 4 } else { 1 };

    if pm.me_sub == 1 || pm.me_sub == 2 {
        let ew_raw = ((msg[5] as i32 & 0x03) << 8) | msg[6] as i32;
        let ns_raw = ((msg[7] as i32 & 0x7F) << 3) | (msg[8] as i32 >> 5);

        let ew = (ew_raw != 0).then(|| {
            let v = (ew_raw - 1) * scale;
            if msg[5] & 0x04 != 0 { -v } else { v }
        });
        let ns = (ns_raw != 0).then(|| {
            let v = (ns_raw - 1) * scale;
            if msg[7] & 0x80 != 0 { -v } else { v }
        });
        pm.ew_velocity = ew;
        pm.ns_velocity = ns;

        if let (Some(ew), Some(ns)) = (ew, ns) {
            let speed = ((ew * ew + ns * ns) as f64).sqrt().round() as u16;
            pm.ground_speed = Some(speed);
            if speed > 0 {
                let mut heading = (ew as f64).atan2(ns as f64).to_degrees();
                if heading < 0.0 {
                    heading += 360.0;
                }
                pm.heading = Some(heading);
            }
        }
    } else {
        // Subtypes 3/4: airspeed and magnetic heading
        if msg[5] & 0x04 != 0 {
            let raw = ((msg[5] as u32 & 0x03) << 8) | msg[6] as u32;
            pm.heading = Some(raw as f64 * 360.0 / 1024.0);
        }
        let airspeed = ((msg[7] as i32 & 0x7F) << 3) | (msg[8] as i32 >> 5);
        if airspeed != 0 {
            pm.airspeed = Some(((airspeed - 1) * scale) as u16);
        }
    }

    let vert_raw = ((msg[8] as i32 & 0x07) << 6) | (msg[9] as i32 >> 2);
    if vert_raw != 0 {
        let rate = (vert_raw - 1) * 64;
        pm.vert_rate = Some(if msg[8] & 0x08 != 0 { -rate } else { rate });
    }
}

/// Surface movement field: piecewise-linear ground speed in knots.
fn decode_movement(movement: u32) -> u16 {
    let speed = if movement > 123 {
        199 // > 175 kt
    } else if movement > 108 {
        (movement - 108) * 5 + 100
    } else if movement > 93 {
        (movement - 93) * 2 + 70
    } else if movement > 38 {
        (movement - 38) + 15
    } else if movement > 12 {
        (movement - 12) / 2 + 2
    } else if movement > 8 {
        (movement - 8) / 4 + 1
    } else {
        0
    };
    speed as u16
}

/// Rearrange a 13-bit identity field (C1 A1 C2 A2 C4 A4 X B1 D1 B2 D2 B4 D4)
/// into Gillham nibbles 0xABCD.
fn decode_id13(field: u32) -> u32 {
    let mut gillham = 0u32;

    if field & 0x1000 != 0 {
        gillham |= 0x0010; // C1
    }
    if field & 0x0800 != 0 {
        gillham |= 0x1000; // A1
    }
    if field & 0x0400 != 0 {
        gillham |= 0x0020; // C2
    }
    if field & 0x0200 != 0 {
        gillham |= 0x2000; // A2
    }
    if field & 0x0100 != 0 {
        gillham |= 0x0040; // C4
    }
    if field & 0x0080 != 0 {
        gillham |= 0x4000; // A4
    }
    // bit 6 is X (or M), never part of the code
    if field & 0x0020 != 0 {
        gillham |= 0x0100; // B1
    }
    if field & 0x0010 != 0 {
        gillham |= 0x0001; // D1 (or Q)
    }
    if field & 0x0008 != 0 {
        gillham |= 0x0200; // B2
    }
    if field & 0x0004 != 0 {
        gillham |= 0x0002; // D2
    }
    if field & 0x0002 != 0 {
        gillham |= 0x0400; // B4
    }
    if field & 0x0001 != 0 {
        gillham |= 0x0004; // D4
    }

    gillham
}

/// Gillham nibbles to a 4-digit decimal squawk (digits 0..7).
fn squawk_decimal(gillham: u32) -> u16 {
    (((gillham >> 12) & 0x7) * 1000
        + ((gillham >> 8) & 0x7) * 100
        + ((gillham >> 4) & 0x7) * 10
        + (gillham & 0x7)) as u16
}

/// Gillham (Gray coded) altitude: nibble form to 100-foot increments.
fn mode_a_to_mode_c(gillham: u32) -> Option<i32> {
    let mut five_hundreds: i32 = 0;
    let mut one_hundreds: i32 = 0;

    // D1 set is illegal; C1..C4 of zero is illegal
    if gillham & 0xFFFF_8889 != 0 || gillham & 0x0000_00F0 == 0 {
        return None;
    }

    if gillham & 0x0010 != 0 {
        one_hundreds ^= 0x007; // C1
    }
    if gillham & 0x0020 != 0 {
        one_hundreds ^= 0x003; // C2
    }
    if gillham & 0x0040 != 0 {
        one_hundreds ^= 0x001; // C4
    }

    // Remove 7s (map 7 to 5)
    if one_hundreds & 5 == 5 {
        one_hundreds ^= 2;
    }
    if one_hundreds > 5 {
        return None;
    }

    if gillham & 0x0002 != 0 {
        five_hundreds ^= 0x0FF; // D2
    }
    if gillham & 0x0004 != 0 {
        five_hundreds ^= 0x07F; // D4
    }
    if gillham & 0x1000 != 0 {
        five_hundreds ^= 0x03F; // A1
    }
    if gillham & 0x2000 != 0 {
        five_hundreds ^= 0x01F; // A2
    }
    if gillham & 0x4000 != 0 {
        five_hundreds ^= 0x00F; // A4
    }
    if gillham & 0x0100 != 0 {
        five_hundreds ^= 0x007; // B1
    }
    if gillham & 0x0200 != 0 {
        five_hundreds ^= 0x003; // B2
    }
    if gillham & 0x0400 != 0 {
        five_hundreds ^= 0x001; // B4
    }

    // Odd 500s invert the 100s direction
    if five_hundreds & 1 != 0 {
        one_hundreds = 6 - one_hundreds;
    }

    Some(five_hundreds * 5 + one_hundreds - 13)
}

fn decode_ac13_into(pm: &mut ParsedMessage) {
    let field = ((pm.raw[2] as u32 & 0x1F) << 8) | pm.raw[3] as u32;
    if let Some((alt, unit)) = decode_ac13(field) {
        pm.altitude = Some(alt);
        pm.altitude_unit = unit;
    }
}

/// 13-bit AC altitude field (DF 0/4/16/20).
fn decode_ac13(field: u32) -> Option<(i32, AltitudeUnit)> {
    if field == 0 {
        return None;
    }
    let m_bit = field & 0x0040 != 0;
    let q_bit = field & 0x0010 != 0;

    if m_bit {
        // Metric altitude: the 12-bit value with M removed, in meters
        let n = ((field & 0x1F80) >> 1) | (field & 0x003F);
        return Some((n as i32, AltitudeUnit::Meters));
    }

    if q_bit {
        // 25 ft encoding: 11-bit integer with M and Q removed
        let n = ((field & 0x1F80) >> 2) | ((field & 0x0020) >> 1) | (field & 0x000F);
        Some((n as i32 * 25 - 1000, AltitudeUnit::Feet))
    } else {
        let c = mode_a_to_mode_c(decode_id13(field))?;
        if c < -12 {
            return None;
        }
        Some((c * 100, AltitudeUnit::Feet))
    }
}

/// 12-bit AC altitude field (DF 17/18 airborne position). Identical to AC13
/// up to the missing M bit.
fn decode_ac12(field: u32) -> Option<(i32, AltitudeUnit)> {
    if field == 0 {
        return None;
    }
    let q_bit = field & 0x10 != 0;

    if q_bit {
        let n = ((field & 0x0FE0) >> 1) | (field & 0x000F);
        Some((n as i32 * 25 - 1000, AltitudeUnit::Feet))
    } else {
        // Insert M=0 to form a 13-bit Gillham field
        let n13 = ((field & 0x0FC0) << 1) | (field & 0x003F);
        let c = mode_a_to_mode_c(decode_id13(n13))?;
        if c < -12 {
            return None;
        }
        Some((c * 100, AltitudeUnit::Feet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    fn engine() -> Engine {
        Engine::new(1, false)
    }

    #[test]
    fn test_frame_bits() {
        assert_eq!(frame_bits(0), SHORT_MSG_BITS);
        assert_eq!(frame_bits(5), SHORT_MSG_BITS);
        assert_eq!(frame_bits(11), SHORT_MSG_BITS);
        assert_eq!(frame_bits(16), LONG_MSG_BITS);
        assert_eq!(frame_bits(17), LONG_MSG_BITS);
        assert_eq!(frame_bits(24), LONG_MSG_BITS);
        assert_eq!(frame_bits(31), LONG_MSG_BITS);
    }

    #[test]
    fn test_decode_identification_frame() {
        let mut engine = engine();
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let pm = engine.decode(&frame, 0, 0).expect("clean DF17 decodes");

        assert_eq!(pm.df, DownlinkFormat::ExtendedSquitter);
        assert_eq!(pm.addr, 0x4840D6);
        assert_eq!(pm.syndrome, 0);
        assert_eq!(pm.corrected_bits, 0);
        assert_eq!(pm.me_type, 4);
        assert_eq!(pm.callsign.as_deref(), Some("KLM1023 "));
        // A clean extended squitter seeds the address filter
        assert!(engine.icao_filter.test(0x4840D6));
    }

    #[test]
    fn test_score_table() {
        let mut engine = engine();
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        assert_eq!(engine.score(&frame), 3000);

        // Single-bit damage outside the address: still scores after repair
        let mut damaged = frame;
        damaged[6] ^= 0x10;
        assert_eq!(engine.score(&damaged), 2000);

        // Damage in the address field requires the corrected address to be
        // in the seen set
        let mut addr_damaged = frame;
        addr_damaged[2] ^= 0x01;
        assert_eq!(engine.score(&addr_damaged), -1);
        engine.decode(&frame, 0, 0).unwrap();
        assert_eq!(engine.score(&addr_damaged), 2000);
    }

    #[test]
    fn test_single_bit_repair() {
        let mut engine = engine();
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let mut damaged = frame;
        damaged[9] ^= 0x40;

        let pm = engine.decode(&damaged, 0, 0).expect("repairable");
        assert_eq!(pm.corrected_bits, 1);
        assert_eq!(pm.payload(), &frame[..]);
        assert_eq!(pm.addr, 0x4840D6);
        // Repaired frames never seed the address filter
        assert!(!engine.icao_filter.test(0x4840D6));
    }

    #[test]
    fn test_check_crc_rejects_corrected() {
        let mut engine = Engine::new(1, true);
        let frame = hex!("8D4840D6202CC371C32CE0576098");
        let mut damaged = frame;
        damaged[9] ^= 0x40;
        assert!(engine.decode(&damaged, 0, 0).is_none());
        assert_eq!(engine.stats.rejected_corrected, 1);
        // Clean frames still pass
        assert!(engine.decode(&frame, 0, 0).is_some());
    }

    #[test]
    fn test_address_parity_requires_seen_address() {
        let mut engine = engine();
        // A DF4 frame whose parity overlay recovers some address: rejected
        // until that address has been seen via an authoritative frame.
        let df4 = hex!("20000F1F684A6C");
        assert!(engine.decode(&df4, 0, 0).is_none());
        assert_eq!(engine.stats.unknown_address, 1);
        assert_eq!(engine.score(&df4), -1);

        let recovered = crc::checksum(&df4, 56);
        engine.icao_filter.add(recovered);
        assert_eq!(engine.score(&df4), 1000);
        let pm = engine.decode(&df4, 0, 0).expect("known address accepted");
        assert_eq!(pm.addr, recovered);
        assert_eq!(pm.df, DownlinkFormat::SurveillanceAltitude);
    }

    #[test]
    fn test_airborne_position_fields() {
        let mut engine = engine();
        // DF17 ME type 11 airborne position (even frame)
        let frame = hex!("8D40621D58C382D690C8AC2863A7");
        let pm = engine.decode(&frame, 0, 0).expect("position frame");

        assert_eq!(pm.me_type, 11);
        assert_eq!(pm.on_ground, Some(false));
        let cpr = pm.cpr.expect("raw position");
        assert!(!cpr.odd);
        assert!(!cpr.surface);
        assert_eq!(cpr.lat, 93000);
        assert_eq!(cpr.lon, 51372);
        assert_eq!(pm.altitude, Some(38000));
    }

    #[test]
    fn test_airborne_velocity_fields() {
        let mut engine = engine();
        // DF17 ME type 19 subtype 1
        let frame = hex!("8D485020994409940838175B284F");
        let pm = engine.decode(&frame, 0, 0).expect("velocity frame");

        assert_eq!(pm.me_type, 19);
        assert_eq!(pm.me_sub, 1);
        let speed = pm.ground_speed.expect("speed");
        assert_eq!(speed, 159);
        let heading = pm.heading.expect("heading");
        assert!((heading - 182.88).abs() < 0.1);
        assert_eq!(pm.vert_rate, Some(-832));
    }

    #[test]
    fn test_squawk_decode() {
        assert_eq!(squawk_decimal(decode_id13(0x0AA2)), 7500);
        // All-zero field carries no identity
        assert_eq!(decode_id13(0), 0);
    }

    #[test]
    fn test_ac12_q_bit() {
        // Q set: 25 ft steps
        let field = 0b1100_0011_1000; // contains Q at 0x10
        let (alt, unit) = decode_ac12(field).unwrap();
        assert_eq!(unit, AltitudeUnit::Feet);
        // n = ((field & 0x0FE0) >> 1) | (field & 0x000F)
        let n = ((field & 0x0FE0) >> 1) | (field & 0x000F);
        assert_eq!(alt, n as i32 * 25 - 1000);
    }

    #[test]
    fn test_ais_callsign_rules() {
        // 8 spaces is not a callsign
        let blank = [0x82, 0x08, 0x20, 0x82, 0x08, 0x20];
        assert_eq!(decode_ais_callsign(&blank), None);
    }

    #[test]
    fn test_movement_table() {
        assert_eq!(decode_movement(1), 0); // stopped
        assert_eq!(decode_movement(9), 1);
        assert_eq!(decode_movement(13), 2);
        assert_eq!(decode_movement(39), 16);
        assert_eq!(decode_movement(94), 72);
        assert_eq!(decode_movement(109), 105);
        assert_eq!(decode_movement(124), 199);
    }
}
