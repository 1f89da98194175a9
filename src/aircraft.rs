//! Aircraft tracking
//!
//! Maintains per-aircraft state keyed by ICAO address, merges successive
//! decoded messages, and drives CPR position decoding.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cpr::{self, CprError, Position, RawCpr};
use crate::decoder::ParsedMessage;

/// Even/odd CPR pairs older than this cannot be combined globally.
const CPR_PAIR_MAX_AGE: Duration = Duration::from_secs(10);

/// Depth of the per-aircraft signal level ring.
const SIGNAL_RING: usize = 8;

/// How a position update was resolved, for the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    /// The message carried no position.
    NoPosition,
    Global,
    Relative,
    Failed,
}

/// One CPR side (even or odd) with its arrival time.
#[derive(Debug, Clone, Copy)]
struct CprSide {
    lat: u32,
    lon: u32,
    surface: bool,
    time: Instant,
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub addr: u32,
    pub callsign: Option<String>,
    pub squawk: Option<u16>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<u16>,
    pub heading: Option<f64>,
    pub vert_rate: Option<i32>,
    pub on_ground: Option<bool>,
    pub messages: u64,
    pub seen: Instant,

    even_cpr: Option<CprSide>,
    odd_cpr: Option<CprSide>,
    pub position: Option<Position>,
    pub position_time: Option<Instant>,
    /// Set once a relative decode against this aircraft's own position has
    /// been validated.
    pub relative_ok: bool,

    signal_ring: [u8; SIGNAL_RING],
    signal_idx: usize,
    signal_count: usize,
}

impl Aircraft {
    fn new(addr: u32, now: Instant) -> Self {
        Self {
            addr,
            callsign: None,
            squawk: None,
            altitude: None,
            ground_speed: None,
            heading: None,
            vert_rate: None,
            on_ground: None,
            messages: 0,
            seen: now,
            even_cpr: None,
            odd_cpr: None,
            position: None,
            position_time: None,
            relative_ok: false,
            signal_ring: [0; SIGNAL_RING],
            signal_idx: 0,
            signal_count: 0,
        }
    }

    fn push_signal(&mut self, level: u8) {
        self.signal_ring[self.signal_idx] = level;
        self.signal_idx = (self.signal_idx + 1) % SIGNAL_RING;
        self.signal_count = (self.signal_count + 1).min(SIGNAL_RING);
    }

    /// Mean of the recent signal levels, in 0.2 dB units.
    pub fn signal_level(&self) -> u8 {
        if self.signal_count == 0 {
            return 0;
        }
        let sum: u32 = self.signal_ring[..self.signal_count]
            .iter()
            .map(|&s| s as u32)
            .sum();
        (sum / self.signal_count as u32) as u8
    }
}

pub struct AircraftStore {
    aircraft: HashMap<u32, Aircraft>,
    ttl: Duration,
    receiver: Option<(f64, f64)>,
}

impl AircraftStore {
    pub fn new(ttl_secs: u64, receiver: Option<(f64, f64)>) -> Self {
        Self {
            aircraft: HashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            receiver,
        }
    }

    /// Merge one decoded message into the aircraft state. Returns how the
    /// position (if any) was resolved so the caller can count it.
    pub fn update(&mut self, pm: &ParsedMessage) -> PositionOutcome {
        let now = Instant::now();
        let ttl = self.ttl;
        let receiver = self.receiver;

        let aircraft = self
            .aircraft
            .entry(pm.addr)
            .or_insert_with(|| Aircraft::new(pm.addr, now));

        aircraft.seen = now;
        aircraft.messages += 1;
        if pm.signal_level > 0 {
            aircraft.push_signal(pm.signal_level);
        }

        if let Some(ref callsign) = pm.callsign {
            aircraft.callsign = Some(callsign.clone());
        }
        if let Some(squawk) = pm.squawk {
            aircraft.squawk = Some(squawk);
        }
        if let Some(alt) = pm.altitude {
            aircraft.altitude = Some(alt);
        }
        if let Some(speed) = pm.ground_speed.or(pm.airspeed) {
            aircraft.ground_speed = Some(speed);
        }
        if let Some(heading) = pm.heading {
            aircraft.heading = Some(heading);
        }
        if let Some(rate) = pm.vert_rate {
            aircraft.vert_rate = Some(rate);
        }
        if let Some(ground) = pm.on_ground {
            aircraft.on_ground = Some(ground);
        }

        match pm.cpr {
            Some(raw) => update_position(aircraft, raw, now, ttl, receiver),
            None => PositionOutcome::NoPosition,
        }
    }

    pub fn get(&self, addr: u32) -> Option<&Aircraft> {
        self.aircraft.get(&addr)
    }

    pub fn all(&self) -> impl Iterator<Item = &Aircraft> {
        self.aircraft.values()
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    /// Drop records not updated within the TTL.
    pub fn remove_stale(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.aircraft
            .retain(|_, a| now.duration_since(a.seen) <= ttl);
    }
}

fn update_position(
    aircraft: &mut Aircraft,
    raw: RawCpr,
    now: Instant,
    ttl: Duration,
    receiver: Option<(f64, f64)>,
) -> PositionOutcome {
    let side = CprSide {
        lat: raw.lat,
        lon: raw.lon,
        surface: raw.surface,
        time: now,
    };
    if raw.odd {
        aircraft.odd_cpr = Some(side);
    } else {
        aircraft.even_cpr = Some(side);
    }

    // A fresh even/odd pair of the same kind decodes globally
    if let (Some(even), Some(odd)) = (aircraft.even_cpr, aircraft.odd_cpr) {
        let age = if even.time > odd.time {
            even.time.duration_since(odd.time)
        } else {
            odd.time.duration_since(even.time)
        };
        if age <= CPR_PAIR_MAX_AGE && even.surface == odd.surface {
            let result = if raw.surface {
                match surface_reference(aircraft, now, ttl, receiver) {
                    Some((ref_lat, ref_lon)) => cpr::decode_global_surface(
                        ref_lat,
                        ref_lon,
                        (even.lat, even.lon),
                        (odd.lat, odd.lon),
                        raw.odd,
                    ),
                    None => Err(CprError::NoFix),
                }
            } else {
                cpr::decode_global_airborne((even.lat, even.lon), (odd.lat, odd.lon), raw.odd)
            };

            if let Ok(pos) = result {
                aircraft.position = Some(pos);
                aircraft.position_time = Some(now);
                aircraft.relative_ok = true;
                return PositionOutcome::Global;
            }
        }
    }

    // Single side, stale pair or failed global decode: try a relative
    // decode against the last known position, else the receiver location.
    let reference = aircraft
        .position
        .filter(|_| {
            aircraft.relative_ok
                && aircraft
                    .position_time
                    .is_some_and(|t| now.duration_since(t) <= ttl)
        })
        .map(|p| (p.latitude, p.longitude))
        .or(receiver);

    let Some((ref_lat, ref_lon)) = reference else {
        return PositionOutcome::Failed;
    };

    match cpr::decode_relative(ref_lat, ref_lon, &raw) {
        Ok(pos) => {
            aircraft.position = Some(pos);
            aircraft.position_time = Some(now);
            aircraft.relative_ok = true;
            PositionOutcome::Relative
        }
        Err(_) => PositionOutcome::Failed,
    }
}

/// Surface decodes need a reference: the aircraft's own recent position
/// when one exists, otherwise the configured receiver location.
fn surface_reference(
    aircraft: &Aircraft,
    now: Instant,
    ttl: Duration,
    receiver: Option<(f64, f64)>,
) -> Option<(f64, f64)> {
    aircraft
        .position
        .filter(|_| {
            aircraft
                .position_time
                .is_some_and(|t| now.duration_since(t) <= ttl)
        })
        .map(|p| (p.latitude, p.longitude))
        .or(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Engine;
    use approx::assert_abs_diff_eq;
    use hexlit::hex;

    const EVEN_POS: [u8; 14] = hex!("8D40621D58C382D690C8AC2863A7");
    const ODD_POS: [u8; 14] = hex!("8D40621D58C386435CC412692AD6");

    fn decode(engine: &mut Engine, frame: &[u8]) -> ParsedMessage {
        engine.decode(frame, 0, 100).expect("valid frame")
    }

    #[test]
    fn test_global_position_from_pair() {
        let mut engine = Engine::new(1, false);
        let mut store = AircraftStore::new(300, None);

        let outcome = store.update(&decode(&mut engine, &ODD_POS));
        assert_eq!(outcome, PositionOutcome::Failed); // single side, no ref

        let outcome = store.update(&decode(&mut engine, &EVEN_POS));
        assert_eq!(outcome, PositionOutcome::Global);

        let ac = store.get(0x40621D).expect("tracked");
        let pos = ac.position.expect("position decoded");
        assert_abs_diff_eq!(pos.latitude, 52.2572021, epsilon = 1e-5);
        assert_abs_diff_eq!(pos.longitude, 3.9193725, epsilon = 1e-5);
        assert_eq!(ac.altitude, Some(38000));
        assert!(ac.relative_ok);
    }

    #[test]
    fn test_single_side_relative_against_receiver() {
        let mut engine = Engine::new(1, false);
        let mut store = AircraftStore::new(300, Some((52.0, 4.0)));

        let outcome = store.update(&decode(&mut engine, &EVEN_POS));
        assert_eq!(outcome, PositionOutcome::Relative);

        let pos = store.get(0x40621D).unwrap().position.unwrap();
        assert_abs_diff_eq!(pos.latitude, 52.2572021, epsilon = 1e-5);
        assert_abs_diff_eq!(pos.longitude, 3.9193725, epsilon = 1e-5);
    }

    #[test]
    fn test_fields_merge_across_messages() {
        let mut engine = Engine::new(1, false);
        let mut store = AircraftStore::new(300, None);

        let ident = hex!("8D4840D6202CC371C32CE0576098");
        let velocity = hex!("8D485020994409940838175B284F");

        store.update(&decode(&mut engine, &ident));
        let ac = store.get(0x4840D6).unwrap();
        assert_eq!(ac.callsign.as_deref(), Some("KLM1023 "));
        assert_eq!(ac.messages, 1);

        store.update(&decode(&mut engine, &velocity));
        let ac = store.get(0x485020).unwrap();
        assert_eq!(ac.ground_speed, Some(159));
        assert_eq!(ac.vert_rate, Some(-832));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_signal_ring() {
        let mut ac = Aircraft::new(1, Instant::now());
        assert_eq!(ac.signal_level(), 0);
        for level in [10, 20, 30] {
            ac.push_signal(level);
        }
        assert_eq!(ac.signal_level(), 20);
        // The ring forgets old levels once full
        for _ in 0..SIGNAL_RING {
            ac.push_signal(100);
        }
        assert_eq!(ac.signal_level(), 100);
    }

    #[test]
    fn test_stale_removal() {
        let mut engine = Engine::new(1, false);
        let mut store = AircraftStore::new(0, None);
        store.update(&decode(&mut engine, &hex!("8D4840D6202CC371C32CE0576098")));
        assert_eq!(store.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        store.remove_stale();
        assert!(store.is_empty());
    }
}
