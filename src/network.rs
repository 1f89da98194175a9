//! Network services
//!
//! TCP fan-out of decoded frames in raw (AVR), SBS/BaseStation and BEAST
//! formats, plus raw and BEAST inputs and the HTTP JSON endpoint. Outputs
//! run over broadcast channels; inputs are queued to the decoder thread so
//! parser state stays single-threaded.

use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::aircraft::AircraftStore;
use crate::beast::{self, BeastParser, InboundFrame};
use crate::config::Config;
use crate::cpr::Position;
use crate::decoder::{DownlinkFormat, ParsedMessage};
use crate::errors::InitError;
use crate::snapshot;

const BROADCAST_CAPACITY: usize = 1024;

/// Broadcast senders the decoder thread publishes into.
#[derive(Clone)]
pub struct Outputs {
    pub raw: broadcast::Sender<String>,
    pub sbs: broadcast::Sender<String>,
    pub beast: broadcast::Sender<Vec<u8>>,
}

impl Outputs {
    pub fn new() -> Self {
        Self {
            raw: broadcast::channel(BROADCAST_CAPACITY).0,
            sbs: broadcast::channel(BROADCAST_CAPACITY).0,
            beast: broadcast::channel(BROADCAST_CAPACITY).0,
        }
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_servers(
    config: Config,
    store: Arc<RwLock<AircraftStore>>,
    outputs: Outputs,
    inbound: crossbeam_channel::Sender<InboundFrame>,
) -> Result<(), InitError> {
    let addr = config.net_bind_address.clone();
    let bind = |port: u16| {
        let addr = addr.clone();
        async move {
            TcpListener::bind((addr.as_str(), port))
                .await
                .map_err(|source| InitError::Bind { port, source })
        }
    };

    let raw_in = bind(config.net_ri_port).await?;
    let raw_out = bind(config.net_ro_port).await?;
    let sbs_out = bind(config.net_sbs_port).await?;
    let beast_in = bind(config.net_bi_port).await?;
    // Conventional alternate BEAST input port
    let beast_in_alt = bind(10001).await?;
    let beast_out = bind(config.net_bo_port).await?;
    let http = bind(config.net_http_port).await?;

    info!(
        "network: raw in {} out {}, sbs {}, beast in {}/10001 out {}, http {}",
        config.net_ri_port,
        config.net_ro_port,
        config.net_sbs_port,
        config.net_bi_port,
        config.net_bo_port,
        config.net_http_port
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_line_output(raw_out, outputs.raw.clone())));
    tasks.push(tokio::spawn(run_line_output(sbs_out, outputs.sbs.clone())));
    tasks.push(tokio::spawn(run_beast_output(
        beast_out,
        outputs.beast.clone(),
    )));
    tasks.push(tokio::spawn(run_raw_input(raw_in, inbound.clone())));
    tasks.push(tokio::spawn(run_beast_input(beast_in, inbound.clone())));
    tasks.push(tokio::spawn(run_beast_input(beast_in_alt, inbound)));
    tasks.push(tokio::spawn(run_http(http, store)));

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Serve a line-oriented broadcast stream (raw or SBS) to every client.
async fn run_line_output(listener: TcpListener, tx: broadcast::Sender<String>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        debug!("output client connected: {addr}");
        let mut rx = tx.subscribe();

        tokio::spawn(async move {
            let mut socket = socket;
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(line.as_bytes()).await.is_err()
                            || socket.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            debug!("output client disconnected: {addr}");
        });
    }
}

async fn run_beast_output(listener: TcpListener, tx: broadcast::Sender<Vec<u8>>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        debug!("beast client connected: {addr}");
        let mut rx = tx.subscribe();

        tokio::spawn(async move {
            let mut socket = socket;
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if socket.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            debug!("beast client disconnected: {addr}");
        });
    }
}

/// AVR line input: accepts `*...;` and `@TTTTTTTTTTTT...;` lines.
async fn run_raw_input(listener: TcpListener, inbound: crossbeam_channel::Sender<InboundFrame>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        debug!("raw input client connected: {addr}");
        let inbound = inbound.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(socket);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some((data, timestamp)) = beast::parse_avr(&line) {
                    let frame = InboundFrame {
                        timestamp: timestamp.unwrap_or(0),
                        signal: 0,
                        data,
                        mode_ac: false,
                    };
                    if inbound.send(frame).is_err() {
                        break;
                    }
                }
            }
            debug!("raw input client disconnected: {addr}");
        });
    }
}

async fn run_beast_input(listener: TcpListener, inbound: crossbeam_channel::Sender<InboundFrame>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        debug!("beast input client connected: {addr}");
        let inbound = inbound.clone();

        tokio::spawn(async move {
            let mut socket = socket;
            let mut parser = BeastParser::new();
            let mut buf = vec![0u8; 4096];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        parser.push(&buf[..n]);
                        while let Some(frame) = parser.next_frame() {
                            if inbound.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("beast input client disconnected: {addr}");
        });
    }
}

async fn run_http(listener: TcpListener, store: Arc<RwLock<AircraftStore>>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = handle_http_request(socket, store).await {
                debug!("http error from {addr}: {e}");
            }
        });
    }
}

async fn handle_http_request(
    mut socket: TcpStream,
    store: Arc<RwLock<AircraftStore>>,
) -> std::io::Result<()> {
    let mut buffer = vec![0u8; 8192];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let url = first_line.split_whitespace().nth(1).unwrap_or("/");

    let (status, content_type, body) = if url.contains("/data.json") {
        let json = snapshot::to_json(&store.read());
        ("200 OK", "application/json;charset=utf-8", json)
    } else {
        ("404 Not Found", "text/plain;charset=utf-8", "not found\n".to_string())
    };

    let header = format!(
        "HTTP/1.1 {status}\r\n\
         Server: rx1090\r\n\
         Content-Type: {content_type}\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         \r\n",
        body.len()
    );

    socket.write_all(header.as_bytes()).await?;
    socket.write_all(body.as_bytes()).await?;
    Ok(())
}

/// SBS/BaseStation transmission type for a decoded message.
fn sbs_transmission_type(pm: &ParsedMessage) -> Option<u8> {
    Some(match pm.df {
        DownlinkFormat::ExtendedSquitter | DownlinkFormat::ExtendedSquitterNt => {
            match pm.me_type {
                1..=4 => 1,
                5..=8 => 2,
                9..=18 | 20..=22 => 3,
                19 => 4,
                _ => return None,
            }
        }
        DownlinkFormat::SurveillanceAltitude | DownlinkFormat::CommBAltitude => 5,
        DownlinkFormat::SurveillanceIdentity | DownlinkFormat::CommBIdentity => 6,
        DownlinkFormat::ShortAirAir | DownlinkFormat::LongAirAir => 7,
        DownlinkFormat::AllCallReply => 8,
        _ => return None,
    })
}

/// Build the 22-field SBS/BaseStation line for a decoded message.
/// `position` is the aircraft's current decoded position, if any.
pub fn sbs_line(pm: &ParsedMessage, position: Option<Position>) -> Option<String> {
    let tt = sbs_transmission_type(pm)?;

    let now = Local::now();
    let date = now.format("%Y/%m/%d");
    let time = now.format("%H:%M:%S%.3f");

    let callsign = pm.callsign.as_deref().map(str::trim).unwrap_or("");
    let altitude = pm.altitude.map(|a| a.to_string()).unwrap_or_default();
    let speed = pm.ground_speed.map(|s| s.to_string()).unwrap_or_default();
    let track = pm.heading.map(|h| format!("{h:.0}")).unwrap_or_default();
    let (lat, lon) = match position {
        Some(p) if pm.cpr.is_some() => (format!("{:.5}", p.latitude), format!("{:.5}", p.longitude)),
        _ => (String::new(), String::new()),
    };
    let vert_rate = pm.vert_rate.map(|v| v.to_string()).unwrap_or_default();
    let squawk = pm.squawk.map(|s| format!("{s:04}")).unwrap_or_default();

    // Flag columns: -1 true, 0 false, empty unknown
    let emergency = match pm.squawk {
        Some(7500) | Some(7600) | Some(7700) => "-1",
        Some(_) => "0",
        None => "",
    };
    let (alert, spi) = match pm.flight_status {
        Some(fs) => (
            if matches!(fs, 2 | 3 | 4) { "-1" } else { "0" },
            if matches!(fs, 4 | 5) { "-1" } else { "0" },
        ),
        None => ("", ""),
    };
    let ground = match pm.on_ground {
        Some(true) => "-1",
        Some(false) => "0",
        None => "",
    };

    Some(format!(
        "MSG,{tt},,,{:06X},,{date},{time},{date},{time},{callsign},{altitude},{speed},{track},{lat},{lon},{vert_rate},{squawk},{alert},{emergency},{spi},{ground}",
        pm.addr
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Engine;
    use hexlit::hex;

    #[test]
    fn test_sbs_line_identification() {
        let mut engine = Engine::new(1, false);
        let pm = engine
            .decode(&hex!("8D4840D6202CC371C32CE0576098"), 0, 0)
            .unwrap();
        let line = sbs_line(&pm, None).expect("DF17 ident maps to SBS");

        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 22);
        assert_eq!(fields[0], "MSG");
        assert_eq!(fields[1], "1");
        assert_eq!(fields[4], "4840D6");
        assert_eq!(fields[10], "KLM1023");
    }

    #[test]
    fn test_sbs_line_position_fields() {
        let mut engine = Engine::new(1, false);
        let pm = engine
            .decode(&hex!("8D40621D58C382D690C8AC2863A7"), 0, 0)
            .unwrap();
        let pos = Position {
            latitude: 52.25720,
            longitude: 3.91937,
        };
        let line = sbs_line(&pm, Some(pos)).unwrap();
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[1], "3");
        assert_eq!(fields[11], "38000");
        assert_eq!(fields[14], "52.25720");
        assert_eq!(fields[15], "3.91937");
        assert_eq!(fields[21], "0"); // airborne
    }

    #[test]
    fn test_sbs_no_mapping_for_comm_d() {
        let pm_raw = [0xC0u8; 14]; // DF 24
        let mut engine = Engine::new(1, false);
        engine.icao_filter.add(crate::crc::checksum(&pm_raw, 112));
        let pm = engine.decode(&pm_raw, 0, 0).unwrap();
        assert!(sbs_line(&pm, None).is_none());
    }
}
