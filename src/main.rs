//! rx1090: a Mode S / ADS-B software receiver
//!
//! Samples flow from a reader (SDR subprocess or file) through a fixed ring
//! of raw buffers into the decoder thread, which runs the whole pipeline
//! synchronously: magnitude transform, demodulation, CRC, parse, tracker
//! update, output fan-out. Network servers run on tokio alongside.

mod aircraft;
mod beast;
mod config;
mod cpr;
mod crc;
mod decoder;
mod demod;
mod errors;
mod icao_filter;
mod magnitude;
mod network;
mod snapshot;
mod stats;

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aircraft::{AircraftStore, PositionOutcome};
use crate::beast::InboundFrame;
use crate::config::Config;
use crate::decoder::{Engine, ParsedMessage};
use crate::demod::Demodulator;
use crate::magnitude::{MagnitudeBuffer, MagnitudeLut};
use crate::network::Outputs;
use crate::stats::Stats;

/// Buffers in the reader/decoder ring.
const RING_BUFFERS: usize = 16;
/// Bytes per raw sample block (two bytes per I/Q sample).
const BLOCK_BYTES: usize = 16 * 16384;

fn main() {
    let config = match Config::parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rx1090: {e}");
            std::process::exit(e.exit_code());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    info!("rx1090 starting");

    let store = Arc::new(RwLock::new(AircraftStore::new(
        config.ttl_secs,
        config.receiver_position(),
    )));
    let outputs = Outputs::new();
    let exit_flag = Arc::new(AtomicBool::new(false));
    let dropped_blocks = Arc::new(AtomicU64::new(0));

    // The sample ring: filled buffers flow one way, spent buffers back.
    let (block_tx, block_rx) = bounded::<Vec<u8>>(RING_BUFFERS);
    let (free_tx, free_rx) = bounded::<Vec<u8>>(RING_BUFFERS);
    for _ in 0..RING_BUFFERS {
        let _ = free_tx.send(vec![0u8; BLOCK_BYTES]);
    }
    let (inbound_tx, inbound_rx) = unbounded::<InboundFrame>();

    let decoder_handle = {
        let config = config.clone();
        let store = Arc::clone(&store);
        let outputs = outputs.clone();
        let exit = Arc::clone(&exit_flag);
        let free_tx = free_tx.clone();
        std::thread::spawn(move || {
            decoder_loop(config, block_rx, free_tx, inbound_rx, store, outputs, exit)
        })
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("rx1090: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    rt.block_on(async {
        let _net_handle = if config.net {
            let config = config.clone();
            let store = Arc::clone(&store);
            let outputs = outputs.clone();
            let inbound = inbound_tx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = network::run_servers(config, store, outputs, inbound).await {
                    eprintln!("rx1090: {e}");
                    std::process::exit(e.exit_code());
                }
            }))
        } else {
            None
        };

        // Stale aircraft sweep
        let cleanup_handle = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    store.write().remove_stale();
                }
            })
        };

        let snapshot_handle = config.json_path.clone().map(|path| {
            tokio::spawn(snapshot::run_writer(
                path,
                config.json_interval,
                Arc::clone(&store),
            ))
        });

        if config.net_only {
            info!("net-only mode, waiting for network data");
            tokio::signal::ctrl_c().await.ok();
        } else if let Some(path) = config.filename.clone() {
            let blocks = block_tx.clone();
            let free = free_rx.clone();
            let free_back = free_tx.clone();
            let exit = Arc::clone(&exit_flag);
            let loop_file = config.loop_file;
            let reader = tokio::task::spawn_blocking(move || {
                read_file_blocks(&path, loop_file, blocks, free, free_back, exit)
            });
            tokio::select! {
                result = reader => {
                    match result {
                        Ok(Err(e)) => {
                            eprintln!("rx1090: {e}");
                            std::process::exit(e.exit_code());
                        }
                        _ => info!("input file finished"),
                    }
                    if config.net {
                        tokio::signal::ctrl_c().await.ok();
                    }
                }
                _ = tokio::signal::ctrl_c() => {}
            }
        } else {
            let result = tokio::select! {
                result = read_sdr_blocks(
                    &config,
                    block_tx.clone(),
                    free_rx.clone(),
                    free_tx.clone(),
                    Arc::clone(&dropped_blocks),
                    Arc::clone(&exit_flag),
                ) => result,
                _ = tokio::signal::ctrl_c() => Ok(()),
            };
            if let Err(e) = result {
                eprintln!("rx1090: {e}");
                eprintln!("make sure rtl_sdr is installed, or use --ifile / --net-only");
                std::process::exit(e.exit_code());
            }
        }

        cleanup_handle.abort();
        if let Some(h) = snapshot_handle {
            h.abort();
        }
    });

    exit_flag.store(true, Ordering::Relaxed);
    // Abandon any still-blocked reader task rather than waiting on it
    rt.shutdown_background();
    drop(block_tx);
    drop(inbound_tx);

    let mut stats = match decoder_handle.join() {
        Ok(stats) => stats,
        Err(_) => {
            error!("decoder thread panicked");
            std::process::exit(1);
        }
    };
    stats.blocks_dropped += dropped_blocks.load(Ordering::Relaxed);

    if config.stats {
        println!("{stats}");
    }
}

/// The decoder thread: owns every mutable decode structure and runs the
/// pipeline strictly in block-submission order.
fn decoder_loop(
    config: Config,
    block_rx: Receiver<Vec<u8>>,
    free_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<InboundFrame>,
    store: Arc<RwLock<AircraftStore>>,
    outputs: Outputs,
    exit: Arc<AtomicBool>,
) -> Stats {
    let mag_lut = MagnitudeLut::new();
    let mut demod = Demodulator::new(config.sample_rate, config.phase_enhance, config.squelch_db);
    let mut mag_buf = MagnitudeBuffer::new(demod.lookahead());
    let mut engine = Engine::new(config.fix_bits, config.check_crc);
    let mut decoded: Vec<ParsedMessage> = Vec::new();

    let ticks = demod.ticks_per_sample();
    let mut sample_clock: u64 = 0;

    let mut block_rx = block_rx;
    let mut inbound_rx = inbound_rx;
    let mut blocks_open = true;
    let mut net_open = true;

    while !exit.load(Ordering::Relaxed) {
        if !blocks_open && !net_open {
            break;
        }

        crossbeam_channel::select! {
            recv(block_rx) -> msg => match msg {
                Ok(data) => {
                    engine.stats.blocks_processed += 1;
                    mag_buf.convert_block(&data, &mag_lut);
                    let base_ts =
                        sample_clock.saturating_sub(mag_buf.carried() as u64) * ticks;

                    decoded.clear();
                    demod.process_block(mag_buf.samples(), base_ts, &mut engine, &mut decoded);
                    sample_clock += (data.len() / 2) as u64;

                    for pm in decoded.drain(..) {
                        deliver(&pm, &config, &store, &outputs, &mut engine.stats);
                    }
                    // Recycle the raw buffer
                    let _ = free_tx.try_send(data);
                }
                Err(_) => {
                    blocks_open = false;
                    block_rx = crossbeam_channel::never();
                }
            },
            recv(inbound_rx) -> msg => match msg {
                Ok(frame) => {
                    engine.stats.net_frames += 1;
                    if frame.mode_ac {
                        engine.stats.mode_ac_frames += 1;
                    } else if let Some(pm) =
                        engine.decode(&frame.data, frame.timestamp, frame.signal)
                    {
                        deliver(&pm, &config, &store, &outputs, &mut engine.stats);
                    }
                }
                Err(_) => {
                    net_open = false;
                    inbound_rx = crossbeam_channel::never();
                }
            },
            default(Duration::from_millis(100)) => {}
        }

        engine.icao_filter.expire(Instant::now());
    }

    engine.stats
}

/// Route one decoded message: tracker update, stdout, network fan-out.
fn deliver(
    pm: &ParsedMessage,
    config: &Config,
    store: &Arc<RwLock<AircraftStore>>,
    outputs: &Outputs,
    stats: &mut Stats,
) {
    let outcome = store.write().update(pm);
    match outcome {
        PositionOutcome::Global => stats.cpr_global += 1,
        PositionOutcome::Relative => stats.cpr_relative += 1,
        PositionOutcome::Failed => stats.cpr_failed += 1,
        PositionOutcome::NoPosition => {}
    }
    let position = store.read().get(pm.addr).and_then(|a| a.position);

    if config.raw {
        println!("{}", beast::format_avr(pm.payload()));
    } else if config.onlyaddr {
        println!("{:06X}", pm.addr);
    }

    let _ = outputs.raw.send(beast::format_avr(pm.payload()));
    if let Some(line) = network::sbs_line(pm, position) {
        let _ = outputs.sbs.send(line);
    }
    let _ = outputs
        .beast
        .send(beast::encode_beast(pm.payload(), pm.timestamp, pm.signal_level));
}

/// Blocking file reader: fills ring buffers from a sample file (or stdin),
/// with backpressure instead of drops.
fn read_file_blocks(
    path: &str,
    loop_file: bool,
    blocks: Sender<Vec<u8>>,
    free: Receiver<Vec<u8>>,
    free_back: Sender<Vec<u8>>,
    exit: Arc<AtomicBool>,
) -> Result<(), errors::InitError> {
    loop {
        let mut input: Box<dyn Read> = if path == "-" {
            Box::new(std::io::stdin())
        } else {
            Box::new(std::fs::File::open(path).map_err(|source| errors::InitError::Input {
                path: path.to_string(),
                source,
            })?)
        };

        loop {
            let mut buf = loop {
                if exit.load(Ordering::Relaxed) {
                    return Ok(());
                }
                match free.recv_timeout(Duration::from_millis(250)) {
                    Ok(buf) => break buf,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(()),
                }
            };
            buf.resize(BLOCK_BYTES, 0);

            let mut filled = 0;
            while filled < BLOCK_BYTES {
                match input.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        warn!("read error: {e}");
                        break;
                    }
                }
            }

            if filled == 0 {
                let _ = free_back.send(buf);
                break;
            }
            // Keep whole samples
            buf.truncate(filled & !1);
            let mut pending = buf;
            loop {
                if exit.load(Ordering::Relaxed) {
                    return Ok(());
                }
                match blocks.send_timeout(pending, Duration::from_millis(250)) {
                    Ok(()) => break,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(buf)) => pending = buf,
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return Ok(()),
                }
            }
        }

        if !loop_file || path == "-" {
            return Ok(());
        }
    }
}

/// Acquire live samples from an rtl_sdr subprocess. A full ring drops the
/// block and counts it.
async fn read_sdr_blocks(
    config: &Config,
    blocks: Sender<Vec<u8>>,
    free: Receiver<Vec<u8>>,
    free_back: Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    exit: Arc<AtomicBool>,
) -> Result<(), errors::InitError> {
    use std::process::Stdio;
    use tokio::io::AsyncReadExt;
    use tokio::process::Command;

    let mut cmd = Command::new("rtl_sdr");
    cmd.arg("-f")
        .arg(config.freq.to_string())
        .arg("-s")
        .arg(config.sample_rate.to_string())
        .arg("-d")
        .arg(config.dev_index.to_string())
        .arg("-g")
        .arg(if config.gain < 0 {
            "0".to_string() // automatic
        } else {
            (config.gain / 10).to_string()
        })
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().map_err(errors::InitError::Device)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| errors::InitError::Device(std::io::Error::other("no child stdout")))?;

    info!(
        "rtl_sdr started: {} Hz at {} S/s",
        config.freq, config.sample_rate
    );

    let mut scratch = vec![0u8; BLOCK_BYTES];
    loop {
        if exit.load(Ordering::Relaxed) {
            let _ = child.kill().await;
            return Ok(());
        }

        // Take a ring buffer, or fall back to the scratch buffer whose
        // contents will be dropped.
        let (mut buf, is_scratch) = match free.try_recv() {
            Ok(buf) => (buf, false),
            Err(_) => (std::mem::take(&mut scratch), true),
        };
        buf.resize(BLOCK_BYTES, 0);

        let mut filled = 0;
        while filled < BLOCK_BYTES {
            match stdout.read(&mut buf[filled..]).await {
                Ok(0) => {
                    if is_scratch {
                        scratch = buf;
                    } else {
                        let _ = free_back.send(buf);
                    }
                    info!("sample source closed");
                    return Ok(());
                }
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("sample read error: {e}");
                    return Ok(());
                }
            }
        }

        if is_scratch {
            dropped.fetch_add(1, Ordering::Relaxed);
            scratch = buf;
        } else {
            match blocks.try_send(buf) {
                Ok(()) => {}
                Err(crossbeam_channel::TrySendError::Full(buf))
                | Err(crossbeam_channel::TrySendError::Disconnected(buf)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    let _ = free_back.send(buf);
                }
            }
        }
    }
}
