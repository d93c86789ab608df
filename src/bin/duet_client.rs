use std::{
    io::{self, BufRead},
    sync::mpsc,
    thread::{self, sleep},
    time::Duration,
};

use clap::Parser;
use duet_sync::{
    common::{box_error::BoxError, duet_config::DuetConfig, get_micro_time},
    engine::{
        client::{self, EngineCommand},
        duet_engine::{DuetEngine, EngineEvent},
    },
    media::{audio_frame::Playout, transform::Passthrough},
    signaling::websocket_relay::WebSocketRelay,
    transport::udp::UdpTransport,
};
use log::{debug, info, warn};

/// Host or join a duet session.  Type commands on stdin: create, join <id>,
/// pitch <semitones>, mute on|off, start <lead ms>, disconnect, quit
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// settings file
    #[arg(short, long, default_value = "settings.json")]
    config: String,

    /// host a new session right away
    #[arg(long)]
    host: bool,

    /// join this session right away
    #[arg(short, long)]
    join: Option<String>,

    /// udp port for audio, 0 picks one
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// address the peer should send audio to
    #[arg(short, long, default_value = "127.0.0.1")]
    ip: String,

    /// bytes of silence to send per frame when no capture device is attached
    #[arg(long, default_value_t = 960)]
    frame_bytes: usize,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let config = DuetConfig::load(Some(&args.config))?;
    info!("relay: {}", config.relay_url);
    let frame_interval = Duration::from_micros(config.frame_interval as u64);

    let (event_tx, event_rx) = mpsc::channel();
    let mut engine = DuetEngine::new(
        WebSocketRelay::new(&config.relay_url),
        UdpTransport::build(args.port, &args.ip, &config.ice_servers)?,
        Box::new(Passthrough::default()),
        config,
        event_tx,
        get_micro_time(),
    );

    // stand-in capture device: a frame of silence every frame interval
    let capture = engine.capture_sink();
    let frame_bytes = args.frame_bytes;
    let _capture_handle = thread::spawn(move || loop {
        capture.offer((get_micro_time(), vec![0; frame_bytes]));
        sleep(frame_interval);
    });

    if let Some(playout) = engine.take_playout_source() {
        let _playback_handle = thread::spawn(move || {
            let mut gaps = 0u64;
            loop {
                match playout.recv_timeout(Duration::from_secs(1)) {
                    Some(Playout::Gap { seq }) => {
                        gaps += 1;
                        debug!("gap at {} ({} so far)", seq, gaps);
                    }
                    Some(_) => (),
                    None => debug!("nothing to play"),
                }
            }
        });
    }

    let _event_handle = thread::spawn(move || {
        for event in event_rx {
            match &event {
                EngineEvent::StateChanged(change) => info!("{}", change),
                EngineEvent::Metrics(snap) => debug!("{}", snap),
            }
            if let Ok(text) = serde_json::to_string(&event) {
                println!("{}", text);
            }
        }
    });

    let (command_tx, command_rx) = mpsc::channel();
    if args.host {
        command_tx.send(EngineCommand::CreateSession)?;
    } else if let Some(id) = args.join {
        command_tx.send(EngineCommand::JoinSession(id))?;
    }
    let _stdin_handle = thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match EngineCommand::from_string(&line) {
                Ok(command) => {
                    if command_tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
        let _res = command_tx.send(EngineCommand::Quit);
    });

    let state = client::run(&mut engine, command_rx, Duration::from_millis(5), false)?;
    info!("client done, session {}", state);
    Ok(())
}
