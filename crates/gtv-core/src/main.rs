//! CLI front-end: owns one [`gtv_core::Registry`] and a frame-tick loop that
//! reads further commands from stdin between ticks.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::Duration as StdDuration,
};

use clap::{Parser, Subcommand};
use gtv_core::{
    Config, Registry,
    parser::AcceptingParser,
    spectator::NullSpectatorSink,
    wire::MAX_MSGLEN,
};
use gtv_timing::Instant;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    low_level,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default TCP port for a bare `host` address with no `:port` suffix (the
/// Quake II / Q2RTX game-broadcast port this client's protocol descends
/// from; see DESIGN.md).
const DEFAULT_PORT: u16 = 27910;
const SEND_CAPACITY: usize = 16 * 1024;

#[derive(Parser, Debug)]
#[command(name = "gtv-core", about = "MVD/GTV client core")]
struct Cli {
    /// Optional JSON config file (`mvd_`-named options; see `Config`).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Frame-tick cadence.
    #[arg(long, default_value_t = 16)]
    tick_millis: u64,
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct StdinCommand {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// connect <address[:port]> [--name N] [--user U] [--pass P]
    Connect {
        address: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        pass: Option<String>,
    },
    /// disconnect [chan_id|name]
    Disconnect { token: Option<String> },
    /// play <file...> [--name N] [--loop K] [--replace chan_id]
    Play {
        files: Vec<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "loop", default_value_t = 0)]
        loop_count: u32,
        #[arg(long)]
        replace: Option<String>,
    },
    /// kill [chan_id|name]
    Kill { token: Option<String> },
    /// pause [chan_id|name]
    Pause { token: Option<String> },
    /// control [chan_id|name] [--name N] [--loop K]
    Control {
        token: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "loop")]
        loop_count: Option<u32>,
    },
    /// channels
    Channels,
    /// servers
    Servers,
    /// record <path> [chan_id] [--gzip]
    Record {
        path: PathBuf,
        token: Option<String>,
        #[arg(long)]
        gzip: bool,
    },
    /// stop
    Stop,
    /// Not part of the original command table; lets an interactive stdin
    /// session end the tick loop cleanly.
    Quit,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn install_signal_handlers() {
    for sig in [SIGINT, SIGTERM] {
        unsafe {
            if let Err(err) = low_level::register(sig, || SHUTDOWN.store(true, Ordering::SeqCst)) {
                warn!(?err, sig, "couldn't install signal handler");
            }
        }
    }
}

fn resolve_address(input: &str) -> Option<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Some(addr);
    }
    let with_port = if input.contains(':') { input.to_string() } else { format!("{input}:{DEFAULT_PORT}") };
    with_port.to_socket_addrs().ok()?.next()
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && tx.send(trimmed.to_string()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn apply_command(registry: &mut Registry, mio_registry: &mio::Registry, text: &str) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let parsed = match StdinCommand::try_parse_from(tokens) {
        Ok(cmd) => cmd.command,
        Err(err) => {
            println!("{err}");
            return;
        }
    };

    let result = match parsed {
        Command::Connect { address, name, user, pass } => {
            let Some(addr) = resolve_address(&address) else {
                println!("couldn't resolve address: {address}");
                return;
            };
            let name = name.unwrap_or_else(|| address.clone());
            let recv_capacity = registry.config().buffer_size_clamped() as usize * MAX_MSGLEN;
            registry.connect(mio_registry, addr, &name, user, pass, recv_capacity, SEND_CAPACITY).map(|_| ())
        }
        Command::Disconnect { token } => registry.disconnect(mio_registry, &token.unwrap_or_else(|| "@@".into())),
        Command::Play { files, name, loop_count, replace } => {
            if let Some(old) = replace {
                let _ = registry.disconnect(mio_registry, &old);
            }
            let name = name.unwrap_or_else(|| {
                files.first().and_then(|p| p.file_stem()).and_then(|s| s.to_str()).unwrap_or("demo").to_string()
            });
            registry.play(files, &name, loop_count).map(|_| ())
        }
        Command::Kill { token } => registry.kill(&token.unwrap_or_else(|| "@@".into())),
        Command::Pause { token } => registry.pause(&token.unwrap_or_else(|| "@@".into())),
        Command::Control { token, name, loop_count } => {
            registry.control(&token.unwrap_or_else(|| "@@".into()), name.as_deref(), loop_count)
        }
        Command::Channels => {
            for line in registry.format_channels() {
                println!("{line}");
            }
            return;
        }
        Command::Servers => {
            for line in registry.format_servers() {
                println!("{line}");
            }
            return;
        }
        Command::Record { path, token, gzip } => {
            let token = token.unwrap_or_else(|| "@@".to_string());
            // The gamestate to seed a recording comes from the downstream
            // parser, out of scope here; an empty placeholder keeps the
            // file format valid.
            registry.record(&token, &path, gzip, &[])
        }
        Command::Stop => registry.stop_recording(),
        Command::Quit => {
            SHUTDOWN.store(true, Ordering::SeqCst);
            return;
        }
    };

    if let Err(err) = result {
        println!("error: {err}");
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    install_signal_handlers();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match Config::from_json_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(?err, path = %path.display(), "couldn't load config, using defaults");
                Config::default()
            }
        },
        None => Config::default(),
    };

    let poll = match mio::Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            error!(?err, "couldn't create mio poll");
            std::process::exit(1);
        }
    };
    let mio_registry = poll.registry();

    let mut registry = Registry::new(config);
    let mut parser = AcceptingParser::default();
    let mut spectators = NullSpectatorSink::default();
    let stdin_rx = spawn_stdin_reader();
    let tick_period = StdDuration::from_millis(cli.tick_millis);

    info!(tick_millis = cli.tick_millis, "gtv-core: entering tick loop");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        while let Ok(line) = stdin_rx.try_recv() {
            apply_command(&mut registry, mio_registry, &line);
        }
        registry.tick(mio_registry, &mut parser, &mut spectators, Instant::now());
        std::thread::sleep(tick_period);
    }

    info!("gtv-core: shutting down");
}
