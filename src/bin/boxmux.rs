use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossterm::event::{self, Event, KeyEventKind};
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};

use boxmux::config::{AppConfig, DEFAULT_SOCKET_PATH, SOCKET_ENV};
use boxmux::control::{send_raw, ControlServer};
use boxmux::keys::KeyChord;
use boxmux::process_manager::ShutdownProgress;
use boxmux::runtime::{Runtime, RuntimeEvent, SignalWatcher};
use boxmux::{logging, parse_command, print_usage, Command, RunArgs, SendArgs};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = match parse_command(args) {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("error: invalid command arguments: {err}");
            eprintln!("hint: run `boxmux --help` to see supported command forms\n");
            print_usage();
            std::process::exit(2);
        }
    };

    let result = match cmd {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Run(args) => run(args),
        Command::Send(args) => send(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(err) = logging::init_from_env() {
        eprintln!("warning: {err}; continuing without a log file");
    }

    let mut config = AppConfig::load(&args.config)?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    let socket_path = config.socket_path.clone();
    let idle_timeout = config.socket_idle_timeout();
    let max_request_bytes = config.max_request_bytes;

    let runtime = Runtime::new(config, Some(args.config))?;
    let signals = SignalWatcher::spawn(runtime.sender())?;
    let mut server = ControlServer::bind_with_limit(
        &socket_path,
        idle_timeout,
        max_request_bytes,
        runtime.control_handler(),
    )?;

    let input = if args.interactive {
        Some(TerminalInput::spawn(runtime.sender())?)
    } else {
        None
    };

    let outcome = runtime.run();
    drop(signals);
    if let Some(input) = input {
        input.stop();
    }
    server.shutdown();

    match outcome? {
        ShutdownProgress::Complete { total, forced } => {
            log::info!("shutdown complete: {total} processes, {forced} force-killed");
        }
        other => log::warn!("shutdown ended at {other:?}"),
    }
    Ok(())
}

fn send(args: SendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let socket = args
        .socket
        .or_else(|| {
            std::env::var_os(SOCKET_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    let line = send_raw(&socket, &args.json)?;
    println!("{line}");

    let succeeded = serde_json::from_str::<serde_json::Value>(&line)
        .ok()
        .and_then(|response| response.get("success").and_then(|value| value.as_bool()))
        .unwrap_or(false);
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Raw-mode key reader feeding the dispatch loop.
struct TerminalInput {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl TerminalInput {
    fn spawn(sender: Sender<RuntimeEvent>) -> std::io::Result<Self> {
        enable_raw_mode()?;
        if let Ok((cols, rows)) = terminal::size() {
            let _ = sender.send(RuntimeEvent::Resize { cols, rows });
        }
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("terminal-input".to_owned())
            .spawn(move || read_terminal(sender, worker_stop));
        match spawned {
            Ok(worker) => Ok(Self { stop, worker }),
            Err(error) => {
                let _ = disable_raw_mode();
                Err(error)
            }
        }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.worker.join();
        let _ = disable_raw_mode();
    }
}

fn read_terminal(sender: Sender<RuntimeEvent>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match event::poll(Duration::from_millis(50)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(error) => {
                log::error!("terminal input failed: {error}");
                return;
            }
        }
        let event = match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                RuntimeEvent::Key(KeyChord::from(key))
            }
            Ok(Event::Resize(cols, rows)) => RuntimeEvent::Resize { cols, rows },
            Ok(_) => continue,
            Err(error) => {
                log::error!("terminal input failed: {error}");
                return;
            }
        };
        if sender.send(event).is_err() {
            return;
        }
    }
}
