use boxmux::control::{send_command, ControlCommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn workspace(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("boxmux-signal-{name}-{ts}"));
    fs::create_dir_all(&root).expect("mkdir workspace");
    root
}

fn write_config(root: &Path, socket: &Path) -> PathBuf {
    let config = root.join("boxmux.toml");
    let source = format!(
        r#"
socket_path = "{}"
shutdown_grace_ms = 500

[[layouts]]
id = "main"
root = true

[[layouts.boxes]]
id = "sleeper"
script = ["sleep 777"]

[[layouts.boxes]]
id = "group"
script = ["sleep 778 & sleep 779"]
"#,
        socket.display()
    );
    fs::write(&config, source).expect("write config");
    config
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    check()
}

fn group_alive(pgid: u32) -> bool {
    kill(Pid::from_raw(-(pgid as i32)), None).is_ok()
}

fn spawn_boxmux(config: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_boxmux"))
        .arg("run")
        .arg(config)
        .env_remove("BOXMUX_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn boxmux")
}

fn supervised_pids(socket: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    let ready = wait_until(Duration::from_secs(10), || {
        let Ok(response) = send_command(socket, &ControlCommand::GetStatus {}) else {
            return false;
        };
        pids = response
            .data
            .and_then(|data| data["pids"].as_array().cloned())
            .unwrap_or_default()
            .iter()
            .filter_map(|pid| pid.as_u64())
            .map(|pid| pid as u32)
            .collect();
        pids.len() == 2
    });
    assert!(ready, "boxmux never reported two supervised processes");
    pids
}

fn assert_signal_tears_down(signal: Signal, name: &str) {
    let root = workspace(name);
    let socket = root.join("control.sock");
    let config = write_config(&root, &socket);
    let mut child = spawn_boxmux(&config);

    let pids = supervised_pids(&socket);
    kill(Pid::from_raw(child.id() as i32), signal).expect("signal boxmux");

    let exited = wait_until(Duration::from_secs(10), || {
        matches!(child.try_wait(), Ok(Some(_)))
    });
    if !exited {
        let _ = child.kill();
        panic!("boxmux ignored {signal}");
    }
    let status = child.wait().expect("exit status");
    assert!(status.success(), "boxmux exited with {status}");

    assert!(!socket.exists(), "socket file left behind after {signal}");
    for pid in pids {
        assert!(
            wait_until(Duration::from_secs(2), || !group_alive(pid)),
            "process group {pid} survived {signal}"
        );
    }
}

#[test]
fn sigterm_terminates_children_and_removes_the_socket() {
    assert_signal_tears_down(Signal::SIGTERM, "term");
}

#[test]
fn sigint_terminates_children_and_removes_the_socket() {
    assert_signal_tears_down(Signal::SIGINT, "int");
}

#[test]
fn sighup_terminates_children_and_removes_the_socket() {
    assert_signal_tears_down(Signal::SIGHUP, "hup");
}
