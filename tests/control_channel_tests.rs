use boxmux::config::AppConfig;
use boxmux::control::{
    send_command, send_raw, ControlCommand, ControlServer, ErrorCode, ServerError,
    MAX_REQUEST_BYTES,
};
use boxmux::process_manager::ShutdownProgress;
use boxmux::runtime::{Runtime, RuntimeError};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LAYOUT: &str = r#"
[[layouts]]
id = "main"
root = true

[[layouts.boxes]]
id = "status"
content = "starting"

[[layouts.boxes]]
id = "logs"
content = "boot"
"#;

struct Harness {
    socket: PathBuf,
    server: ControlServer,
    runtime: Option<JoinHandle<Result<ShutdownProgress, RuntimeError>>>,
}

impl Harness {
    fn start(name: &str) -> Self {
        let socket = temp_socket(name);
        Self::start_at(socket)
    }

    fn start_at(socket: PathBuf) -> Self {
        let config = AppConfig::from_toml_str(LAYOUT).expect("config parses");
        let runtime = Runtime::new(config, None).expect("runtime builds");
        let server = ControlServer::bind(&socket, Duration::from_secs(5), runtime.control_handler())
            .expect("bind control socket");
        let runtime = thread::spawn(move || runtime.run());
        Self {
            socket,
            server,
            runtime: Some(runtime),
        }
    }

    fn send(&self, command: ControlCommand) -> boxmux::control::ControlResponse {
        send_command(&self.socket, &command).expect("control round trip")
    }

    fn content(&self, box_id: &str) -> String {
        let response = self.send(ControlCommand::GetBoxInfo {
            box_id: box_id.to_owned(),
        });
        assert!(response.success, "{response:?}");
        response.data.expect("data")["content"]
            .as_str()
            .expect("content string")
            .to_owned()
    }

    fn stop(mut self) {
        let response = self.send(ControlCommand::Shutdown {});
        assert!(response.success, "{response:?}");
        if let Some(runtime) = self.runtime.take() {
            runtime
                .join()
                .expect("runtime thread")
                .expect("runtime finished cleanly");
        }
        self.server.shutdown();
    }
}

fn temp_socket(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("boxmux-{name}-{ts}"));
    fs::create_dir_all(&root).expect("mkdir socket dir");
    root.join("control.sock")
}

#[test]
fn update_then_get_box_info_round_trips_over_the_socket() {
    let harness = Harness::start("update");

    let response = harness.send(ControlCommand::UpdateBox {
        box_id: "status".to_owned(),
        content: "Hello".to_owned(),
    });
    assert!(response.success);
    assert_eq!(harness.content("status"), "Hello");

    harness.stop();
}

#[test]
fn unknown_box_reports_box_not_found() {
    let harness = Harness::start("missing");

    let line = send_raw(&harness.socket, r#"{"FocusBox":{"box_id":"missing_id"}}"#)
        .expect("round trip");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], false);
    assert_eq!(response["error_code"], "BOX_NOT_FOUND");

    harness.stop();
}

#[test]
fn malformed_line_gets_an_error_and_the_connection_stays_usable() {
    let harness = Harness::start("malformed");

    let stream = UnixStream::connect(&harness.socket).expect("connect");
    let mut writer = stream.try_clone().expect("clone stream");
    let mut reader = BufReader::new(stream);

    writer.write_all(b"{not json\n").expect("write garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read error reply");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], false);
    assert_eq!(response["error_code"], ErrorCode::InvalidCommand.as_str());

    writer
        .write_all(b"{\"GetStatus\":{}}\n")
        .expect("write follow-up");
    line.clear();
    reader.read_line(&mut line).expect("read status reply");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], true);
    drop(writer);
    drop(reader);

    harness.stop();
}

#[test]
fn add_box_over_the_socket_creates_a_box_that_later_commands_see() {
    let harness = Harness::start("add-box");

    let line = send_raw(
        &harness.socket,
        r#"{"AddBox":{"parent":"status","box":{"id":"detail","content":"fresh"}}}"#,
    )
    .expect("round trip");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], true, "{line}");
    assert_eq!(harness.content("detail"), "fresh");

    let duplicate = send_raw(
        &harness.socket,
        r#"{"AddBox":{"box":{"id":"logs","content":"clash"}}}"#,
    )
    .expect("round trip");
    let response: serde_json::Value = serde_json::from_str(&duplicate).expect("json response");
    assert_eq!(response["success"], false);
    assert_eq!(response["error_code"], ErrorCode::InvalidCommand.as_str());
    assert_eq!(harness.content("logs"), "boot");

    let replaced = harness.send(
        serde_json::from_str(r#"{"ReplaceBox":{"box_id":"detail","box":{"id":"detail","content":"swapped"}}}"#)
            .expect("command json"),
    );
    assert!(replaced.success, "{replaced:?}");
    assert_eq!(harness.content("detail"), "swapped");

    harness.stop();
}

#[test]
fn concurrent_clients_never_interleave_within_a_command() {
    let harness = Harness::start("concurrent");
    let socket = harness.socket.clone();

    let clients = (0..4)
        .map(|client| {
            let socket = socket.clone();
            thread::spawn(move || {
                for n in 0..20 {
                    let command = if n % 5 == 0 {
                        ControlCommand::UpdateBox {
                            box_id: "logs".to_owned(),
                            content: format!("c{client}-{n}-a\nc{client}-{n}-b"),
                        }
                    } else {
                        ControlCommand::AppendBox {
                            box_id: "logs".to_owned(),
                            content: format!("c{client}-{n}-a\nc{client}-{n}-b"),
                        }
                    };
                    let response = send_command(&socket, &command).expect("round trip");
                    assert!(response.success, "{response:?}");
                }
            })
        })
        .collect::<Vec<_>>();
    for client in clients {
        client.join().expect("client thread");
    }

    let content = harness.content("logs");
    let lines = content.lines().collect::<Vec<_>>();
    assert!(!lines.is_empty());
    assert_eq!(lines.len() % 2, 0, "partial command visible: {content}");
    for pair in lines.chunks(2) {
        let prefix = pair[0]
            .strip_suffix("-a")
            .unwrap_or_else(|| panic!("interleaved output: {content}"));
        assert_eq!(pair[1], format!("{prefix}-b"), "interleaved output: {content}");
    }

    harness.stop();
}

#[test]
fn stale_socket_is_replaced_and_removed_on_shutdown() {
    let socket = temp_socket("stale");
    drop(UnixListener::bind(&socket).expect("bind a socket to abandon"));
    assert!(socket.exists(), "abandoned socket file should remain");

    let harness = Harness::start_at(socket.clone());
    let response = harness.send(ControlCommand::GetStatus {});
    assert!(response.success);
    harness.stop();

    assert!(!Path::new(&socket).exists(), "socket file left behind");
}

#[test]
fn regular_file_at_socket_path_is_refused_and_kept() {
    let socket = temp_socket("regular");
    fs::write(&socket, b"[[layouts]]\n").expect("write regular file");

    let config = AppConfig::from_toml_str(LAYOUT).expect("config parses");
    let runtime = Runtime::new(config, None).expect("runtime builds");
    match ControlServer::bind(&socket, Duration::from_secs(5), runtime.control_handler()) {
        Err(ServerError::NotASocket(path)) => assert_eq!(path, socket),
        other => panic!("expected NotASocket, got {other:?}"),
    }
    assert_eq!(fs::read(&socket).expect("file kept"), b"[[layouts]]\n");
}

#[test]
fn live_socket_is_refused_and_keeps_serving() {
    let harness = Harness::start("live");

    let config = AppConfig::from_toml_str(LAYOUT).expect("config parses");
    let second = Runtime::new(config, None).expect("runtime builds");
    match ControlServer::bind(&harness.socket, Duration::from_secs(5), second.control_handler()) {
        Err(ServerError::InUse(path)) => assert_eq!(path, harness.socket),
        other => panic!("expected InUse, got {other:?}"),
    }

    let response = harness.send(ControlCommand::GetStatus {});
    assert!(response.success, "first instance lost its socket: {response:?}");
    harness.stop();
}

#[test]
fn oversized_request_is_rejected_and_the_connection_recovers() {
    let harness = Harness::start("oversized");

    let stream = UnixStream::connect(&harness.socket).expect("connect");
    let mut writer = stream.try_clone().expect("clone stream");
    let mut reader = BufReader::new(stream);

    let mut oversized = vec![b'x'; MAX_REQUEST_BYTES + 4096];
    oversized.push(b'\n');
    writer.write_all(&oversized).expect("write oversized line");
    writer
        .write_all(b"{\"GetStatus\":{}}\n")
        .expect("write follow-up");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read error reply");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], false);
    assert_eq!(response["error_code"], ErrorCode::InvalidCommand.as_str());
    assert!(
        response["error"]
            .as_str()
            .is_some_and(|message| message.contains("exceeds")),
        "{line}"
    );

    line.clear();
    reader.read_line(&mut line).expect("read status reply");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json response");
    assert_eq!(response["success"], true);
    drop(writer);
    drop(reader);

    harness.stop();
}
