use super::*;
use crate::stream::{StreamSource, CONTENT_STREAM_ID};
use crate::test_support::{env_lock, EnvGuard};

const SAMPLE: &str = r#"
shell = "bash"

[variables]
REGION = "eu"

[hot_keys]
"ctrl+r" = "refresh:clock"

[[layouts]]
id = "main"
title = "Main ${REGION}"

[[layouts.boxes]]
id = "root"
title = "Root"
variables = { HOST = "db.${REGION}" }

[[layouts.boxes.children]]
id = "clock"
title = "Clock @ ${HOST}"
script = ["date"]
refresh_interval_ms = 500
position = { x1 = 0.0, y1 = 0.0, x2 = 50.0, y2 = 100.0 }
border_color = "bright_cyan"

[[layouts.boxes.children]]
id = "shell"
script = "ssh ${HOST:localhost}"
pty = true
tab_order = 1

[[layouts.boxes.children.choices]]
id = "tail"
label = "Tail logs"
script = ["tail -f /var/log/syslog"]
redirect_output = "clock"

[[layouts]]
id = "ops"
root = true
"#;

#[test]
fn defaults_apply_when_fields_are_missing() {
    let config = AppConfig::from_toml_str("[[layouts]]\nid = \"main\"\n").expect("config parses");
    assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    assert_eq!(config.socket_idle_timeout_ms, 5000);
    assert_eq!(config.scroll_capacity, DEFAULT_SCROLL_CAPACITY);
    assert_eq!(config.kill_grace(), Duration::from_millis(300));
    assert_eq!(config.shell, "sh");
    assert_eq!(config.max_line_bytes, MAX_LINE_BYTES);
    assert_eq!(config.max_request_bytes, MAX_REQUEST_BYTES);
    assert_eq!(config.active_layout_id(), Some("main"));
}

#[test]
fn box_config_survives_the_control_wire_format() {
    let config = AppConfig::from_toml_str(SAMPLE).expect("config parses");
    let root = &config.layouts[0].boxes[0];
    let encoded = serde_json::to_string(root).expect("encode box");
    let decoded: BoxConfig = serde_json::from_str(&encoded).expect("decode box");
    assert_eq!(&decoded, root);
}

#[test]
fn graft_box_builds_on_a_copy() {
    let _lock = env_lock();
    let _env = EnvGuard::set_many(&[("HOST", None), ("REGION", None)]);

    let config = AppConfig::from_toml_str(SAMPLE).expect("config parses");
    let layouts = config.build_layouts().expect("layouts build");
    let main = &layouts["main"];
    let extra: BoxConfig =
        serde_json::from_str(r#"{"id":"extra","title":"On ${HOST}"}"#).expect("box json");

    let grafted = config
        .graft_box(main, &extra, Some("root"))
        .expect("graft builds");
    assert!(!main.contains("extra"));
    assert_eq!(
        grafted.get("extra").and_then(|mux| mux.title.clone()),
        Some("On db.${REGION}".to_owned())
    );

    let clash: BoxConfig = serde_json::from_str(r#"{"id":"clock"}"#).expect("box json");
    assert!(matches!(
        config.graft_box(main, &clash, None),
        Err(ConfigError::Layout {
            error: LayoutError::DuplicateBox(_),
            ..
        })
    ));
}

#[test]
fn root_layout_wins_over_declaration_order() {
    let config = AppConfig::from_toml_str(SAMPLE).expect("config parses");
    assert_eq!(config.active_layout_id(), Some("ops"));
}

#[test]
fn build_resolves_tree_sources_and_variables() {
    let _lock = env_lock();
    let _env = EnvGuard::set_many(&[("HOST", None), ("REGION", None)]);

    let config = AppConfig::from_toml_str(SAMPLE).expect("config parses");
    let layouts = config.build_layouts().expect("layouts build");
    let main = layouts.get("main").expect("main layout");

    let clock = main.get("clock").expect("clock box");
    assert_eq!(clock.parent.as_deref(), Some("root"));
    assert_eq!(clock.title.as_deref(), Some("Clock @ db.${REGION}"));
    assert!(clock.style.border_color.is_some());
    match &clock.content_stream().source {
        StreamSource::Script(script) => {
            assert_eq!(script.command, vec!["date".to_owned()]);
            assert_eq!(script.refresh_interval, Some(Duration::from_millis(500)));
        }
        other => panic!("expected script source, got {other:?}"),
    }

    let shell = main.get("shell").expect("shell box");
    assert_eq!(shell.content_stream().id, CONTENT_STREAM_ID);
    match &shell.content_stream().source {
        StreamSource::Pty(pty) => assert_eq!(pty.command, vec!["ssh db.${REGION}".to_owned()]),
        other => panic!("expected pty source, got {other:?}"),
    }
    assert_eq!(shell.choices[0].label, "Tail logs");
    assert_eq!(shell.choices[0].redirect_output.as_deref(), Some("clock"));
}

#[test]
fn invalid_position_is_reported_with_box_id() {
    let source = r#"
[[layouts]]
id = "main"
[[layouts.boxes]]
id = "bad"
position = { x1 = 60.0, y1 = 0.0, x2 = 40.0, y2 = 100.0 }
"#;
    match AppConfig::from_toml_str(source) {
        Err(ConfigError::InvalidPosition { box_id, .. }) => assert_eq!(box_id, "bad"),
        other => panic!("expected invalid position, got {other:?}"),
    }
}

#[test]
fn duplicate_box_ids_are_rejected() {
    let source = r#"
[[layouts]]
id = "main"
[[layouts.boxes]]
id = "twin"
[[layouts.boxes]]
id = "twin"
"#;
    assert!(matches!(
        AppConfig::from_toml_str(source),
        Err(ConfigError::Layout {
            error: LayoutError::DuplicateBox(_),
            ..
        })
    ));
}

#[test]
fn unknown_redirect_target_is_rejected() {
    let source = r#"
[[layouts]]
id = "main"
[[layouts.boxes]]
id = "menu"
[[layouts.boxes.choices]]
id = "go"
script = "true"
redirect_output = "nowhere"
"#;
    assert!(matches!(
        AppConfig::from_toml_str(source),
        Err(ConfigError::UnknownRedirect { .. })
    ));
}

#[test]
fn bad_hot_keys_and_colours_are_rejected() {
    let bad_action = "[hot_keys]\n\"ctrl+x\" = \"explode\"\n[[layouts]]\nid = \"main\"\n";
    assert!(matches!(
        AppConfig::from_toml_str(bad_action),
        Err(ConfigError::InvalidHotKeyAction { .. })
    ));

    let bad_colour = "[[layouts]]\nid = \"main\"\n[[layouts.boxes]]\nid = \"a\"\nfg_color = \"plaid\"\n";
    assert!(matches!(
        AppConfig::from_toml_str(bad_colour),
        Err(ConfigError::InvalidColor {
            field: "fg_color",
            ..
        })
    ));
}

#[test]
fn missing_layouts_is_an_error() {
    assert!(matches!(
        AppConfig::from_toml_str("shell = \"sh\"\n"),
        Err(ConfigError::NoLayouts)
    ));
}

#[test]
fn socket_env_overrides_config_path() {
    let _lock = env_lock();
    let _env = EnvGuard::set_many(&[(SOCKET_ENV, Some("/tmp/boxmux-test.sock"))]);
    let mut config = AppConfig::default();
    config.apply_env_overrides();
    assert_eq!(config.socket_path, PathBuf::from("/tmp/boxmux-test.sock"));
}
