use super::*;
use serde_json::json;

#[test]
fn parses_externally_tagged_commands() {
    assert_eq!(
        parse_command(r#"{"UpdateBox":{"box_id":"status","content":"Hello"}}"#),
        Ok(ControlCommand::UpdateBox {
            box_id: "status".to_owned(),
            content: "Hello".to_owned(),
        })
    );
    assert_eq!(
        parse_command(r#"{"ListBoxes":{}}"#),
        Ok(ControlCommand::ListBoxes {})
    );
    assert_eq!(
        parse_command(r#"{"kill_pty_process":{"box_id":"shell"}}"#),
        Ok(ControlCommand::KillPtyProcess {
            box_id: "shell".to_owned(),
        })
    );
    assert_eq!(
        parse_command(r#"{"ExecuteScript":{"box_id":"a","script":["echo hi"]}}"#),
        Ok(ControlCommand::ExecuteScript {
            box_id: "a".to_owned(),
            script: vec!["echo hi".to_owned()],
            append: false,
        })
    );
    assert_eq!(
        parse_command(r#"{"ReloadConfig":{}}"#),
        Ok(ControlCommand::ReloadConfig { path: None })
    );
}

#[test]
fn unknown_or_malformed_commands_are_invalid() {
    for line in [
        r#"{"Explode":{}}"#,
        r#"{"FocusBox":{}}"#,
        "not json",
        r#"{"FocusBox":{"box_id":"a"},"ListBoxes":{}}"#,
    ] {
        let error = parse_command(line).expect_err(line);
        assert_eq!(error.code, ErrorCode::InvalidCommand, "{line}");
    }
}

#[test]
fn failure_envelope_carries_error_code() {
    let line = ControlResponse::failure(&ControlError::box_not_found("missing_id")).to_line();
    assert!(line.ends_with('\n'));
    let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
    assert_eq!(value["success"], false);
    assert_eq!(value["error_code"], "BOX_NOT_FOUND");
    assert_eq!(value["error"], "box `missing_id` not found");
    assert!(value.get("data").is_none());
}

#[test]
fn success_envelope_omits_error_fields() {
    let response = ControlResponse::ok("done").with_data(json!({"content": "Hello"}));
    let value = serde_json::to_value(&response).expect("serializes");
    assert_eq!(
        value,
        json!({"success": true, "message": "done", "data": {"content": "Hello"}})
    );
}

#[test]
fn command_round_trips_through_json() {
    let command = ControlCommand::SetBoxState {
        box_id: "logs".to_owned(),
        focusable: Some(false),
        tab_order: None,
    };
    let line = serde_json::to_string(&command).expect("serializes");
    assert_eq!(parse_command(&line), Ok(command));
}
