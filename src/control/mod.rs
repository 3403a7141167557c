//! Newline-delimited JSON control protocol.
//!
//! Each request is one JSON object whose single top-level key names the
//! command (`{"FocusBox":{"box_id":"logs"}}`); each reply is one
//! [`ControlResponse`] line.

use std::path::PathBuf;

use serde_json::Value;

use crate::config::BoxConfig;

mod client;
mod server;

pub use client::{send_command, send_raw, ClientError};
pub use server::{CommandHandler, ControlServer, ServerError, MAX_REQUEST_BYTES};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ControlCommand {
    UpdateBox {
        box_id: String,
        content: String,
    },
    AppendBox {
        box_id: String,
        content: String,
    },
    RefreshBox {
        box_id: String,
    },
    SetBoxProperty {
        box_id: String,
        property: String,
        value: Value,
    },
    ExecuteScript {
        box_id: String,
        script: Vec<String>,
        #[serde(default)]
        append: bool,
    },
    SendKey {
        key: String,
    },
    FocusBox {
        box_id: String,
    },
    GetBoxInfo {
        box_id: String,
    },
    ListBoxes {},
    SwitchLayout {
        layout_id: String,
    },
    GetStatus {},
    Shutdown {},
    #[serde(rename = "kill_pty_process")]
    KillPtyProcess {
        box_id: String,
    },
    #[serde(rename = "restart_pty_process")]
    RestartPtyProcess {
        box_id: String,
    },
    #[serde(rename = "query_pty_status")]
    QueryPtyStatus {
        box_id: String,
    },
    RemoveBox {
        box_id: String,
    },
    /// Adds a box tree to a layout (the active one when `layout_id` is
    /// omitted), as a root or under `parent`.
    AddBox {
        #[serde(default)]
        layout_id: Option<String>,
        #[serde(default)]
        parent: Option<String>,
        #[serde(rename = "box")]
        config: BoxConfig,
    },
    /// Swaps an active-layout box and its subtree for a new tree.
    ReplaceBox {
        box_id: String,
        #[serde(rename = "box")]
        config: BoxConfig,
    },
    ReloadConfig {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    ActivateStream {
        box_id: String,
        index: usize,
    },
    CloseStream {
        box_id: String,
        index: usize,
    },
    StopBoxRefresh {
        box_id: String,
    },
    StartBoxRefresh {
        box_id: String,
    },
    ReplaceBoxScript {
        box_id: String,
        script: Vec<String>,
    },
    RunChoice {
        box_id: String,
        choice_id: String,
    },
    SetBoxState {
        box_id: String,
        #[serde(default)]
        focusable: Option<bool>,
        #[serde(default)]
        tab_order: Option<i32>,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::UpdateBox { .. } => "UpdateBox",
            ControlCommand::AppendBox { .. } => "AppendBox",
            ControlCommand::RefreshBox { .. } => "RefreshBox",
            ControlCommand::SetBoxProperty { .. } => "SetBoxProperty",
            ControlCommand::ExecuteScript { .. } => "ExecuteScript",
            ControlCommand::SendKey { .. } => "SendKey",
            ControlCommand::FocusBox { .. } => "FocusBox",
            ControlCommand::GetBoxInfo { .. } => "GetBoxInfo",
            ControlCommand::ListBoxes {} => "ListBoxes",
            ControlCommand::SwitchLayout { .. } => "SwitchLayout",
            ControlCommand::GetStatus {} => "GetStatus",
            ControlCommand::Shutdown {} => "Shutdown",
            ControlCommand::KillPtyProcess { .. } => "kill_pty_process",
            ControlCommand::RestartPtyProcess { .. } => "restart_pty_process",
            ControlCommand::QueryPtyStatus { .. } => "query_pty_status",
            ControlCommand::RemoveBox { .. } => "RemoveBox",
            ControlCommand::AddBox { .. } => "AddBox",
            ControlCommand::ReplaceBox { .. } => "ReplaceBox",
            ControlCommand::ReloadConfig { .. } => "ReloadConfig",
            ControlCommand::ActivateStream { .. } => "ActivateStream",
            ControlCommand::CloseStream { .. } => "CloseStream",
            ControlCommand::StopBoxRefresh { .. } => "StopBoxRefresh",
            ControlCommand::StartBoxRefresh { .. } => "StartBoxRefresh",
            ControlCommand::ReplaceBoxScript { .. } => "ReplaceBoxScript",
            ControlCommand::RunChoice { .. } => "RunChoice",
            ControlCommand::SetBoxState { .. } => "SetBoxState",
        }
    }
}

/// Parses one request line.
pub fn parse_command(line: &str) -> Result<ControlCommand, ControlError> {
    serde_json::from_str(line.trim())
        .map_err(|error| ControlError::invalid_command(format!("malformed command: {error}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BoxNotFound,
    LayoutNotFound,
    InvalidCommand,
    PermissionDenied,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BoxNotFound => "BOX_NOT_FOUND",
            ErrorCode::LayoutNotFound => "LAYOUT_NOT_FOUND",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlError {
    pub code: ErrorCode,
    pub message: String,
}

impl ControlError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn box_not_found(box_id: &str) -> Self {
        Self::new(ErrorCode::BoxNotFound, format!("box `{box_id}` not found"))
    }

    pub fn layout_not_found(layout_id: &str) -> Self {
        Self::new(
            ErrorCode::LayoutNotFound,
            format!("layout `{layout_id}` not found"),
        )
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCommand, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ControlError {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
            error: None,
            error_code: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failure(error: &ControlError) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.message.clone()),
            error_code: Some(error.code),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|error| {
            format!(
                "{{\"success\":false,\"error\":\"response encoding failed: {error}\",\"error_code\":\"INVALID_COMMAND\"}}"
            )
        });
        line.push('\n');
        line
    }
}

impl From<Result<ControlResponse, ControlError>> for ControlResponse {
    fn from(result: Result<ControlResponse, ControlError>) -> Self {
        match result {
            Ok(response) => response,
            Err(error) => ControlResponse::failure(&error),
        }
    }
}

#[cfg(test)]
#[path = "../tests/control_protocol_tests.rs"]
mod tests;
