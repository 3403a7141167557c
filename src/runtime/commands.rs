use std::time::Duration;

use anstyle::Color;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::control::{ControlCommand, ControlError, ControlResponse};
use crate::keys::KeyChord;
use crate::muxbox::{MuxBox, StreamError};
use crate::process_manager::{CaptureMode, LaunchTrigger, StreamKey};
use crate::stream::{decorate_title, ScriptSource, StreamSource, CONTENT_STREAM_ID};
use crate::style::{color_name, parse_color};

use super::{LoopControl, RuntimeState};

const STYLE_PROPERTIES: [&str; 6] = [
    "bg_color",
    "fg_color",
    "title_bg_color",
    "title_fg_color",
    "border_color",
    "selected_border_color",
];

impl RuntimeState {
    /// Applies one control command and builds its response. Failures never
    /// leave partial changes behind: every check runs before the first write.
    pub fn handle_command(&mut self, command: ControlCommand) -> ControlResponse {
        let name = command.name();
        log::info!("control command {name}");
        let result = self.apply_command(command);
        if let Err(error) = &result {
            log::warn!("control command {name} failed: {error}");
        }
        result.into()
    }

    fn apply_command(&mut self, command: ControlCommand) -> Result<ControlResponse, ControlError> {
        match command {
            ControlCommand::UpdateBox { box_id, content } => {
                self.box_mut(&box_id)?
                    .active_stream_mut()
                    .replace_content(&content);
                Ok(ControlResponse::ok(format!("box `{box_id}` updated")))
            }
            ControlCommand::AppendBox { box_id, content } => {
                self.box_mut(&box_id)?
                    .active_stream_mut()
                    .append_content(&content);
                Ok(ControlResponse::ok(format!("appended to box `{box_id}`")))
            }
            ControlCommand::RefreshBox { box_id } => {
                self.refresh_box(&box_id)?;
                Ok(ControlResponse::ok(format!("box `{box_id}` refreshed")))
            }
            ControlCommand::SetBoxProperty {
                box_id,
                property,
                value,
            } => {
                self.set_box_property(&box_id, &property, &value)?;
                Ok(ControlResponse::ok(format!(
                    "box `{box_id}` property `{property}` set"
                )))
            }
            ControlCommand::ExecuteScript {
                box_id,
                script,
                append,
            } => {
                let capture = if append {
                    CaptureMode::Append
                } else {
                    CaptureMode::Replace
                };
                self.execute_ad_hoc(&box_id, script, capture)?;
                Ok(ControlResponse::ok(format!("script started in box `{box_id}`")))
            }
            ControlCommand::SendKey { key } => {
                let chord = KeyChord::parse(&key).map_err(|error| {
                    ControlError::invalid_command(format!("invalid key `{key}`: {error}"))
                })?;
                if self.handle_key(chord) == LoopControl::Quit {
                    self.shutdown_requested = true;
                }
                Ok(ControlResponse::ok(format!("key `{chord}` sent")))
            }
            ControlCommand::FocusBox { box_id } => {
                if !self.box_ref(&box_id)?.focusable {
                    return Err(ControlError::permission_denied(format!(
                        "box `{box_id}` is not focusable"
                    )));
                }
                self.focus_id = Some(box_id.clone());
                Ok(ControlResponse::ok(format!("focused box `{box_id}`")))
            }
            ControlCommand::GetBoxInfo { box_id } => {
                let info = self.box_info(self.box_ref(&box_id)?);
                Ok(ControlResponse::ok(format!("box `{box_id}`")).with_data(info))
            }
            ControlCommand::ListBoxes {} => {
                let boxes = self
                    .active_layout
                    .boxes()
                    .map(|mux| self.box_summary(mux))
                    .collect::<Vec<Value>>();
                let message = format!("{} boxes", boxes.len());
                Ok(ControlResponse::ok(message).with_data(json!({
                    "layout": self.active_layout.id,
                    "boxes": boxes,
                })))
            }
            ControlCommand::SwitchLayout { layout_id } => {
                self.switch_layout(&layout_id)?;
                Ok(ControlResponse::ok(format!("switched to layout `{layout_id}`")))
            }
            ControlCommand::GetStatus {} => {
                Ok(ControlResponse::ok("running").with_data(self.status()))
            }
            ControlCommand::Shutdown {} => {
                self.shutdown_requested = true;
                Ok(ControlResponse::ok("shutting down"))
            }
            ControlCommand::KillPtyProcess { box_id } => {
                let stream_id = self.pty_stream_id(&box_id)?;
                let killed = self.kill_stream(&box_id, &stream_id);
                let message = if killed {
                    format!("PTY process for box `{box_id}` killed")
                } else {
                    format!("no PTY process running for box `{box_id}`")
                };
                Ok(ControlResponse::ok(message))
            }
            ControlCommand::RestartPtyProcess { box_id } => {
                let stream_id = self.pty_stream_id(&box_id)?;
                if let Some(StreamSource::Pty(pty)) = self
                    .box_mut(&box_id)?
                    .stream_by_id_mut(&stream_id)
                    .map(|stream| &mut stream.source)
                {
                    pty.fallback = false;
                    pty.retry_pending = false;
                }
                self.launch_stream(&box_id, &stream_id, LaunchTrigger::Explicit);
                let status = self.pty_status(&box_id, &stream_id)?;
                Ok(ControlResponse::ok(format!("PTY process for box `{box_id}` restarted"))
                    .with_data(status))
            }
            ControlCommand::QueryPtyStatus { box_id } => {
                let stream_id = self.pty_stream_id(&box_id)?;
                let status = self.pty_status(&box_id, &stream_id)?;
                Ok(ControlResponse::ok(format!("PTY status for box `{box_id}`")).with_data(status))
            }
            ControlCommand::RemoveBox { box_id } => {
                self.box_ref(&box_id)?;
                let removed = self.active_layout.remove(&box_id);
                self.retire_boxes(&removed);
                Ok(ControlResponse::ok(format!(
                    "removed {} boxes under `{box_id}`",
                    removed.len()
                )))
            }
            ControlCommand::AddBox {
                layout_id,
                parent,
                config,
            } => {
                let layout_id = layout_id.unwrap_or_else(|| self.active_layout.id.clone());
                let added = self.add_box(&layout_id, parent.as_deref(), &config)?;
                Ok(ControlResponse::ok(format!(
                    "added {} boxes to layout `{layout_id}`",
                    added.len()
                ))
                .with_data(json!({ "layout": layout_id, "boxes": added })))
            }
            ControlCommand::ReplaceBox { box_id, config } => {
                let added = self.replace_box(&box_id, &config)?;
                Ok(
                    ControlResponse::ok(format!("replaced box `{box_id}` with `{}`", config.id))
                        .with_data(json!({ "boxes": added })),
                )
            }
            ControlCommand::ReloadConfig { path } => {
                let Some(path) = path.or_else(|| self.config_path.clone()) else {
                    return Err(ControlError::invalid_command(
                        "no configuration path to reload from",
                    ));
                };
                let config = AppConfig::load(&path)
                    .map_err(|error| ControlError::invalid_command(error.to_string()))?;
                self.reload(config, Some(path.clone()))
                    .map_err(|error| ControlError::invalid_command(error.to_string()))?;
                Ok(ControlResponse::ok(format!(
                    "reloaded configuration from {}",
                    path.display()
                )))
            }
            ControlCommand::ActivateStream { box_id, index } => {
                self.box_mut(&box_id)?
                    .activate_stream(index)
                    .map_err(stream_error)?;
                Ok(ControlResponse::ok(format!(
                    "box `{box_id}` shows stream {index}"
                )))
            }
            ControlCommand::CloseStream { box_id, index } => {
                let closed = self.box_mut(&box_id)?.close_stream(index).map_err(stream_error)?;
                self.supervisor.kill(&closed.key(&box_id));
                Ok(ControlResponse::ok(format!(
                    "closed stream `{}` of box `{box_id}`",
                    closed.label
                )))
            }
            ControlCommand::StopBoxRefresh { box_id } => {
                self.script_source_mut(&box_id)?.refresh_enabled = false;
                Ok(ControlResponse::ok(format!("refresh stopped for box `{box_id}`")))
            }
            ControlCommand::StartBoxRefresh { box_id } => {
                self.script_source_mut(&box_id)?.refresh_enabled = true;
                Ok(ControlResponse::ok(format!("refresh started for box `{box_id}`")))
            }
            ControlCommand::ReplaceBoxScript { box_id, script } => {
                if script.iter().all(|line| line.trim().is_empty()) {
                    return Err(ControlError::invalid_command("script is empty"));
                }
                let stream = self.box_mut(&box_id)?.content_stream_mut();
                if matches!(stream.source, StreamSource::Static { .. }) {
                    stream.set_source(StreamSource::Script(ScriptSource::new(script)));
                } else {
                    match &mut stream.source {
                        StreamSource::Script(source) => source.command = script,
                        StreamSource::Pty(source) => {
                            source.command = script;
                            source.fallback = false;
                            source.retry_pending = false;
                        }
                        StreamSource::Static { .. } => {}
                    }
                }
                self.launch_stream(&box_id, CONTENT_STREAM_ID, LaunchTrigger::Explicit);
                Ok(ControlResponse::ok(format!("script replaced for box `{box_id}`")))
            }
            ControlCommand::RunChoice { box_id, choice_id } => {
                let target = self.run_choice(&box_id, &choice_id)?;
                Ok(ControlResponse::ok(format!(
                    "choice `{choice_id}` running in box `{target}`"
                )))
            }
            ControlCommand::SetBoxState {
                box_id,
                focusable,
                tab_order,
            } => {
                let mux = self.box_mut(&box_id)?;
                if let Some(focusable) = focusable {
                    mux.focusable = focusable;
                }
                if tab_order.is_some() {
                    mux.tab_order = tab_order;
                }
                if focusable == Some(false) && self.focus_id.as_deref() == Some(box_id.as_str()) {
                    self.focus_id = self.active_layout.next_focus(Some(&box_id));
                }
                Ok(ControlResponse::ok(format!("box `{box_id}` state updated")))
            }
        }
    }

    pub(super) fn refresh_box(&mut self, box_id: &str) -> Result<(), ControlError> {
        self.script_source_mut(box_id)?;
        self.launch_stream(box_id, CONTENT_STREAM_ID, LaunchTrigger::Explicit);
        Ok(())
    }

    fn script_source_mut(&mut self, box_id: &str) -> Result<&mut ScriptSource, ControlError> {
        match &mut self.box_mut(box_id)?.content_stream_mut().source {
            StreamSource::Script(script) => Ok(script),
            _ => Err(ControlError::invalid_command(format!(
                "box `{box_id}` has no script"
            ))),
        }
    }

    /// The active stream when it is a PTY, else the box's first PTY stream.
    fn pty_stream_id(&self, box_id: &str) -> Result<String, ControlError> {
        let mux = self.box_ref(box_id)?;
        if mux.active_stream().source.is_pty() {
            return Ok(mux.active_stream().id.clone());
        }
        mux.streams()
            .iter()
            .find(|stream| stream.source.is_pty())
            .map(|stream| stream.id.clone())
            .ok_or_else(|| {
                ControlError::invalid_command(format!("box `{box_id}` has no PTY stream"))
            })
    }

    fn pty_status(&self, box_id: &str, stream_id: &str) -> Result<Value, ControlError> {
        let mux = self.box_ref(box_id)?;
        let Some(StreamSource::Pty(pty)) = mux.stream_by_id(stream_id).map(|stream| &stream.source)
        else {
            return Err(ControlError::invalid_command(format!(
                "box `{box_id}` has no PTY stream"
            )));
        };
        let status = self.supervisor.status(&StreamKey::new(box_id, stream_id));
        Ok(json!({
            "box_id": box_id,
            "stream_id": stream_id,
            "state": pty.state.label(),
            "reason": pty.state.reason(),
            "pid": status.pid,
            "running": status.running,
            "uptime_ms": status.uptime.map(duration_ms),
            "exit": status.exit.or_else(|| pty.last_exit.clone()),
            "failure_count": status.failure_count,
            "fallback": pty.fallback,
        }))
    }

    fn set_box_property(
        &mut self,
        box_id: &str,
        property: &str,
        value: &Value,
    ) -> Result<(), ControlError> {
        self.box_ref(box_id)?;
        if STYLE_PROPERTIES.contains(&property) {
            let color = match value {
                Value::Null => None,
                Value::String(raw) => Some(parse_color(raw).ok_or_else(|| {
                    ControlError::invalid_command(format!("invalid colour `{raw}`"))
                })?),
                _ => return Err(invalid_value(property, value)),
            };
            let style = &mut self.box_mut(box_id)?.style;
            let slot: &mut Option<Color> = match property {
                "bg_color" => &mut style.bg_color,
                "fg_color" => &mut style.fg_color,
                "title_bg_color" => &mut style.title_bg_color,
                "title_fg_color" => &mut style.title_fg_color,
                "border_color" => &mut style.border_color,
                _ => &mut style.selected_border_color,
            };
            *slot = color;
            return Ok(());
        }
        match property {
            "title" => {
                let title = match value {
                    Value::Null => None,
                    Value::String(title) => Some(title.clone()),
                    _ => return Err(invalid_value(property, value)),
                };
                self.box_mut(box_id)?.title = title;
            }
            "content" => {
                let Value::String(content) = value else {
                    return Err(invalid_value(property, value));
                };
                self.box_mut(box_id)?
                    .active_stream_mut()
                    .replace_content(content);
            }
            "refresh_interval" => {
                let interval = match value {
                    Value::Null => None,
                    Value::Number(ms) => Some(Duration::from_millis(
                        ms.as_u64().ok_or_else(|| invalid_value(property, value))?,
                    )),
                    _ => return Err(invalid_value(property, value)),
                };
                self.script_source_mut(box_id)?.refresh_interval = interval;
            }
            _ => {
                return Err(ControlError::invalid_command(format!(
                    "unknown box property `{property}`"
                )))
            }
        }
        Ok(())
    }

    fn box_summary(&self, mux: &MuxBox) -> Value {
        let stream = mux.active_stream();
        json!({
            "id": mux.id,
            "title": mux.title,
            "parent": mux.parent,
            "focusable": mux.focusable,
            "focused": self.focus_id.as_deref() == Some(mux.id.as_str()),
            "streams": mux.streams().len(),
            "kind": stream.source.kind(),
            "state": stream.source.state().map(|state| state.label()),
        })
    }

    fn box_info(&self, mux: &MuxBox) -> Value {
        let active = mux.active_stream();
        let visual = active.visual_state();
        let streams = mux
            .streams()
            .iter()
            .enumerate()
            .map(|(index, stream)| {
                json!({
                    "index": index,
                    "id": stream.id,
                    "label": stream.label,
                    "kind": stream.source.kind(),
                    "closeable": stream.closeable,
                    "active": index == mux.active_stream_index(),
                    "state": stream.source.state().map(|state| state.label()),
                    "reason": stream.source.state().and_then(|state| state.reason()),
                })
            })
            .collect::<Vec<Value>>();
        let (cursor, lines, following) = active
            .buffer()
            .read(|buffer| (buffer.cursor(), buffer.len(), buffer.is_following()));
        let bounds = self.active_layout.bounds(&mux.id, self.screen);
        let color = |color: Option<Color>| color.map(color_name);
        json!({
            "id": mux.id,
            "title": mux.title,
            "display_title": decorate_title(mux.title.as_deref().unwrap_or_default(), &visual),
            "border": visual.border.map(color_name),
            "parent": mux.parent,
            "children": mux.children,
            "focusable": mux.focusable,
            "focused": self.focus_id.as_deref() == Some(mux.id.as_str()),
            "tab_order": mux.tab_order,
            "position": {
                "x1": mux.position.x1,
                "y1": mux.position.y1,
                "x2": mux.position.x2,
                "y2": mux.position.y2,
            },
            "bounds": bounds.map(|rect| json!({
                "x": rect.x,
                "y": rect.y,
                "width": rect.width,
                "height": rect.height,
            })),
            "style": {
                "bg_color": color(mux.style.bg_color),
                "fg_color": color(mux.style.fg_color),
                "title_bg_color": color(mux.style.title_bg_color),
                "title_fg_color": color(mux.style.title_fg_color),
                "border_color": color(mux.style.border_color),
                "selected_border_color": color(mux.style.selected_border_color),
            },
            "variables": mux.variables,
            "choices": mux.choices.iter().map(|choice| json!({
                "id": choice.id,
                "label": choice.label,
                "pty": choice.pty,
                "redirect_output": choice.redirect_output,
            })).collect::<Vec<Value>>(),
            "active_stream": mux.active_stream_index(),
            "streams": streams,
            "kind": active.source.kind(),
            "state": active.source.state().map(|state| state.label()),
            "content": active.buffer().content(),
            "screen": active.screen().map(|screen| screen.rows()),
            "scroll": {
                "cursor": cursor,
                "lines": lines,
                "following": following,
            },
        })
    }

    fn status(&self) -> Value {
        json!({
            "layout": self.active_layout.id,
            "layouts": self.layout_ids(),
            "focus": self.focus_id,
            "boxes": self.active_layout.len(),
            "processes": self.supervisor.len(),
            "pids": self.supervisor.tracked_pids(),
            "socket_path": self.socket_path().display().to_string(),
            "config_path": self.config_path.as_ref().map(|path| path.display().to_string()),
            "uptime_ms": duration_ms(self.started_at.elapsed()),
            "screen": { "width": self.screen.width, "height": self.screen.height },
        })
    }
}

fn stream_error(error: StreamError) -> ControlError {
    match error {
        StreamError::NotCloseable { .. } => ControlError::permission_denied(error.to_string()),
        StreamError::InvalidIndex { .. } => ControlError::invalid_command(error.to_string()),
    }
}

fn invalid_value(property: &str, value: &Value) -> ControlError {
    ControlError::invalid_command(format!("invalid value {value} for `{property}`"))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
