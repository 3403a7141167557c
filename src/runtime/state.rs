use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;

use crate::config::{AppConfig, BoxConfig, ConfigError};
use crate::control::ControlError;
use crate::keys::{default_hot_keys, HotKeyAction, KeyChord};
use crate::layout::Layout;
use crate::muxbox::{MuxBox, Rect};
use crate::process_manager::{
    CaptureMode, ExitSink, LaunchKind, LaunchSpec, LaunchTarget, LaunchTrigger, ProcessExit,
    ProcessKind, ProcessSupervisor, ShutdownProgress, SpawnError, StreamKey, DEFAULT_PTY_SIZE,
    FAILURE_THRESHOLD,
};
use crate::stream::{
    ProcessState, PtySource, ScriptSource, Stream, StreamOrigin, StreamSource, CONTENT_STREAM_ID,
};

use super::RuntimeEvent;

/// The process-wide mutable state. Owned by the dispatch loop; nothing else
/// holds a reference to it.
#[derive(Debug)]
pub struct RuntimeState {
    pub(super) config: AppConfig,
    pub(super) config_path: Option<PathBuf>,
    pub(super) active_layout: Layout,
    /// Loaded layouts other than the active one.
    pub(super) standby: IndexMap<String, Layout>,
    pub(super) focus_id: Option<String>,
    pub(super) hot_keys: Vec<(KeyChord, HotKeyAction)>,
    socket_path: PathBuf,
    pub(super) supervisor: ProcessSupervisor,
    pub(super) screen: Rect,
    pub(super) started_at: Instant,
    pub(super) shutdown_requested: bool,
}

/// Layouts and hot keys built from one configuration snapshot.
struct Loaded {
    active: Layout,
    standby: IndexMap<String, Layout>,
    hot_keys: Vec<(KeyChord, HotKeyAction)>,
}

fn load(config: &AppConfig) -> Result<Loaded, ConfigError> {
    let mut hot_keys = default_hot_keys();
    for (chord, action) in config.hot_key_bindings()? {
        hot_keys.retain(|(bound, _)| *bound != chord);
        hot_keys.push((chord, action));
    }
    let mut standby = config.build_layouts()?;
    let active_id = config
        .active_layout_id()
        .ok_or(ConfigError::NoLayouts)?
        .to_owned();
    let active = standby
        .shift_remove(&active_id)
        .ok_or(ConfigError::NoLayouts)?;
    Ok(Loaded {
        active,
        standby,
        hot_keys,
    })
}

impl RuntimeState {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        events: Sender<RuntimeEvent>,
    ) -> Result<Self, ConfigError> {
        let Loaded {
            active,
            standby,
            hot_keys,
        } = load(&config)?;
        let exit_sink: ExitSink = Arc::new(move |exit| {
            if events.send(RuntimeEvent::ProcessExited(exit)).is_err() {
                log::debug!("process exit arrived after the dispatch loop stopped");
            }
        });
        let supervisor = ProcessSupervisor::new(exit_sink).with_kill_grace(config.kill_grace());
        let focus_id = active.next_focus(None);
        let (rows, cols) = DEFAULT_PTY_SIZE;
        let mut state = Self {
            socket_path: config.socket_path.clone(),
            config,
            config_path,
            active_layout: active,
            standby,
            focus_id,
            hot_keys,
            supervisor,
            screen: Rect::new(0, 0, cols, rows),
            started_at: Instant::now(),
            shutdown_requested: false,
        };
        state.apply_viewports();
        log::info!(
            "runtime ready with layout `{}` ({} boxes)",
            state.active_layout.id,
            state.active_layout.len()
        );
        Ok(state)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn active_layout(&self) -> &Layout {
        &self.active_layout
    }

    /// Ids of every loaded layout, the active one first.
    pub fn layout_ids(&self) -> Vec<String> {
        let mut ids = vec![self.active_layout.id.clone()];
        ids.extend(self.standby.keys().cloned());
        ids
    }

    pub fn focus_id(&self) -> Option<&str> {
        self.focus_id.as_deref()
    }

    pub fn hot_keys(&self) -> &[(KeyChord, HotKeyAction)] {
        &self.hot_keys
    }

    /// Path the control socket was bound to at startup.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn screen(&self) -> Rect {
        self.screen
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub(super) fn box_ref(&self, box_id: &str) -> Result<&MuxBox, ControlError> {
        self.active_layout
            .get(box_id)
            .ok_or_else(|| ControlError::box_not_found(box_id))
    }

    pub(super) fn box_mut(&mut self, box_id: &str) -> Result<&mut MuxBox, ControlError> {
        self.active_layout
            .get_mut(box_id)
            .ok_or_else(|| ControlError::box_not_found(box_id))
    }

    fn stream_mut(&mut self, box_id: &str, stream_id: &str) -> Option<&mut Stream> {
        self.active_layout
            .get_mut(box_id)
            .and_then(|mux| mux.stream_by_id_mut(stream_id))
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.screen = Rect::new(0, 0, cols, rows);
        self.apply_viewports();
    }

    /// Pushes the resolved inner size of every box into its buffers, PTY
    /// screens and live PTYs.
    pub(super) fn apply_viewports(&mut self) {
        let screen = self.screen;
        for mux in self.active_layout.boxes() {
            let Some(bounds) = self.active_layout.bounds(&mux.id, screen) else {
                continue;
            };
            let inner = bounds.inner();
            let (rows, cols) = (inner.height.max(1), inner.width.max(1));
            for stream in mux.streams() {
                stream
                    .buffer()
                    .update(|buffer| buffer.set_viewport_height(usize::from(rows)));
                if let Some(screen) = stream.screen() {
                    screen.set_size(rows, cols);
                    self.supervisor.resize(&stream.key(&mux.id), rows, cols);
                }
            }
        }
    }

    fn launch_spec(&self, key: StreamKey, command: Vec<String>) -> LaunchSpec {
        let pty_size = self
            .active_layout
            .bounds(&key.box_id, self.screen)
            .map(|bounds| {
                let inner = bounds.inner();
                (inner.height.max(1), inner.width.max(1))
            })
            .unwrap_or(DEFAULT_PTY_SIZE);
        let env = self
            .active_layout
            .effective_variables(&key.box_id, &self.config.variables)
            .into_iter()
            .collect();
        let mut spec = LaunchSpec::new(key, command).with_shell(self.config.shell.clone());
        spec.env = env;
        spec.pty_size = pty_size;
        spec.max_line_bytes = self.config.max_line_bytes;
        spec
    }

    /// Starts (or restarts) the process behind one stream from its configured
    /// source and records the outcome on the source. Static streams are left
    /// alone.
    pub(super) fn launch_stream(
        &mut self,
        box_id: &str,
        stream_id: &str,
        trigger: LaunchTrigger,
    ) {
        let Some(stream) = self
            .active_layout
            .get(box_id)
            .and_then(|mux| mux.stream_by_id(stream_id))
        else {
            return;
        };
        let (kind, command) = match &stream.source {
            StreamSource::Static { .. } => return,
            StreamSource::Script(script) => {
                let capture = if script.streaming {
                    CaptureMode::Append
                } else {
                    CaptureMode::Replace
                };
                (LaunchKind::Script(capture), script.command.clone())
            }
            StreamSource::Pty(pty) => (LaunchKind::Pty, pty.command.clone()),
        };
        if command.iter().all(|line| line.trim().is_empty()) {
            return;
        }
        self.launch_command(box_id, stream_id, command, kind, trigger);
    }

    /// Runs `command` on a stream's key and folds the result into its source.
    pub(super) fn launch_command(
        &mut self,
        box_id: &str,
        stream_id: &str,
        command: Vec<String>,
        kind: LaunchKind,
        trigger: LaunchTrigger,
    ) {
        let Some(stream) = self
            .active_layout
            .get(box_id)
            .and_then(|mux| mux.stream_by_id(stream_id))
        else {
            return;
        };
        let key = stream.key(box_id);
        let target = LaunchTarget {
            buffer: stream.buffer().clone(),
            screen: stream.screen().cloned(),
        };
        let spec = self.launch_spec(key.clone(), command);
        let result = match trigger {
            LaunchTrigger::Explicit => self.supervisor.restart(spec, kind, target),
            LaunchTrigger::Automatic => self.supervisor.start(spec, kind, trigger, target),
        };
        let failures = self.supervisor.failure_count(&key);
        let now = Instant::now();
        let Some(stream) = self.stream_mut(box_id, stream_id) else {
            return;
        };
        match (&mut stream.source, result) {
            (StreamSource::Script(script), Ok(handle)) => {
                script.state = ProcessState::Running;
                script.pid = handle.pid;
                script.last_run = Some(now);
            }
            (StreamSource::Script(script), Err(error)) => {
                log::error!("{error}");
                script.state = ProcessState::Error(error.to_string());
                script.pid = None;
                script.last_run = Some(now);
            }
            (StreamSource::Pty(pty), Ok(handle)) => {
                pty.fallback = matches!(handle.kind, ProcessKind::PtyFallback { .. });
                pty.state = ProcessState::Running;
                pty.retry_pending = false;
                pty.failure_count = failures;
                pty.last_attempt = Some(now);
                pty.process_handle = Some(handle);
            }
            (StreamSource::Pty(pty), Err(SpawnError::Suspended { reason, .. })) => {
                pty.state = ProcessState::Dead(reason);
                pty.retry_pending = false;
                pty.failure_count = failures;
                pty.process_handle = None;
            }
            (StreamSource::Pty(pty), Err(error)) => {
                log::error!("{error}");
                let suspended = failures >= FAILURE_THRESHOLD;
                pty.state = if suspended {
                    ProcessState::Dead(error.to_string())
                } else {
                    ProcessState::Error(error.to_string())
                };
                pty.retry_pending = !suspended;
                pty.fallback = false;
                pty.failure_count = failures;
                pty.last_attempt = Some(now);
                pty.process_handle = None;
            }
            (StreamSource::Static { .. }, result) => {
                if let Err(error) = result {
                    log::error!("{error}");
                }
            }
        }
    }

    /// Stops a stream's process, if any, and marks the source stopped.
    pub(super) fn kill_stream(&mut self, box_id: &str, stream_id: &str) -> bool {
        let key = StreamKey::new(box_id, stream_id);
        let killed = self.supervisor.kill(&key);
        if let Some(stream) = self.stream_mut(box_id, stream_id) {
            match &mut stream.source {
                StreamSource::Script(script) => {
                    if script.state.is_live() {
                        script.state = ProcessState::Stopped;
                    }
                    script.pid = None;
                }
                StreamSource::Pty(pty) => {
                    pty.state = ProcessState::Stopped;
                    pty.process_handle = None;
                    pty.retry_pending = false;
                }
                StreamSource::Static { .. } => {}
            }
        }
        killed
    }

    pub(super) fn stream_ids(mux: &MuxBox) -> Vec<String> {
        mux.streams().iter().map(|stream| stream.id.clone()).collect()
    }

    /// Folds a worker's exit report into the stream that produced it. Reports
    /// from processes that were since replaced or killed are dropped.
    pub fn on_process_exit(&mut self, exit: ProcessExit) {
        if !self.supervisor.reap(&exit) {
            log::debug!(
                "ignoring stale exit for {} (generation {})",
                exit.key,
                exit.generation
            );
            return;
        }
        let success = exit.success();
        let diagnostic = exit.diagnostic;
        log::info!("process for {} exited: {diagnostic}", exit.key);
        let Some(stream) = self.stream_mut(&exit.key.box_id, &exit.key.stream_id) else {
            return;
        };
        let state = if success {
            ProcessState::Stopped
        } else {
            ProcessState::Error(diagnostic.clone())
        };
        match &mut stream.source {
            StreamSource::Script(script) => {
                script.state = state;
                script.pid = None;
                script.last_exit = Some(diagnostic);
            }
            StreamSource::Pty(pty) => {
                pty.state = state;
                pty.process_handle = None;
                pty.last_exit = Some(diagnostic);
            }
            StreamSource::Static { .. } => {}
        }
    }

    /// Periodic work: due script refreshes and PTY start retries.
    pub fn tick(&mut self, now: Instant) {
        let retry_delay = self.config.pty_retry_delay();
        let mut due = Vec::new();
        for mux in self.active_layout.boxes() {
            for stream in mux.streams() {
                let is_due = match &stream.source {
                    StreamSource::Script(script) => script.is_due(now),
                    StreamSource::Pty(pty) => pty.is_retry_due(now, retry_delay),
                    StreamSource::Static { .. } => false,
                };
                if is_due {
                    due.push((mux.id.clone(), stream.id.clone()));
                }
            }
        }
        for (box_id, stream_id) in due {
            self.launch_stream(&box_id, &stream_id, LaunchTrigger::Automatic);
        }
    }

    pub fn start_layout_processes(&mut self) {
        let box_ids = self.active_layout.box_ids();
        self.start_box_processes(&box_ids);
    }

    fn start_box_processes(&mut self, box_ids: &[String]) {
        let pending = box_ids
            .iter()
            .filter_map(|box_id| self.active_layout.get(box_id))
            .flat_map(|mux| {
                Self::stream_ids(mux)
                    .into_iter()
                    .map(|stream_id| (mux.id.clone(), stream_id))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for (box_id, stream_id) in pending {
            self.launch_stream(&box_id, &stream_id, LaunchTrigger::Automatic);
        }
    }

    /// Stops the processes of boxes already taken out of the active layout
    /// and moves focus off them.
    pub(super) fn retire_boxes(&mut self, removed: &[MuxBox]) {
        for mux in removed {
            for stream in mux.streams() {
                self.supervisor.kill(&stream.key(&mux.id));
            }
        }
        let focus_gone = self
            .focus_id
            .as_deref()
            .is_some_and(|focus| !self.active_layout.contains(focus));
        if focus_gone {
            self.focus_id = self.active_layout.next_focus(None);
        }
    }

    /// Grafts a box tree into a loaded layout. Nothing changes unless the
    /// whole tree builds. Returns the ids of the added boxes.
    pub(super) fn add_box(
        &mut self,
        layout_id: &str,
        parent: Option<&str>,
        config: &BoxConfig,
    ) -> Result<Vec<String>, ControlError> {
        let active = self.active_layout.id == layout_id;
        let layout = if active {
            &self.active_layout
        } else {
            self.standby
                .get(layout_id)
                .ok_or_else(|| ControlError::layout_not_found(layout_id))?
        };
        if let Some(parent) = parent {
            if !layout.contains(parent) {
                return Err(ControlError::box_not_found(parent));
            }
        }
        let grafted = self
            .config
            .graft_box(layout, config, parent)
            .map_err(|error| ControlError::invalid_command(error.to_string()))?;
        let added = grafted.subtree(&config.id);
        if !active {
            self.standby.insert(layout_id.to_owned(), grafted);
            return Ok(added);
        }
        self.active_layout = grafted;
        if self.focus_id.is_none() {
            self.focus_id = self.active_layout.next_focus(None);
        }
        self.apply_viewports();
        self.start_box_processes(&added);
        Ok(added)
    }

    /// Swaps an active-layout box and its subtree for a new tree in the same
    /// slot. The old processes stop only once the new tree has built.
    pub(super) fn replace_box(
        &mut self,
        box_id: &str,
        config: &BoxConfig,
    ) -> Result<Vec<String>, ControlError> {
        self.box_ref(box_id)?;
        let (replaced, removed) = self
            .config
            .replace_box(&self.active_layout, box_id, config)
            .map_err(|error| ControlError::invalid_command(error.to_string()))?;
        let added = replaced.subtree(&config.id);
        self.active_layout = replaced;
        self.retire_boxes(&removed);
        self.apply_viewports();
        self.start_box_processes(&added);
        Ok(added)
    }

    pub(super) fn stop_layout_processes(&mut self) {
        let pending = self
            .active_layout
            .boxes()
            .flat_map(|mux| {
                Self::stream_ids(mux)
                    .into_iter()
                    .map(|stream_id| (mux.id.clone(), stream_id))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for (box_id, stream_id) in pending {
            self.kill_stream(&box_id, &stream_id);
        }
    }

    /// Makes another loaded layout active. Processes of the outgoing layout
    /// are stopped; those of the incoming one are started.
    pub(super) fn switch_layout(&mut self, layout_id: &str) -> Result<(), ControlError> {
        if self.active_layout.id == layout_id {
            return Ok(());
        }
        let Some(incoming) = self.standby.shift_remove(layout_id) else {
            return Err(ControlError::layout_not_found(layout_id));
        };
        self.stop_layout_processes();
        let outgoing = std::mem::replace(&mut self.active_layout, incoming);
        log::info!("switched layout `{}` -> `{layout_id}`", outgoing.id);
        self.standby.insert(outgoing.id.clone(), outgoing);
        self.focus_id = self.active_layout.next_focus(None);
        self.apply_viewports();
        self.start_layout_processes();
        Ok(())
    }

    /// Replaces every layout from a fresh configuration snapshot. Failure
    /// counts are forgotten. The control socket stays where it was bound.
    pub(super) fn reload(
        &mut self,
        config: AppConfig,
        path: Option<PathBuf>,
    ) -> Result<(), ConfigError> {
        let Loaded {
            active,
            standby,
            hot_keys,
        } = load(&config)?;
        self.supervisor
            .terminate_all_graceful(self.config.kill_grace());
        self.supervisor.reset_failures();
        if config.socket_path != self.socket_path {
            log::warn!(
                "reloaded config names socket {}; keeping {}",
                config.socket_path.display(),
                self.socket_path.display()
            );
        }
        self.supervisor.set_kill_grace(config.kill_grace());
        let previous_focus = self.focus_id.take();
        self.active_layout = active;
        self.standby = standby;
        self.hot_keys = hot_keys;
        self.config = config;
        if path.is_some() {
            self.config_path = path;
        }
        self.focus_id = previous_focus
            .filter(|id| {
                self.active_layout
                    .get(id)
                    .is_some_and(|mux| mux.focusable)
            })
            .or_else(|| self.active_layout.next_focus(None));
        self.apply_viewports();
        self.start_layout_processes();
        log::info!(
            "reloaded configuration; active layout `{}`",
            self.active_layout.id
        );
        Ok(())
    }

    /// Runs a choice. A plain choice without a redirect runs in its own box's
    /// content stream; PTY or redirected choices get a closeable tab in the
    /// target box, created on first use and re-used afterwards.
    pub(super) fn run_choice(
        &mut self,
        box_id: &str,
        choice_id: &str,
    ) -> Result<String, ControlError> {
        let choice = self
            .box_ref(box_id)?
            .choice(choice_id)
            .cloned()
            .ok_or_else(|| {
                ControlError::invalid_command(format!(
                    "box `{box_id}` has no choice `{choice_id}`"
                ))
            })?;
        if choice.script.iter().all(|line| line.trim().is_empty()) {
            return Err(ControlError::invalid_command(format!(
                "choice `{choice_id}` has no script"
            )));
        }
        if !choice.pty && choice.redirect_output.is_none() {
            self.execute_ad_hoc(box_id, choice.script, CaptureMode::Replace)?;
            return Ok(box_id.to_owned());
        }

        let target_id = choice
            .redirect_output
            .clone()
            .unwrap_or_else(|| box_id.to_owned());
        let capacity = self.config.scroll_capacity;
        let origin = StreamOrigin::Choice {
            box_id: box_id.to_owned(),
            choice_id: choice_id.to_owned(),
        };
        let source = if choice.pty {
            StreamSource::Pty(PtySource::new(choice.script))
        } else {
            StreamSource::Script(ScriptSource::new(choice.script))
        };
        let stream_id = origin.stream_id();
        self.supervisor
            .kill(&StreamKey::new(target_id.as_str(), stream_id.as_str()));
        let target = self.box_mut(&target_id)?;
        let index = match target.find_stream_by_origin(&origin) {
            Some(index) => {
                target.streams_mut()[index].set_source(source);
                index
            }
            None => target.add_stream(Stream::new(origin, choice.label, source, capacity)),
        };
        target
            .activate_stream(index)
            .map_err(|error| ControlError::invalid_command(error.to_string()))?;
        self.apply_viewports();
        self.launch_stream(&target_id, &stream_id, LaunchTrigger::Explicit);
        Ok(target_id)
    }

    /// Runs an ad-hoc command in a box's content stream. PTY boxes are
    /// refused: their buffer belongs to the terminal session.
    pub(super) fn execute_ad_hoc(
        &mut self,
        box_id: &str,
        script: Vec<String>,
        capture: CaptureMode,
    ) -> Result<(), ControlError> {
        if script.iter().all(|line| line.trim().is_empty()) {
            return Err(ControlError::invalid_command("script is empty"));
        }
        let mux = self.box_ref(box_id)?;
        if mux.content_stream().source.is_pty() {
            return Err(ControlError::invalid_command(format!(
                "box `{box_id}` hosts a PTY session"
            )));
        }
        self.launch_command(
            box_id,
            CONTENT_STREAM_ID,
            script,
            LaunchKind::Script(capture),
            LaunchTrigger::Explicit,
        );
        Ok(())
    }

    /// Terminates every supervised process; the socket is owned elsewhere.
    pub fn shutdown(&mut self) -> ShutdownProgress {
        log::info!("shutting down runtime");
        self.supervisor
            .terminate_all_graceful_with_progress(self.config.shutdown_grace(), |progress| {
                log::debug!("shutdown progress: {progress:?}");
            })
    }
}
