use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;

use crate::control::MAX_REQUEST_BYTES;
use crate::keys::{HotKeyAction, KeyChord, KeyParseError};
use crate::layout::{Layout, LayoutError};
use crate::muxbox::{BoxStyle, Choice, MuxBox, Position, PositionError};
use crate::scroll_buffer::DEFAULT_SCROLL_CAPACITY;
use crate::terminal_text::MAX_LINE_BYTES;
use crate::stream::{PtySource, ScriptSource, StreamSource};
use crate::style::parse_color;
use crate::variables::{VariableMap, VariableScope};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/boxmux.sock";
pub const SOCKET_ENV: &str = "BOXMUX_SOCKET";

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        error: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        error: toml::de::Error,
    },
    NoLayouts,
    DuplicateLayout(String),
    Layout {
        layout: String,
        error: LayoutError,
    },
    InvalidPosition {
        box_id: String,
        error: PositionError,
    },
    InvalidColor {
        box_id: String,
        field: &'static str,
        value: String,
    },
    UnknownRedirect {
        box_id: String,
        choice: String,
        target: String,
    },
    InvalidHotKey {
        chord: String,
        error: KeyParseError,
    },
    InvalidHotKeyAction {
        chord: String,
        action: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, error } => {
                write!(f, "failed reading {}: {error}", path.display())
            }
            ConfigError::Parse {
                path: Some(path),
                error,
            } => write!(f, "failed parsing {}: {error}", path.display()),
            ConfigError::Parse { path: None, error } => write!(f, "failed parsing config: {error}"),
            ConfigError::NoLayouts => write!(f, "configuration defines no layouts"),
            ConfigError::DuplicateLayout(id) => write!(f, "duplicate layout id `{id}`"),
            ConfigError::Layout { layout, error } => write!(f, "layout `{layout}`: {error}"),
            ConfigError::InvalidPosition { box_id, error } => write!(f, "box `{box_id}`: {error}"),
            ConfigError::InvalidColor {
                box_id,
                field,
                value,
            } => write!(f, "box `{box_id}`: invalid {field} `{value}`"),
            ConfigError::UnknownRedirect {
                box_id,
                choice,
                target,
            } => write!(
                f,
                "box `{box_id}` choice `{choice}` redirects to unknown box `{target}`"
            ),
            ConfigError::InvalidHotKey { chord, error } => {
                write!(f, "invalid hot key `{chord}`: {error}")
            }
            ConfigError::InvalidHotKeyAction { chord, action } => {
                write!(f, "hot key `{chord}` has unknown action `{action}`")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A script given either as one string or as a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ScriptLines {
    Single(String),
    Lines(Vec<String>),
}

impl Default for ScriptLines {
    fn default() -> Self {
        ScriptLines::Lines(Vec::new())
    }
}

impl ScriptLines {
    pub fn lines(&self) -> Vec<String> {
        match self {
            ScriptLines::Single(line) => vec![line.clone()],
            ScriptLines::Lines(lines) => lines.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ScriptLines::Single(line) => line.trim().is_empty(),
            ScriptLines::Lines(lines) => lines.iter().all(|line| line.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_socket_idle_timeout_ms")]
    pub socket_idle_timeout_ms: u64,
    #[serde(default = "default_scroll_capacity")]
    pub scroll_capacity: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_pty_retry_ms")]
    pub pty_retry_ms: u64,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub hot_keys: IndexMap<String, String>,
    #[serde(default)]
    pub layouts: Vec<LayoutConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub boxes: Vec<BoxConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionConfig {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// One box of a layout tree. Also the payload of the `AddBox` and
/// `ReplaceBox` control commands.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoxConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub position: Option<PositionConfig>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub script: ScriptLines,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default = "default_true")]
    pub focusable: bool,
    #[serde(default)]
    pub tab_order: Option<i32>,
    #[serde(default)]
    pub choices: Vec<ChoiceConfig>,
    #[serde(default)]
    pub bg_color: Option<String>,
    #[serde(default)]
    pub fg_color: Option<String>,
    #[serde(default)]
    pub title_bg_color: Option<String>,
    #[serde(default)]
    pub title_fg_color: Option<String>,
    #[serde(default)]
    pub border_color: Option<String>,
    #[serde(default)]
    pub selected_border_color: Option<String>,
    #[serde(default)]
    pub children: Vec<BoxConfig>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChoiceConfig {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub script: ScriptLines,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub redirect_output: Option<String>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_socket_idle_timeout_ms() -> u64 {
    5000
}

fn default_scroll_capacity() -> usize {
    DEFAULT_SCROLL_CAPACITY
}

fn default_tick_ms() -> u64 {
    100
}

fn default_kill_grace_ms() -> u64 {
    300
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_pty_retry_ms() -> u64 {
    1000
}

fn default_shell() -> String {
    "sh".to_owned()
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

fn default_max_request_bytes() -> usize {
    MAX_REQUEST_BYTES
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_idle_timeout_ms: default_socket_idle_timeout_ms(),
            scroll_capacity: default_scroll_capacity(),
            tick_ms: default_tick_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            pty_retry_ms: default_pty_retry_ms(),
            shell: default_shell(),
            max_line_bytes: default_max_line_bytes(),
            max_request_bytes: default_max_request_bytes(),
            variables: VariableMap::new(),
            hot_keys: IndexMap::new(),
            layouts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Reads, parses and validates a config file, then applies environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        let mut config: AppConfig =
            toml::from_str(&source).map_err(|error| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                error,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(source).map_err(|error| ConfigError::Parse { path: None, error })?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(socket) = std::env::var_os(SOCKET_ENV).filter(|value| !value.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn socket_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_idle_timeout_ms.max(1))
    }

    pub fn pty_retry_delay(&self) -> Duration {
        Duration::from_millis(self.pty_retry_ms)
    }

    /// Checks everything a layout build would reject, without building.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_layouts().map(|_| ())?;
        self.hot_key_bindings().map(|_| ())
    }

    /// Parsed hot-key table, in declaration order.
    pub fn hot_key_bindings(&self) -> Result<Vec<(KeyChord, HotKeyAction)>, ConfigError> {
        self.hot_keys
            .iter()
            .map(|(chord, action)| {
                let parsed = KeyChord::parse(chord).map_err(|error| ConfigError::InvalidHotKey {
                    chord: chord.clone(),
                    error,
                })?;
                let action = HotKeyAction::parse(action).ok_or_else(|| {
                    ConfigError::InvalidHotKeyAction {
                        chord: chord.clone(),
                        action: action.clone(),
                    }
                })?;
                Ok((parsed, action))
            })
            .collect()
    }

    /// Id of the layout marked `root`, else the first one.
    pub fn active_layout_id(&self) -> Option<&str> {
        self.layouts
            .iter()
            .find(|layout| layout.root)
            .or_else(|| self.layouts.first())
            .map(|layout| layout.id.as_str())
    }

    /// Builds every layout with `${NAME}` references resolved against the box
    /// hierarchy, the global variables and the environment as they are now.
    pub fn build_layouts(&self) -> Result<IndexMap<String, Layout>, ConfigError> {
        if self.layouts.is_empty() {
            return Err(ConfigError::NoLayouts);
        }
        let mut layouts = IndexMap::new();
        for layout_config in &self.layouts {
            if layouts.contains_key(&layout_config.id) {
                return Err(ConfigError::DuplicateLayout(layout_config.id.clone()));
            }
            let layout = self.build_layout(layout_config)?;
            layouts.insert(layout_config.id.clone(), layout);
        }
        Ok(layouts)
    }

    fn build_layout(&self, config: &LayoutConfig) -> Result<Layout, ConfigError> {
        let mut layout = Layout::new(config.id.clone());
        layout.title = config.title.clone();
        for box_config in &config.boxes {
            self.insert_box(&mut layout, box_config, None, &[])?;
        }
        check_redirects(&layout)?;
        Ok(layout)
    }

    /// Builds `config` and its children under `parent` into a copy of a live
    /// layout. The copy comes back only when the whole subtree is valid.
    pub fn graft_box(
        &self,
        layout: &Layout,
        config: &BoxConfig,
        parent: Option<&str>,
    ) -> Result<Layout, ConfigError> {
        let mut grafted = layout.clone();
        let ancestors = ancestor_variables(layout, parent);
        self.insert_box(&mut grafted, config, parent, &ancestors)?;
        check_redirects(&grafted)?;
        Ok(grafted)
    }

    /// Swaps the subtree rooted at `box_id` for one built from `config`, in
    /// the same tree slot, on a copy of `layout`. Returns the copy and the
    /// boxes it dropped.
    pub fn replace_box(
        &self,
        layout: &Layout,
        box_id: &str,
        config: &BoxConfig,
    ) -> Result<(Layout, Vec<MuxBox>), ConfigError> {
        let Some(parent) = layout.get(box_id).map(|mux| mux.parent.clone()) else {
            return Err(ConfigError::Layout {
                layout: layout.id.clone(),
                error: LayoutError::UnknownBox(box_id.to_owned()),
            });
        };
        let slot = layout.sibling_index(box_id);
        let declared_at = layout.declaration_index(box_id);
        let mut replaced = layout.clone();
        let removed = replaced.remove(box_id);
        let ancestors = ancestor_variables(layout, parent.as_deref());
        self.insert_box(&mut replaced, config, parent.as_deref(), &ancestors)?;
        if let Some(slot) = slot {
            replaced.move_sibling(&config.id, slot);
        }
        if let Some(declared_at) = declared_at {
            replaced.move_declaration(&config.id, declared_at);
        }
        check_redirects(&replaced)?;
        Ok((replaced, removed))
    }

    fn insert_box(
        &self,
        layout: &mut Layout,
        config: &BoxConfig,
        parent: Option<&str>,
        ancestors: &[&VariableMap],
    ) -> Result<(), ConfigError> {
        let mut scope = VariableScope::new().with_layer(&config.variables);
        for variables in ancestors.iter().rev() {
            scope = scope.with_layer(variables);
        }
        let scope = scope.with_app(&self.variables);

        let position = match config.position {
            Some(PositionConfig { x1, y1, x2, y2 }) => {
                Position::new(x1, y1, x2, y2).map_err(|error| ConfigError::InvalidPosition {
                    box_id: config.id.clone(),
                    error,
                })?
            }
            None => Position::FULL,
        };

        let mut mux = MuxBox::new(
            config.id.clone(),
            source_for(config, &scope),
            self.scroll_capacity,
        );
        mux.title = config.title.as_deref().map(|title| scope.substitute(title));
        mux.position = position;
        mux.variables = config.variables.clone();
        mux.focusable = config.focusable;
        mux.tab_order = config.tab_order;
        mux.style = style_for(config)?;
        mux.choices = config
            .choices
            .iter()
            .map(|choice| Choice {
                id: choice.id.clone(),
                label: choice
                    .label
                    .as_deref()
                    .map(|label| scope.substitute(label))
                    .unwrap_or_else(|| choice.id.clone()),
                script: scope.substitute_all(&choice.script.lines()),
                pty: choice.pty,
                redirect_output: choice.redirect_output.clone(),
            })
            .collect();
        layout
            .insert(mux, parent)
            .map_err(|error| ConfigError::Layout {
                layout: layout.id.clone(),
                error,
            })?;

        let mut chain = ancestors.to_vec();
        chain.push(&config.variables);
        for child in &config.children {
            self.insert_box(layout, child, Some(&config.id), &chain)?;
        }
        Ok(())
    }
}

/// Variable maps of `parent` and its ancestors, outermost first.
fn ancestor_variables<'a>(layout: &'a Layout, parent: Option<&str>) -> Vec<&'a VariableMap> {
    let Some(parent) = parent.and_then(|id| layout.get(id)) else {
        return Vec::new();
    };
    let mut chain = layout
        .ancestors(&parent.id)
        .into_iter()
        .rev()
        .map(|mux| &mux.variables)
        .collect::<Vec<_>>();
    chain.push(&parent.variables);
    chain
}

fn check_redirects(layout: &Layout) -> Result<(), ConfigError> {
    for mux in layout.boxes() {
        for choice in &mux.choices {
            if let Some(target) = choice.redirect_output.as_ref() {
                if !layout.contains(target) {
                    return Err(ConfigError::UnknownRedirect {
                        box_id: mux.id.clone(),
                        choice: choice.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn source_for(config: &BoxConfig, scope: &VariableScope<'_>) -> StreamSource {
    if config.script.is_empty() {
        return StreamSource::Static {
            content: config
                .content
                .as_deref()
                .map(|content| scope.substitute(content))
                .unwrap_or_default(),
        };
    }
    let command = scope.substitute_all(&config.script.lines());
    if config.pty {
        return StreamSource::Pty(PtySource::new(command));
    }
    let mut script = ScriptSource::new(command);
    script.refresh_interval = config.refresh_interval_ms.map(Duration::from_millis);
    script.streaming = config.streaming;
    StreamSource::Script(script)
}

fn style_for(config: &BoxConfig) -> Result<BoxStyle, ConfigError> {
    let color = |field: &'static str, value: &Option<String>| match value {
        Some(raw) => parse_color(raw)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidColor {
                box_id: config.id.clone(),
                field,
                value: raw.clone(),
            }),
        None => Ok(None),
    };
    Ok(BoxStyle {
        bg_color: color("bg_color", &config.bg_color)?,
        fg_color: color("fg_color", &config.fg_color)?,
        title_bg_color: color("title_bg_color", &config.title_bg_color)?,
        title_fg_color: color("title_fg_color", &config.title_fg_color)?,
        border_color: color("border_color", &config.border_color)?,
        selected_border_color: color("selected_border_color", &config.selected_border_color)?,
    })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
