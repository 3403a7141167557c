use crossterm::event::KeyCode;

use crate::keys::{HotKeyAction, KeyChord};
use crate::muxbox::{InputRoute, MuxBox, Navigation};

use super::{LoopControl, RuntimeState};

impl RuntimeState {
    /// Routes one logical key. Hot keys win; an interactive PTY in the
    /// focused box gets every other key; otherwise Tab moves focus and the
    /// rest scrolls or switches tabs in the focused box.
    pub fn handle_key(&mut self, chord: KeyChord) -> LoopControl {
        if let Some(action) = self
            .hot_keys
            .iter()
            .find(|(bound, _)| *bound == chord)
            .map(|(_, action)| action.clone())
        {
            log::debug!("hot key {chord} -> {action:?}");
            return self.run_hot_key(action);
        }

        let focused = self
            .focus_id
            .as_deref()
            .and_then(|id| self.active_layout.get(id));
        let interactive = focused.is_some_and(|mux| mux.active_stream().is_interactive());
        if !interactive {
            if chord.is_plain(KeyCode::Tab) {
                self.focus_id = self.active_layout.next_focus(self.focus_id.as_deref());
                return LoopControl::Continue;
            }
            if chord.code == KeyCode::BackTab {
                self.focus_id = self.active_layout.previous_focus(self.focus_id.as_deref());
                return LoopControl::Continue;
            }
        }

        let Some(mux) = focused else {
            return LoopControl::Continue;
        };
        let box_id = mux.id.clone();
        match mux.route_input(chord) {
            InputRoute::Pty { key, bytes } => {
                if let Err(error) = self.supervisor.send_input(&key, &bytes) {
                    log::warn!("{error}");
                }
            }
            InputRoute::Navigate(navigation) => self.navigate(&box_id, navigation),
            InputRoute::Ignored => {}
        }
        LoopControl::Continue
    }

    fn navigate(&mut self, box_id: &str, navigation: Navigation) {
        let Some(mux) = self.active_layout.get_mut(box_id) else {
            return;
        };
        match navigation {
            Navigation::NextStream => mux.cycle_stream(true),
            Navigation::PreviousStream => mux.cycle_stream(false),
            Navigation::ScrollBy(delta) => {
                mux.active_stream()
                    .buffer()
                    .update(|buffer| buffer.scroll_by(delta));
            }
            Navigation::PageUp | Navigation::PageDown => {
                mux.active_stream().buffer().update(|buffer| {
                    let page = isize::try_from(buffer.viewport_height()).unwrap_or(isize::MAX);
                    let delta = if navigation == Navigation::PageUp {
                        -page
                    } else {
                        page
                    };
                    buffer.scroll_by(delta);
                });
            }
            Navigation::ScrollTo(fraction) => {
                mux.active_stream()
                    .buffer()
                    .update(|buffer| buffer.scroll_to(fraction));
            }
        }
    }

    fn run_hot_key(&mut self, action: HotKeyAction) -> LoopControl {
        match action {
            HotKeyAction::Quit => return LoopControl::Quit,
            HotKeyAction::FocusNext => {
                self.focus_id = self.active_layout.next_focus(self.focus_id.as_deref());
            }
            HotKeyAction::FocusPrevious => {
                self.focus_id = self.active_layout.previous_focus(self.focus_id.as_deref());
            }
            HotKeyAction::NextStream => {
                if let Some(mux) = self.focused_mut() {
                    mux.cycle_stream(true);
                }
            }
            HotKeyAction::PreviousStream => {
                if let Some(mux) = self.focused_mut() {
                    mux.cycle_stream(false);
                }
            }
            HotKeyAction::CloseStream => {
                let closed = self.focused_mut().and_then(|mux| {
                    let index = mux.active_stream_index();
                    mux.close_stream(index)
                        .ok()
                        .map(|stream| stream.key(&mux.id))
                });
                if let Some(key) = closed {
                    self.supervisor.kill(&key);
                }
            }
            HotKeyAction::Refresh(box_id) => {
                if let Err(error) = self.refresh_box(&box_id) {
                    log::warn!("refresh hot key: {error}");
                }
            }
            HotKeyAction::SwitchLayout(layout_id) => {
                if let Err(error) = self.switch_layout(&layout_id) {
                    log::warn!("layout hot key: {error}");
                }
            }
            HotKeyAction::RunChoice { box_id, choice_id } => {
                if let Err(error) = self.run_choice(&box_id, &choice_id) {
                    log::warn!("choice hot key: {error}");
                }
            }
        }
        LoopControl::Continue
    }

    fn focused_mut(&mut self) -> Option<&mut MuxBox> {
        let focus = self.focus_id.as_deref()?;
        self.active_layout.get_mut(focus)
    }
}
