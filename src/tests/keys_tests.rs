use super::{default_hot_keys, HotKeyAction, KeyChord, KeyParseError};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[test]
fn parses_named_keys_and_modifiers() {
    assert_eq!(KeyChord::parse("ctrl+c").unwrap(), KeyChord::ctrl('c'));
    assert_eq!(KeyChord::parse("Ctrl+C").unwrap(), KeyChord::ctrl('c'));
    assert_eq!(
        KeyChord::parse("Tab").unwrap(),
        KeyChord::plain(KeyCode::Tab)
    );
    assert_eq!(
        KeyChord::parse("shift+tab").unwrap(),
        KeyChord::plain(KeyCode::BackTab)
    );
    assert_eq!(
        KeyChord::parse("ctrl+End").unwrap(),
        KeyChord::new(KeyCode::End, KeyModifiers::CONTROL)
    );
    assert_eq!(
        KeyChord::parse("PgDn").unwrap(),
        KeyChord::plain(KeyCode::PageDown)
    );
    assert_eq!(KeyChord::parse("f5").unwrap(), KeyChord::plain(KeyCode::F(5)));
    assert_eq!(
        KeyChord::parse("space").unwrap(),
        KeyChord::plain(KeyCode::Char(' '))
    );
    assert_eq!(
        KeyChord::parse("ctrl++").unwrap(),
        KeyChord::ctrl('+')
    );
}

#[test]
fn rejects_unknown_parts() {
    assert_eq!(KeyChord::parse("  "), Err(KeyParseError::Empty));
    assert_eq!(
        KeyChord::parse("hyper+x"),
        Err(KeyParseError::UnknownModifier("hyper".to_owned()))
    );
    assert_eq!(
        KeyChord::parse("ctrl+banana"),
        Err(KeyParseError::UnknownKey("banana".to_owned()))
    );
}

#[test]
fn key_events_normalize_to_the_same_chord_as_config() {
    let event = KeyEvent::new(KeyCode::Char('Q'), KeyModifiers::CONTROL | KeyModifiers::SHIFT);
    assert_eq!(KeyChord::from(event), KeyChord::parse("ctrl+q").unwrap());
    let event = KeyEvent::new(KeyCode::Char('A'), KeyModifiers::SHIFT);
    assert_eq!(KeyChord::from(event), KeyChord::parse("A").unwrap());
}

#[test]
fn terminal_bytes_for_control_and_navigation_keys() {
    assert_eq!(KeyChord::ctrl('c').to_terminal_bytes(), Some(vec![3]));
    assert_eq!(
        KeyChord::plain(KeyCode::Left).to_terminal_bytes(),
        Some(b"\x1b[D".to_vec())
    );
    assert_eq!(
        KeyChord::plain(KeyCode::Enter).to_terminal_bytes(),
        Some(b"\r".to_vec())
    );
    assert_eq!(
        KeyChord::new(KeyCode::Char('x'), KeyModifiers::ALT).to_terminal_bytes(),
        Some(b"\x1bx".to_vec())
    );
    assert_eq!(
        KeyChord::plain(KeyCode::Char('é')).to_terminal_bytes(),
        Some("é".as_bytes().to_vec())
    );
    assert_eq!(KeyChord::plain(KeyCode::F(20)).to_terminal_bytes(), None);
}

#[test]
fn ctrl_with_non_ascii_char_sends_nothing() {
    assert_eq!(KeyChord::ctrl('š').to_terminal_bytes(), None);
    assert_eq!(KeyChord::ctrl('Ё').to_terminal_bytes(), None);
    // U+0141 truncates to 0x41 ('A') as a byte.
    assert_eq!(KeyChord::ctrl('Ł').to_terminal_bytes(), None);
    assert_eq!(KeyChord::ctrl('a').to_terminal_bytes(), Some(vec![1]));
}

#[test]
fn display_round_trips_through_parse() {
    for raw in ["ctrl+q", "alt+x", "pagedown", "backtab", "f3", "space", "enter"] {
        let chord = KeyChord::parse(raw).unwrap();
        assert_eq!(KeyChord::parse(&chord.to_string()).unwrap(), chord, "{raw}");
    }
}

#[test]
fn hot_key_actions_parse_with_arguments() {
    assert_eq!(HotKeyAction::parse("quit"), Some(HotKeyAction::Quit));
    assert_eq!(
        HotKeyAction::parse("refresh:clock"),
        Some(HotKeyAction::Refresh("clock".to_owned()))
    );
    assert_eq!(
        HotKeyAction::parse("layout:ops"),
        Some(HotKeyAction::SwitchLayout("ops".to_owned()))
    );
    assert_eq!(
        HotKeyAction::parse("choice:menu:deploy"),
        Some(HotKeyAction::RunChoice {
            box_id: "menu".to_owned(),
            choice_id: "deploy".to_owned(),
        })
    );
    assert_eq!(HotKeyAction::parse("refresh:"), None);
    assert_eq!(HotKeyAction::parse("choice:menu"), None);
    assert_eq!(HotKeyAction::parse("explode"), None);
}

#[test]
fn default_table_binds_ctrl_q_to_quit() {
    assert_eq!(
        default_hot_keys(),
        vec![(KeyChord::ctrl('q'), HotKeyAction::Quit)]
    );
}
