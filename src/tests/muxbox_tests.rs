use super::*;
use crate::keys::KeyChord;
use crate::stream::{ProcessState, PtySource, ScriptSource, CONTENT_STREAM_ID};

fn static_box(id: &str) -> MuxBox {
    MuxBox::new(
        id,
        StreamSource::Static {
            content: "hello".to_owned(),
        },
        100,
    )
}

fn choice_stream(choice_id: &str) -> Stream {
    Stream::new(
        StreamOrigin::Choice {
            box_id: "menu".to_owned(),
            choice_id: choice_id.to_owned(),
        },
        choice_id,
        StreamSource::Script(ScriptSource::new(vec!["true".to_owned()])),
        100,
    )
}

#[test]
fn position_rejects_inverted_or_out_of_range_edges() {
    assert!(Position::new(0.0, 0.0, 50.0, 100.0).is_ok());
    assert!(Position::new(50.0, 0.0, 50.0, 100.0).is_err());
    assert!(Position::new(0.0, 10.0, 100.0, 5.0).is_err());
    assert!(Position::new(-1.0, 0.0, 100.0, 100.0).is_err());
    assert!(Position::new(0.0, 0.0, 100.5, 100.0).is_err());
}

#[test]
fn position_resolves_against_parent_rect() {
    let parent = Rect::new(10, 4, 80, 20);
    let rect = Position::new(50.0, 0.0, 100.0, 50.0)
        .expect("valid position")
        .resolve(parent);
    assert_eq!(rect, Rect::new(50, 4, 40, 10));
    assert_eq!(rect.inner(), Rect::new(51, 5, 38, 8));
}

#[test]
fn new_box_has_one_uncloseable_content_stream() {
    let mux = static_box("status");
    assert_eq!(mux.streams().len(), 1);
    assert_eq!(mux.active_stream_index(), 0);
    assert_eq!(mux.active_stream().id, CONTENT_STREAM_ID);
    assert_eq!(
        mux.clone().close_stream(0).map(|_| ()),
        Err(StreamError::NotCloseable { index: 0 })
    );
}

#[test]
fn activate_stream_rejects_out_of_range_index() {
    let mut mux = static_box("status");
    mux.add_stream(choice_stream("build"));
    assert!(mux.activate_stream(1).is_ok());
    assert_eq!(
        mux.activate_stream(2),
        Err(StreamError::InvalidIndex { index: 2, len: 2 })
    );
    assert_eq!(mux.active_stream_index(), 1);
}

#[test]
fn closing_active_stream_leaves_exactly_one_active() {
    let mut mux = static_box("status");
    mux.add_stream(choice_stream("build"));
    mux.add_stream(choice_stream("test"));

    mux.activate_stream(2).expect("activate last");
    let removed = mux.close_stream(2).expect("close last");
    assert_eq!(removed.id, "choice:menu:test");
    assert_eq!(mux.active_stream_index(), 1);

    mux.add_stream(choice_stream("lint"));
    mux.activate_stream(1).expect("activate middle");
    mux.close_stream(1).expect("close middle");
    assert_eq!(mux.active_stream().id, "choice:menu:lint");

    mux.close_stream(1).expect("close remaining tab");
    assert_eq!(mux.streams().len(), 1);
    assert_eq!(mux.active_stream().id, CONTENT_STREAM_ID);
}

#[test]
fn closing_stream_before_active_keeps_same_tab_active() {
    let mut mux = static_box("status");
    mux.add_stream(choice_stream("build"));
    mux.add_stream(choice_stream("test"));
    mux.activate_stream(2).expect("activate");
    mux.close_stream(1).expect("close");
    assert_eq!(mux.active_stream().id, "choice:menu:test");
}

#[test]
fn find_stream_by_origin_matches_choice_identity() {
    let mut mux = static_box("output");
    let index = mux.add_stream(choice_stream("deploy"));
    let origin = StreamOrigin::Choice {
        box_id: "menu".to_owned(),
        choice_id: "deploy".to_owned(),
    };
    assert_eq!(mux.find_stream_by_origin(&origin), Some(index));
    assert_eq!(mux.find_stream_by_origin(&StreamOrigin::Content), Some(0));
}

#[test]
fn non_interactive_box_routes_keys_to_navigation() {
    let mux = static_box("status");
    assert_eq!(
        mux.route_input(KeyChord::plain(KeyCode::Down)),
        InputRoute::Navigate(Navigation::ScrollBy(1))
    );
    assert_eq!(
        mux.route_input(KeyChord::new(KeyCode::End, KeyModifiers::CONTROL)),
        InputRoute::Navigate(Navigation::ScrollTo(1.0))
    );
    assert_eq!(
        mux.route_input(KeyChord::plain(KeyCode::Right)),
        InputRoute::Navigate(Navigation::NextStream)
    );
    assert_eq!(
        mux.route_input(KeyChord::plain(KeyCode::Char('x'))),
        InputRoute::Ignored
    );
}

#[test]
fn running_pty_receives_raw_key_bytes() {
    let mut pty = PtySource::new(vec!["bash".to_owned()]);
    pty.state = ProcessState::Running;
    let mux = MuxBox::new("shell", StreamSource::Pty(pty), 100);

    assert_eq!(
        mux.route_input(KeyChord::ctrl('c')),
        InputRoute::Pty {
            key: StreamKey::new("shell", CONTENT_STREAM_ID),
            bytes: vec![0x03],
        }
    );
    assert_eq!(
        mux.route_input(KeyChord::plain(KeyCode::Up)),
        InputRoute::Pty {
            key: StreamKey::new("shell", CONTENT_STREAM_ID),
            bytes: b"\x1b[A".to_vec(),
        }
    );
}

#[test]
fn fallback_pty_is_not_interactive() {
    let mut pty = PtySource::new(vec!["bash".to_owned()]);
    pty.state = ProcessState::Running;
    pty.fallback = true;
    let mux = MuxBox::new("shell", StreamSource::Pty(pty), 100);
    assert_eq!(
        mux.route_input(KeyChord::plain(KeyCode::PageDown)),
        InputRoute::Navigate(Navigation::PageDown)
    );
}
