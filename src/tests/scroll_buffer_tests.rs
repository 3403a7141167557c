use super::{split_lines, ScrollBuffer, SharedScrollBuffer};

fn numbered(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("line-{i}")).collect()
}

#[test]
fn eviction_keeps_exactly_the_most_recent_lines() {
    let mut buffer = ScrollBuffer::new(5);
    for chunk in numbered(0..23).chunks(4) {
        buffer.push_lines(chunk.to_vec());
        assert!(buffer.len() <= 5);
    }
    assert_eq!(buffer.len(), 5);
    assert_eq!(
        buffer.lines().collect::<Vec<&str>>(),
        vec!["line-18", "line-19", "line-20", "line-21", "line-22"]
    );
    assert_eq!(buffer.total_appended(), 23);
}

#[test]
fn append_splits_text_into_lines() {
    let mut buffer = ScrollBuffer::new(10);
    buffer.append("alpha\nbeta\r\n\ngamma\n");
    assert_eq!(
        buffer.lines().collect::<Vec<&str>>(),
        vec!["alpha", "beta", "", "gamma"]
    );
    buffer.append("");
    assert_eq!(buffer.len(), 4);
}

#[test]
fn viewport_clamps_instead_of_overrunning() {
    let mut buffer = ScrollBuffer::new(100);
    buffer.push_lines(numbered(0..3));
    assert_eq!(buffer.viewport(10), numbered(0..3));
    assert_eq!(buffer.cursor(), 0);
    assert!(buffer.viewport(0).is_empty());
}

#[test]
fn scroll_to_maps_fraction_onto_cursor_range() {
    let mut buffer = ScrollBuffer::new(100);
    buffer.push_lines(numbered(0..30));
    buffer.set_viewport_height(10);

    buffer.scroll_to(0.0);
    assert_eq!(buffer.cursor(), 0);
    assert!(!buffer.is_following());

    buffer.scroll_to(0.5);
    assert_eq!(buffer.cursor(), 10);

    buffer.scroll_to(1.0);
    assert_eq!(buffer.cursor(), 20);
    assert!(buffer.is_following());

    buffer.scroll_to(7.5);
    assert_eq!(buffer.cursor(), 20);
    buffer.scroll_to(f64::NAN);
    assert_eq!(buffer.cursor(), 0);
}

#[test]
fn scroll_by_is_clamped_at_both_ends() {
    let mut buffer = ScrollBuffer::new(100);
    buffer.push_lines(numbered(0..12));
    buffer.set_viewport_height(5);
    buffer.scroll_to(0.0);

    buffer.scroll_by(-3);
    assert_eq!(buffer.cursor(), 0);
    buffer.scroll_by(4);
    assert_eq!(buffer.cursor(), 4);
    buffer.scroll_by(100);
    assert_eq!(buffer.cursor(), 7);
    assert!(buffer.is_following());
}

#[test]
fn following_buffer_tracks_new_output() {
    let mut buffer = ScrollBuffer::new(100);
    buffer.set_viewport_height(2);
    buffer.push_lines(numbered(0..4));
    assert_eq!(buffer.cursor(), 2);
    buffer.push_lines(numbered(4..6));
    assert_eq!(buffer.cursor(), 4);

    buffer.scroll_by(-1);
    buffer.push_lines(numbered(6..8));
    assert_eq!(buffer.cursor(), 3);
}

#[test]
fn eviction_shifts_a_pinned_cursor_with_its_content() {
    let mut buffer = ScrollBuffer::new(10);
    buffer.set_viewport_height(3);
    buffer.push_lines(numbered(0..10));
    buffer.scroll_to(0.0);
    buffer.scroll_by(5);
    assert_eq!(buffer.viewport(3)[0], "line-5");

    buffer.push_lines(numbered(10..13));
    assert_eq!(buffer.cursor(), 2);
    assert_eq!(buffer.viewport(3)[0], "line-5");

    buffer.push_lines(numbered(13..30));
    assert!(buffer.cursor() <= buffer.max_cursor());
}

#[test]
fn cursor_invariant_holds_across_mixed_operations() {
    let mut buffer = ScrollBuffer::new(16);
    let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
    for step in 0..2_000 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        match seed % 5 {
            0 => buffer.push_lines(numbered(step..step + (seed % 7) as usize)),
            1 => buffer.scroll_by((seed % 11) as isize - 5),
            2 => buffer.scroll_to((seed % 100) as f64 / 100.0),
            3 => buffer.set_viewport_height((seed % 9) as usize),
            _ => {
                let _ = buffer.viewport((seed % 20) as usize);
            }
        }
        assert!(buffer.len() <= 16);
        assert!(
            buffer.cursor() <= buffer.len().saturating_sub(buffer.viewport_height()),
            "cursor {} out of range at step {step}",
            buffer.cursor()
        );
    }
}

#[test]
fn replace_resets_content_and_cursor() {
    let mut buffer = ScrollBuffer::new(10);
    buffer.push_lines(numbered(0..8));
    buffer.set_viewport_height(2);
    buffer.scroll_to(0.0);
    buffer.replace("Hello");
    assert_eq!(buffer.content(), "Hello");
    assert_eq!(buffer.cursor(), 0);
    assert!(buffer.is_following());
}

#[test]
fn revoked_writer_cannot_append() {
    let shared = SharedScrollBuffer::new(10);
    let old = shared.attach_writer();
    assert!(old.push_lines(vec!["old-1".to_owned()]));

    let new = shared.attach_writer();
    assert!(!old.is_current());
    assert!(!old.push_lines(vec!["old-2".to_owned()]));
    assert!(new.push_lines(vec!["new-1".to_owned()]));

    shared.detach_writers();
    assert!(!new.replace_lines(vec!["late".to_owned()]));
    assert_eq!(shared.content(), "old-1\nnew-1");
}

#[test]
fn split_lines_handles_trailing_newline_once() {
    assert!(split_lines("").is_empty());
    assert_eq!(split_lines("\n"), vec![String::new()]);
    assert_eq!(split_lines("a\n\n"), vec!["a".to_owned(), String::new()]);
}
