//! Input handling for the TUI.

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use super::app::Action;

/// Convert a crossterm key event to an Action.
///
/// While `editing`, printable keys are text rather than shortcuts.
pub fn handle_key_event(key: KeyEvent, editing: bool) -> Option<Action> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Esc => Some(Action::Back),
        KeyCode::Enter => Some(Action::Confirm),
        KeyCode::Up => Some(Action::Up),
        KeyCode::Down => Some(Action::Down),
        KeyCode::Tab => Some(Action::NextField),
        KeyCode::BackTab => Some(Action::PrevField),
        KeyCode::Backspace if editing => Some(Action::Backspace),
        KeyCode::Char(c) if editing => Some(Action::Char(c)),
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('c') => Some(Action::Cancel),
        KeyCode::Char('k') => Some(Action::Up),
        KeyCode::Char('j') => Some(Action::Down),
        KeyCode::Char(' ') => Some(Action::Confirm),
        _ => None,
    }
}

/// Convert a crossterm Event to an Action.
pub fn handle_event(event: Event, editing: bool) -> Option<Action> {
    match event {
        Event::Key(key) => handle_key_event(key, editing),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn q_quits_only_outside_text_entry() {
        assert_eq!(handle_key_event(key(KeyCode::Char('q')), false), Some(Action::Quit));
        assert_eq!(
            handle_key_event(key(KeyCode::Char('q')), true),
            Some(Action::Char('q'))
        );
    }

    #[test]
    fn ctrl_c_always_quits() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(handle_key_event(ctrl_c, true), Some(Action::Quit));
        assert_eq!(handle_key_event(ctrl_c, false), Some(Action::Quit));
    }

    #[test]
    fn plain_c_cancels_a_run() {
        assert_eq!(handle_key_event(key(KeyCode::Char('c')), false), Some(Action::Cancel));
    }
}
