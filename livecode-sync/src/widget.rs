//! Editing-surface capability and an in-memory implementation.
//!
//! The controller never keeps its own copy of the document. It reads and
//! writes through [`TextWidget`] and learns about edits from the change
//! stream, where every event carries an [`Origin`] tag.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Typed, pasted, deleted or undone by the local user.
    UserEdit,
    /// Replaced through [`TextWidget::set_value`].
    ProgrammaticSet,
    Other,
}

/// Whether a change was authored here or applied on behalf of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Local,
    Remote,
}

impl Origin {
    /// Map an editor origin string to a tag.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "setValue" => Self::ProgrammaticSet,
            "+input" | "+delete" | "paste" | "cut" | "drag" | "undo" | "redo" | "*compose"
            | "+move" => Self::UserEdit,
            _ => Self::Other,
        }
    }

    /// Only programmatic sets are non-originating.
    pub fn kind(self) -> ChangeKind {
        match self {
            Self::ProgrammaticSet => ChangeKind::Remote,
            Self::UserEdit | Self::Other => ChangeKind::Local,
        }
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: Origin,
    /// Full document text after the change.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Handle returned by [`TextWidget::on_change`].
#[derive(Debug)]
pub struct ChangeSubscription {
    pub id: ListenerId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// The editing surface the controller drives.
pub trait TextWidget: Send + Sync {
    fn value(&self) -> String;

    /// Replace the whole document. Fires a change tagged
    /// [`Origin::ProgrammaticSet`].
    fn set_value(&self, text: &str);

    fn on_change(&self) -> ChangeSubscription;

    /// Detach a listener. Its receiver ends once drained.
    fn off_change(&self, id: ListenerId);

    fn mode_name(&self) -> String;

    /// Ask the widget to open its suggestion popup.
    fn show_hint(&self);
}

struct BufferState {
    text: String,
    listeners: Vec<(ListenerId, mpsc::UnboundedSender<ChangeEvent>)>,
}

/// In-memory [`TextWidget`].
///
/// Listeners are notified while the buffer lock is held, so events arrive in
/// exactly the order the edits were made.
pub struct TextBuffer {
    state: Mutex<BufferState>,
    mode: String,
    next_listener: AtomicU64,
    hints: AtomicU64,
}

impl TextBuffer {
    pub fn new(mode: impl Into<String>) -> Self {
        Self::with_text(mode, "")
    }

    pub fn with_text(mode: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                text: text.into(),
                listeners: Vec::new(),
            }),
            mode: mode.into(),
            next_listener: AtomicU64::new(1),
            hints: AtomicU64::new(0),
        }
    }

    /// Insert at a character offset (clamped to the end) as a user edit.
    pub fn insert(&self, at: usize, text: &str) {
        self.mutate(Origin::UserEdit, |doc| {
            let byte = byte_offset(doc, at);
            doc.insert_str(byte, text);
        });
    }

    /// Delete the character range `start..end` as a user edit.
    pub fn delete(&self, start: usize, end: usize) {
        self.mutate(Origin::UserEdit, |doc| {
            let from = byte_offset(doc, start);
            let to = byte_offset(doc, end.max(start));
            doc.replace_range(from..to, "");
        });
    }

    /// Append `keys` one character at a time, one change per keystroke.
    pub fn type_str(&self, keys: &str) {
        for ch in keys.chars() {
            self.mutate(Origin::UserEdit, |doc| doc.push(ch));
        }
    }

    /// Replace the document with an explicit origin.
    pub fn apply(&self, text: &str, origin: Origin) {
        self.mutate(origin, |doc| {
            doc.clear();
            doc.push_str(text);
        });
    }

    /// Number of times [`TextWidget::show_hint`] was called.
    pub fn hint_count(&self) -> u64 {
        self.hints.load(Ordering::Relaxed)
    }

    /// Number of attached change listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    fn mutate(&self, origin: Origin, edit: impl FnOnce(&mut String)) {
        let mut state = self.state.lock();
        edit(&mut state.text);
        let event = ChangeEvent {
            origin,
            text: state.text.clone(),
        };
        state
            .listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

impl TextWidget for TextBuffer {
    fn value(&self) -> String {
        self.state.lock().text.clone()
    }

    fn set_value(&self, text: &str) {
        self.apply(text, Origin::ProgrammaticSet);
    }

    fn on_change(&self) -> ChangeSubscription {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        self.state.lock().listeners.push((id, tx));
        ChangeSubscription { id, events }
    }

    fn off_change(&self, id: ListenerId) {
        self.state.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    fn mode_name(&self) -> String {
        self.mode.clone()
    }

    fn show_hint(&self) {
        self.hints.fetch_add(1, Ordering::Relaxed);
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(byte, _)| byte)
}
