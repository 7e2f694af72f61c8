//! Bridge between an editing widget and the replicated text.
//!
//! Key responsibilities:
//! - Turning local editor mutations into text store operations
//! - Replaying integrated remote changes into the widget
//! - Keeping the local selection in place while remote text moves around it
//! - Seeding the document from its snapshot exactly once

use crate::awareness::Collaborator;
use crate::error::{CollabError, CollabResult};
use crate::operation::Operation;
use crate::text_store::{CursorAnchor, TextChange, TextStore};
use serde::{Deserialize, Serialize};

/// A selection in visible offsets. Collapsed when `anchor == head`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(offset: usize) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Where this selection ends up after `change` is applied around it.
    pub fn map_change(self, change: &TextChange) -> Self {
        Self {
            anchor: map_offset(self.anchor, change),
            head: map_offset(self.head, change),
        }
    }

    fn clamp(self, len: usize) -> Self {
        Self {
            anchor: self.anchor.min(len),
            head: self.head.min(len),
        }
    }
}

fn map_offset(offset: usize, change: &TextChange) -> usize {
    match change {
        TextChange::Inserted { offset: at, text } => {
            if *at <= offset {
                offset + text.chars().count()
            } else {
                offset
            }
        }
        TextChange::Deleted { offset: at, len } => {
            if offset >= at + len {
                offset - len
            } else if offset > *at {
                *at
            } else {
                offset
            }
        }
    }
}

/// A mutation reported by the local editor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorEvent {
    Insert { offset: usize, text: String },
    Delete { start: usize, end: usize },
    /// Replace `start..end` with `text` (paste over a selection)
    Replace { start: usize, end: usize, text: String },
    SelectionChanged(Selection),
}

/// A remote participant's cursor, resolved against the current text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceMarker {
    pub collaborator: Collaborator,
    /// `None` when the anchor's character has not reached this replica yet
    pub offset: Option<usize>,
}

/// The widget side of the binding.
pub trait EditorSink: Send {
    fn apply_remote_insert(&mut self, offset: usize, text: &str);

    fn apply_remote_delete(&mut self, offset: usize, len: usize);

    /// The local selection moved because of remote edits.
    fn set_selection(&mut self, _selection: Selection) {}

    /// Remote cursors changed.
    fn render_presence(&mut self, _markers: &[PresenceMarker]) {}
}

/// Adapter between one editor widget and a [`TextStore`].
pub struct EditorBinding {
    sink: Option<Box<dyn EditorSink>>,
    selection: Selection,
    seeded: bool,
}

impl Default for EditorBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorBinding {
    /// A binding with no widget attached yet.
    pub fn new() -> Self {
        Self {
            sink: None,
            selection: Selection::default(),
            seeded: false,
        }
    }

    /// Attach a widget. It is brought up to date with `store` immediately.
    pub fn attach(&mut self, mut sink: Box<dyn EditorSink>, store: &TextStore) {
        let text = store.render_visible_text();
        if !text.is_empty() {
            sink.apply_remote_insert(0, &text);
        }
        self.selection = self.selection.clamp(store.len());
        self.sink = Some(sink);
    }

    pub fn detach(&mut self) -> Option<Box<dyn EditorSink>> {
        self.sink.take()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Anchor of the local caret, for publishing in awareness.
    pub fn cursor_anchor(&self, store: &TextStore) -> CursorAnchor {
        store.anchor_at(self.selection.head)
    }

    /// Seed `store` with snapshot content.
    ///
    /// Happens at most once per binding, and only while the store has not
    /// integrated anything; later calls return `Ok(None)`.
    pub fn seed(&mut self, store: &mut TextStore, content: &str) -> CollabResult<Option<Operation>> {
        if self.seeded {
            return Ok(None);
        }
        self.seeded = true;
        match store.seed(content) {
            Ok(Some(op)) => {
                if let Some(sink) = self.sink.as_mut() {
                    sink.apply_remote_insert(0, content);
                }
                Ok(Some(op))
            }
            Ok(None) => Ok(None),
            Err(CollabError::AlreadySeeded) => {
                tracing::debug!("document already has content, skipping seed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a local editor mutation to `store`, returning the operations to
    /// broadcast.
    pub fn handle_local(
        &mut self,
        store: &mut TextStore,
        event: EditorEvent,
    ) -> CollabResult<Vec<Operation>> {
        match event {
            EditorEvent::Insert { offset, text } => {
                let op = store.apply_local_insert(offset, &text)?;
                self.track_local(&TextChange::Inserted { offset, text });
                Ok(vec![op])
            }
            EditorEvent::Delete { start, end } => {
                let ops = store.apply_local_delete(start, end)?;
                if !ops.is_empty() {
                    self.track_local(&TextChange::Deleted {
                        offset: start,
                        len: end - start,
                    });
                }
                Ok(ops)
            }
            EditorEvent::Replace { start, end, text } => {
                let mut ops = self.handle_local(store, EditorEvent::Delete { start, end })?;
                if !text.is_empty() {
                    ops.extend(self.handle_local(store, EditorEvent::Insert { offset: start, text })?);
                }
                Ok(ops)
            }
            EditorEvent::SelectionChanged(selection) => {
                self.selection = selection.clamp(store.len());
                Ok(Vec::new())
            }
        }
    }

    /// Replay integrated remote changes into the widget, keeping the local
    /// selection attached to the text it was in.
    pub fn apply_remote(&mut self, changes: &[TextChange]) {
        if changes.is_empty() {
            return;
        }
        let before = self.selection;
        for change in changes {
            self.selection = self.selection.map_change(change);
            if let Some(sink) = self.sink.as_mut() {
                match change {
                    TextChange::Inserted { offset, text } => sink.apply_remote_insert(*offset, text),
                    TextChange::Deleted { offset, len } => sink.apply_remote_delete(*offset, *len),
                }
            }
        }
        if self.selection != before {
            if let Some(sink) = self.sink.as_mut() {
                sink.set_selection(self.selection);
            }
        }
    }

    /// Hand resolved remote cursors to the widget.
    pub fn render_presence(&mut self, store: &TextStore, collaborators: Vec<Collaborator>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let markers: Vec<PresenceMarker> = collaborators
            .into_iter()
            .map(|collaborator| {
                let offset = collaborator
                    .cursor
                    .as_ref()
                    .and_then(|anchor| store.resolve_anchor(anchor));
                PresenceMarker {
                    collaborator,
                    offset,
                }
            })
            .collect();
        sink.render_presence(&markers);
    }

    // The editor moves its own caret for local edits; mirror that here.
    fn track_local(&mut self, change: &TextChange) {
        self.selection = self.selection.map_change(change);
    }
}

/// An [`EditorSink`] that keeps a plain string in sync. Handy for tests and
/// headless peers.
#[derive(Debug, Default, Clone)]
pub struct StringEditor {
    pub text: String,
    pub selection: Selection,
    pub markers: Vec<PresenceMarker>,
}

impl EditorSink for StringEditor {
    fn apply_remote_insert(&mut self, offset: usize, text: &str) {
        let at = byte_offset(&self.text, offset);
        self.text.insert_str(at, text);
    }

    fn apply_remote_delete(&mut self, offset: usize, len: usize) {
        let start = byte_offset(&self.text, offset);
        let end = byte_offset(&self.text, offset + len);
        self.text.replace_range(start..end, "");
    }

    fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
    }

    fn render_presence(&mut self, markers: &[PresenceMarker]) {
        self.markers = markers.to_vec();
    }
}

/// A shared handle to a [`StringEditor`], so tests can inspect the widget
/// after handing it to a session.
#[derive(Debug, Default, Clone)]
pub struct SharedEditor(pub std::sync::Arc<std::sync::Mutex<StringEditor>>);

impl SharedEditor {
    pub fn text(&self) -> String {
        self.0.lock().map(|e| e.text.clone()).unwrap_or_default()
    }

    pub fn selection(&self) -> Selection {
        self.0.lock().map(|e| e.selection).unwrap_or_default()
    }

    pub fn markers(&self) -> Vec<PresenceMarker> {
        self.0.lock().map(|e| e.markers.clone()).unwrap_or_default()
    }
}

impl EditorSink for SharedEditor {
    fn apply_remote_insert(&mut self, offset: usize, text: &str) {
        if let Ok(mut editor) = self.0.lock() {
            editor.apply_remote_insert(offset, text);
        }
    }

    fn apply_remote_delete(&mut self, offset: usize, len: usize) {
        if let Ok(mut editor) = self.0.lock() {
            editor.apply_remote_delete(offset, len);
        }
    }

    fn set_selection(&mut self, selection: Selection) {
        if let Ok(mut editor) = self.0.lock() {
            editor.set_selection(selection);
        }
    }

    fn render_presence(&mut self, markers: &[PresenceMarker]) {
        if let Ok(mut editor) = self.0.lock() {
            editor.render_presence(markers);
        }
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(index, _)| index)
}
