//! Typed file events emitted after successful writes

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Event kinds fired by the upload pipeline and chunk assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    /// A new file appeared at the path
    Created,
    /// An existing file was replaced
    Updated,
    /// Fired after either of the above
    Written,
}

impl FileEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Updated => "updated",
            FileEventKind::Written => "written",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub user: String,
    pub path: String,
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind.label(), self.user, self.path)
    }
}

/// Receives file events. Implementations must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &FileEvent);
}

/// Ordered collection of listeners, injected into every request context.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: FileEvent) {
        debug!("File event: {}", event);
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }

    /// Emit Created or Updated, then Written.
    pub fn emit_write(&self, user: &str, path: &str, existed_before: bool) {
        let kind = if existed_before {
            FileEventKind::Updated
        } else {
            FileEventKind::Created
        };
        for kind in [kind, FileEventKind::Written] {
            self.emit(FileEvent {
                kind,
                user: user.to_string(),
                path: path.to_string(),
            });
        }
    }
}

/// Listener that remembers every event; used by tests and diagnostics.
#[derive(Default)]
pub struct RecordingListener {
    events: parking_lot::Mutex<Vec<FileEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FileEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<FileEventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &FileEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_write_order_for_new_file() {
        let bus = EventBus::new();
        let rec = RecordingListener::new();
        bus.subscribe(rec.clone());
        bus.emit_write("alice", "/a.txt", false);
        assert_eq!(
            rec.kinds(),
            vec![FileEventKind::Created, FileEventKind::Written]
        );
    }

    #[test]
    fn test_emit_write_order_for_existing_file() {
        let bus = EventBus::new();
        let rec = RecordingListener::new();
        bus.subscribe(rec.clone());
        bus.emit_write("alice", "/a.txt", true);
        assert_eq!(
            rec.kinds(),
            vec![FileEventKind::Updated, FileEventKind::Written]
        );
        assert_eq!(rec.events()[0].path, "/a.txt");
    }
}
