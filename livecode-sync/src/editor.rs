//! Editor synchronization controller.
//!
//! Bridges one [`TextWidget`] to a room on the shared event channel:
//!
//! ```text
//! keystroke ─► widget change(UserEdit) ─┬─► host callback
//!                                       ├─► emit code-change {roomId, code}
//!                                       └─► debounce re-arm ─(600ms quiet)─► show_hint
//!
//! peer code-change {code} ─► widget.set_value ─► change(ProgrammaticSet) ─► host callback only
//! ```
//!
//! All state lives on one task that handles a single event per loop turn,
//! so the emit and the timer re-arm for a keystroke happen together, before
//! anything else is looked at.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::debounce::Debouncer;
use crate::protocol::{InboundCodeChange, OutboundCodeChange, ProtocolError, RoomId, CODE_CHANGE};
use crate::transport::{EventReceiver, SocketRef, Transport, TransportError};
use crate::widget::{ChangeEvent, ChangeKind, ListenerId, TextWidget};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before the suggestion popup is requested
    pub debounce: Duration,
    /// Widget mode that supports contextual suggestions
    pub hint_mode: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(600),
            hint_mode: "javascript".to_string(),
        }
    }
}

/// Snapshot of controller counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub local_changes: u64,
    pub remote_changes: u64,
    pub emitted: u64,
    /// Local changes that could not be published (no connection, closed socket)
    pub dropped_emits: u64,
    pub applied: u64,
    pub null_payloads: u64,
    pub hints_shown: u64,
    pub hints_skipped: u64,
}

#[derive(Default)]
struct AtomicSyncStats {
    local_changes: AtomicU64,
    remote_changes: AtomicU64,
    emitted: AtomicU64,
    dropped_emits: AtomicU64,
    applied: AtomicU64,
    null_payloads: AtomicU64,
    hints_shown: AtomicU64,
    hints_skipped: AtomicU64,
}

impl AtomicSyncStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            local_changes: self.local_changes.load(Ordering::Relaxed),
            remote_changes: self.remote_changes.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped_emits: self.dropped_emits.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            null_payloads: self.null_payloads.load(Ordering::Relaxed),
            hints_shown: self.hints_shown.load(Ordering::Relaxed),
            hints_skipped: self.hints_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Host notification, called with the full text on every change.
pub type CodeChangeCallback = Box<dyn FnMut(&str) + Send>;

/// Listener registrations owned by the sync task.
///
/// Dropping it detaches everything, so an aborted task cleans up the same
/// way an orderly unmount does.
struct Subscriptions {
    widget: Arc<dyn TextWidget>,
    change_listener: ListenerId,
    transport: Option<Arc<dyn Transport>>,
}

impl Subscriptions {
    /// Move the inbound listener to `next`, detaching from the previous
    /// transport first.
    fn bind(&mut self, next: Option<Arc<dyn Transport>>) -> Option<EventReceiver> {
        if let Some(prev) = self.transport.take() {
            prev.off(CODE_CHANGE);
        }
        let inbound = next.as_ref().map(|t| t.on(CODE_CHANGE));
        self.transport = next;
        inbound
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.widget.off_change(self.change_listener);
        if let Some(transport) = self.transport.take() {
            transport.off(CODE_CHANGE);
        }
    }
}

/// A mounted editor bound to one room.
pub struct EditorSync {
    room_id: RoomId,
    stats: Arc<AtomicSyncStats>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EditorSync {
    /// Attach to `widget` and the room, and start the sync task.
    ///
    /// Both listeners are registered before this returns, so no edit made
    /// after `mount` is missed. Must be called inside a tokio runtime.
    pub fn mount<F>(
        widget: Arc<dyn TextWidget>,
        socket: &SocketRef,
        room_id: RoomId,
        config: SyncConfig,
        on_code_change: F,
    ) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        let stats = Arc::new(AtomicSyncStats::default());
        let changes = widget.on_change();

        let mut socket_rx = socket.watch();
        let mut subscriptions = Subscriptions {
            widget: widget.clone(),
            change_listener: changes.id,
            transport: None,
        };
        let inbound = subscriptions.bind(socket_rx.borrow_and_update().clone());
        if inbound.is_none() {
            log::debug!("Room {room_id}: no connection at mount, waiting for socket");
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let sync_loop = SyncLoop {
            widget,
            room_id: room_id.clone(),
            hint_mode: config.hint_mode,
            on_code_change: Box::new(on_code_change),
            stats: stats.clone(),
            debounce: Debouncer::new(config.debounce),
            socket: socket_rx,
            subscriptions,
        };
        let task = tokio::spawn(sync_loop.run(Some(changes.events), inbound, shutdown_rx));

        log::info!("Editor sync mounted for room {room_id}");
        Self {
            room_id,
            stats,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Tear down: drop anything still queued, cancel the pending hint and
    /// detach both listeners. Nothing fires once this returns.
    pub async fn unmount(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("Editor sync task for room {} panicked", self.room_id);
                }
            }
        }
        log::info!("Editor sync unmounted for room {}", self.room_id);
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    pub fn is_mounted(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EditorSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SyncLoop {
    widget: Arc<dyn TextWidget>,
    room_id: RoomId,
    hint_mode: String,
    on_code_change: CodeChangeCallback,
    stats: Arc<AtomicSyncStats>,
    debounce: Debouncer,
    socket: watch::Receiver<Option<Arc<dyn Transport>>>,
    subscriptions: Subscriptions,
}

impl SyncLoop {
    async fn run(
        mut self,
        mut changes: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
        mut inbound: Option<EventReceiver>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Ok(()) = self.socket.changed() => {
                    let next = self.socket.borrow_and_update().clone();
                    log::debug!(
                        "Room {}: socket {}, rebinding listener",
                        self.room_id,
                        if next.is_some() { "replaced" } else { "cleared" }
                    );
                    inbound = self.subscriptions.bind(next);
                }

                event = next_or_pending(&mut changes) => match event {
                    Some(event) => self.on_change(event),
                    None => {
                        log::debug!("Room {}: widget change stream ended", self.room_id);
                        changes = None;
                    }
                },

                payload = next_or_pending(&mut inbound) => match payload {
                    Some(payload) => self.on_remote(payload),
                    None => {
                        log::debug!("Room {}: inbound listener detached", self.room_id);
                        inbound = None;
                    }
                },

                () = self.debounce.expired() => self.on_quiet(),
            }
        }

        self.debounce.cancel();
        log::debug!("Room {}: sync loop stopped", self.room_id);
    }

    fn on_change(&mut self, event: ChangeEvent) {
        match event.origin.kind() {
            ChangeKind::Local => {
                AtomicSyncStats::bump(&self.stats.local_changes);
                self.debounce.arm();
                (self.on_code_change)(&event.text);
                self.publish(event.text);
            }
            ChangeKind::Remote => {
                AtomicSyncStats::bump(&self.stats.remote_changes);
                (self.on_code_change)(&event.text);
            }
        }
    }

    fn publish(&self, code: String) {
        let Some(transport) = self.socket.borrow().clone() else {
            log::debug!("Room {}: not connected, code change dropped", self.room_id);
            AtomicSyncStats::bump(&self.stats.dropped_emits);
            return;
        };

        let message = OutboundCodeChange {
            room_id: self.room_id.clone(),
            code,
        };
        let result = serde_json::to_value(&message)
            .map_err(|e| TransportError::from(ProtocolError::Serialization(e.to_string())))
            .and_then(|payload| transport.emit(CODE_CHANGE, payload));

        match result {
            Ok(()) => AtomicSyncStats::bump(&self.stats.emitted),
            Err(e) => {
                log::debug!("Room {}: code change not sent: {e}", self.room_id);
                AtomicSyncStats::bump(&self.stats.dropped_emits);
            }
        }
    }

    fn on_remote(&mut self, payload: Value) {
        match serde_json::from_value::<InboundCodeChange>(payload) {
            Ok(InboundCodeChange { code: Some(code) }) => {
                log::trace!("Room {}: applying remote code ({} bytes)", self.room_id, code.len());
                self.widget.set_value(&code);
                AtomicSyncStats::bump(&self.stats.applied);
            }
            Ok(InboundCodeChange { code: None }) => {
                AtomicSyncStats::bump(&self.stats.null_payloads);
            }
            Err(e) => {
                log::warn!("Room {}: malformed code-change payload: {e}", self.room_id);
            }
        }
    }

    fn on_quiet(&mut self) {
        if self.widget.mode_name() == self.hint_mode {
            self.widget.show_hint();
            AtomicSyncStats::bump(&self.stats.hints_shown);
        } else {
            AtomicSyncStats::bump(&self.stats.hints_skipped);
        }
    }
}

async fn next_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Listeners;
    use crate::widget::TextBuffer;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::time::sleep;

    /// Records emits; lets the test push inbound payloads.
    #[derive(Default)]
    struct FakeTransport {
        emitted: Mutex<Vec<(String, Value)>>,
        listeners: Listeners,
        offline: std::sync::atomic::AtomicBool,
    }

    impl FakeTransport {
        fn deliver(&self, payload: Value) -> usize {
            self.listeners.dispatch(CODE_CHANGE, &payload)
        }

        fn emitted(&self) -> Vec<(String, Value)> {
            self.emitted.lock().clone()
        }
    }

    impl Transport for FakeTransport {
        fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
            if self.offline.load(Ordering::Relaxed) {
                return Err(TransportError::NotConnected);
            }
            self.emitted.lock().push((event.to_string(), payload));
            Ok(())
        }

        fn on(&self, event: &str) -> EventReceiver {
            self.listeners.register(event)
        }

        fn off(&self, event: &str) {
            self.listeners.remove(event);
        }
    }

    struct Harness {
        buffer: Arc<TextBuffer>,
        transport: Arc<FakeTransport>,
        socket: SocketRef,
        host: mpsc::UnboundedReceiver<String>,
        sync: EditorSync,
    }

    fn mount(mode: &str) -> Harness {
        let buffer = Arc::new(TextBuffer::new(mode));
        let transport = Arc::new(FakeTransport::default());
        let socket = SocketRef::connected(transport.clone());
        let (host_tx, host) = mpsc::unbounded_channel();
        let sync = EditorSync::mount(
            buffer.clone(),
            &socket,
            RoomId::from("room-1"),
            SyncConfig::default(),
            move |code: &str| {
                let _ = host_tx.send(code.to_string());
            },
        );
        Harness {
            buffer,
            transport,
            socket,
            host,
            sync,
        }
    }

    /// Let the sync task drain everything queued so far.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_change_emits_full_text_with_room() {
        let mut h = mount("javascript");

        h.buffer.type_str("a");
        settle().await;

        let emitted = h.transport.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, CODE_CHANGE);
        assert_eq!(emitted[0].1, json!({"roomId": "room-1", "code": "a"}));
        assert_eq!(h.host.recv().await.unwrap(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_each_keystroke_and_hints_once() {
        let h = mount("javascript");

        for key in ["a", "b", "c"] {
            h.buffer.type_str(key);
            sleep(Duration::from_millis(30)).await;
        }

        let codes: Vec<Value> = h.transport.emitted().into_iter().map(|(_, p)| p["code"].clone()).collect();
        assert_eq!(codes, vec![json!("a"), json!("ab"), json!("abc")]);
        assert_eq!(h.buffer.hint_count(), 0);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.buffer.hint_count(), 0, "fired before the quiet period ended");

        sleep(Duration::from_millis(150)).await;
        assert_eq!(h.buffer.hint_count(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.buffer.hint_count(), 1);
        assert_eq!(h.sync.stats().hints_shown, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_changes_hint_once_each() {
        let h = mount("javascript");

        for key in ["x", "y", "z"] {
            h.buffer.type_str(key);
            sleep(Duration::from_millis(700)).await;
        }

        assert_eq!(h.buffer.hint_count(), 3);
        assert_eq!(h.transport.emitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_hint_outside_suggestion_mode() {
        let h = mount("markdown");

        h.buffer.type_str("abc");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.buffer.hint_count(), 0);
        let stats = h.sync.stats();
        assert_eq!(stats.hints_shown, 0);
        assert_eq!(stats.hints_skipped, 1);
        assert_eq!(stats.emitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_update_applies_without_echo() {
        let mut h = mount("javascript");

        assert_eq!(h.transport.deliver(json!({"code": "let x=1;"})), 1);
        settle().await;

        assert_eq!(h.buffer.value(), "let x=1;");
        assert_eq!(h.host.recv().await.unwrap(), "let x=1;");
        assert!(h.host.try_recv().is_err(), "host notified more than once");
        assert!(h.transport.emitted().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.buffer.hint_count(), 0);

        let stats = h.sync.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.remote_changes, 1);
        assert_eq!(stats.local_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_update_keeps_pending_hint_deadline() {
        let h = mount("javascript");

        h.buffer.type_str("a");
        sleep(Duration::from_millis(300)).await;
        h.transport.deliver(json!({"code": "from peer"}));
        settle().await;
        assert_eq!(h.buffer.value(), "from peer");
        assert_eq!(h.buffer.hint_count(), 0);

        // Deadline is still 600ms after the keystroke, not after the remote apply.
        sleep(Duration::from_millis(350)).await;
        assert_eq!(h.buffer.hint_count(), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.buffer.hint_count(), 1);
        assert_eq!(h.sync.stats().hints_shown, 1);
        assert_eq!(h.transport.emitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_remote_updates_never_emit() {
        let h = mount("javascript");

        for i in 0..50 {
            h.transport.deliver(json!({ "code": format!("v{i}") }));
        }
        settle().await;

        assert_eq!(h.buffer.value(), "v49");
        assert!(h.transport.emitted().is_empty());
        assert_eq!(h.sync.stats().remote_changes, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_code_is_noop() {
        let mut h = mount("javascript");
        h.buffer.apply("keep me", crate::widget::Origin::Other);
        settle().await;
        let _ = h.host.recv().await;
        let before = h.transport.emitted().len();

        h.transport.deliver(json!({"code": null}));
        h.transport.deliver(json!({}));
        settle().await;

        assert_eq!(h.buffer.value(), "keep me");
        assert!(h.host.try_recv().is_err());
        assert_eq!(h.transport.emitted().len(), before);
        assert_eq!(h.sync.stats().null_payloads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_string_is_applied() {
        let h = mount("javascript");
        h.buffer.type_str("abc");
        settle().await;

        h.transport.deliver(json!({"code": ""}));
        settle().await;

        assert_eq!(h.buffer.value(), "");
        assert_eq!(h.sync.stats().applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_ignored() {
        let h = mount("javascript");
        h.transport.deliver(json!({"code": 42}));
        h.transport.deliver(json!("just a string"));
        settle().await;

        assert_eq!(h.buffer.value(), "");
        assert_eq!(h.sync.stats().applied, 0);
        assert!(h.sync.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_origin_counts_as_local() {
        let h = mount("javascript");
        h.buffer.apply("formatted", crate::widget::Origin::Other);
        settle().await;

        assert_eq!(h.transport.emitted().len(), 1);
        assert_eq!(h.sync.stats().local_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_without_connection_is_silent() {
        let buffer = Arc::new(TextBuffer::new("javascript"));
        let socket = SocketRef::new();
        let (host_tx, mut host) = mpsc::unbounded_channel();
        let sync = EditorSync::mount(
            buffer.clone(),
            &socket,
            RoomId::from("room-1"),
            SyncConfig::default(),
            move |code: &str| {
                let _ = host_tx.send(code.to_string());
            },
        );

        buffer.type_str("hi");
        sleep(Duration::from_secs(1)).await;

        assert_eq!(host.recv().await.unwrap(), "h");
        assert_eq!(host.recv().await.unwrap(), "hi");
        let stats = sync.stats();
        assert_eq!(stats.dropped_emits, 2);
        assert_eq!(stats.emitted, 0);
        assert_eq!(buffer.hint_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_not_retried() {
        let h = mount("javascript");
        h.transport.offline.store(true, Ordering::Relaxed);

        h.buffer.type_str("a");
        settle().await;
        h.transport.offline.store(false, Ordering::Relaxed);
        settle().await;

        assert!(h.transport.emitted().is_empty());
        assert_eq!(h.sync.stats().dropped_emits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_socket_is_subscribed() {
        let buffer = Arc::new(TextBuffer::new("javascript"));
        let socket = SocketRef::new();
        let sync = EditorSync::mount(
            buffer.clone(),
            &socket,
            RoomId::from("room-1"),
            SyncConfig::default(),
            |_: &str| {},
        );

        let transport = Arc::new(FakeTransport::default());
        socket.set(transport.clone());
        settle().await;

        assert_eq!(transport.listeners.listener_count(CODE_CHANGE), 1);
        transport.deliver(json!({"code": "late"}));
        settle().await;
        buffer.type_str("!");
        settle().await;

        assert_eq!(buffer.value(), "late!");
        assert_eq!(transport.emitted().len(), 1);
        assert_eq!(sync.stats().applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_swap_moves_listener() {
        let h = mount("javascript");
        let replacement = Arc::new(FakeTransport::default());

        h.socket.set(replacement.clone());
        settle().await;

        assert_eq!(h.transport.listeners.listener_count(CODE_CHANGE), 0);
        assert_eq!(replacement.listeners.listener_count(CODE_CHANGE), 1);

        h.buffer.type_str("q");
        settle().await;
        assert!(h.transport.emitted().is_empty());
        assert_eq!(replacement.emitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_detaches_and_cancels() {
        let Harness {
            buffer,
            transport,
            mut host,
            sync,
            ..
        } = mount("javascript");

        buffer.type_str("a");
        settle().await;
        assert_eq!(host.recv().await.unwrap(), "a");

        sync.unmount().await;

        assert_eq!(buffer.listener_count(), 0);
        assert_eq!(transport.listeners.listener_count(CODE_CHANGE), 0);

        buffer.type_str("b");
        assert_eq!(transport.deliver(json!({"code": "remote"})), 0);
        sleep(Duration::from_secs(5)).await;

        assert_eq!(buffer.hint_count(), 0, "pending hint fired after unmount");
        assert_eq!(transport.emitted().len(), 1);
        assert_eq!(buffer.value(), "ab");
        assert!(matches!(
            host.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_discards_queued_events() {
        let Harness {
            buffer,
            transport,
            sync,
            ..
        } = mount("javascript");

        // Queued but never handled: unmount wins the biased select.
        buffer.type_str("abc");
        sync.unmount().await;
        sleep(Duration::from_secs(5)).await;

        assert!(transport.emitted().is_empty());
        assert_eq!(buffer.hint_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_unmount_detaches() {
        let Harness {
            buffer,
            transport,
            sync,
            ..
        } = mount("javascript");

        drop(sync);
        settle().await;

        assert_eq!(buffer.listener_count(), 0);
        assert_eq!(transport.listeners.listener_count(CODE_CHANGE), 0);
    }

    #[test]
    fn test_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(600));
        assert_eq!(config.hint_mode, "javascript");
    }
}
