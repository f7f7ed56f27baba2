//! Client session: the glue between transport, tile store, subscription
//! reconciler and outbox.
//!
//! The session is a task; the app drives it through a handle (viewport
//! moves, cell toggles, cursor moves) and consumes a stream of events
//! (tile updates, remote cursors, connectivity). All protocol decisions
//! live in `SessionState`, which is synchronous and fully testable; the
//! task just shuttles actions to the transport and events to the app.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use gingham_common::domain::{
    OFFLINE_WARNING_MS, PACED_DRAIN_INTERVAL_MS, TileKey, WORLD_MAX, cell_index,
    is_world_coord_valid,
};
use gingham_common::now_ms;
use gingham_common::rle::decode_rle64;
use gingham_common::wire::{CellUpBatch, ClientMessage, ServerMessage};

use crate::outbox::Outbox;
use crate::reconciler::{CameraRect, Reconciler};
use crate::store::{Applied, TileStore};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Identity assigned (or confirmed) by the server.
    Ready { uid: String, name: String },
    /// A cached tile changed (snapshot or applied ops).
    TileUpdated { tile: TileKey },
    /// A remote cursor moved.
    RemoteCursor {
        uid: String,
        name: String,
        x: f32,
        y: f32,
    },
    /// Server refused something.
    ServerError { code: String, msg: String },
    /// Continuously disconnected past the warning threshold.
    Offline { for_ms: i64, unsynced: usize },
    /// Back online after an Offline warning.
    Online,
}

pub enum SessionCmd {
    Viewport(CameraRect),
    SetCell { x: i64, y: i64, v: u8 },
    Cursor { x: f32, y: f32 },
    Dispose,
}

/// Pure outputs of the session state machine.
#[derive(Debug, PartialEq)]
enum Action {
    Send(ClientMessage),
    SetUrl(String),
    Emit(SessionEvent),
}

struct SessionState {
    base_url: String,
    store: Arc<Mutex<TileStore>>,
    reconciler: Reconciler,
    outbox: Outbox,
    camera: Option<CameraRect>,
    connected: bool,
    disconnected_since: Option<i64>,
    offline_warned: bool,
    replaying: bool,
}

impl SessionState {
    fn new(base_url: String, store: Arc<Mutex<TileStore>>) -> Self {
        Self {
            base_url,
            store,
            reconciler: Reconciler::new(),
            outbox: Outbox::new(),
            camera: None,
            connected: false,
            disconnected_since: None,
            offline_warned: false,
            replaying: false,
        }
    }

    fn on_open(&mut self, reconnected: bool) -> Vec<Action> {
        let mut actions = Vec::new();
        self.connected = true;
        self.disconnected_since = None;
        if std::mem::take(&mut self.offline_warned) {
            actions.push(Action::Emit(SessionEvent::Online));
        }
        // The shard knows nothing about us anymore; resubscribe the whole
        // viewport from scratch.
        self.reconciler.reset();
        if let Some(camera) = self.camera {
            actions.extend(self.reconcile(&camera));
        }
        self.replaying = reconnected && !self.outbox.is_empty();
        actions
    }

    fn on_closed(&mut self, now: i64) {
        self.connected = false;
        self.disconnected_since.get_or_insert(now);
    }

    fn on_viewport(&mut self, camera: CameraRect) -> Vec<Action> {
        self.camera = Some(camera);
        if self.connected {
            self.reconcile(&camera)
        } else {
            Vec::new()
        }
    }

    fn reconcile(&mut self, camera: &CameraRect) -> Vec<Action> {
        let (to_sub, to_unsub) = self.reconciler.reconcile(camera);
        let mut actions = Vec::new();
        if !to_sub.is_empty() {
            actions.push(Action::Send(ClientMessage::Sub { tiles: to_sub }));
        }
        if !to_unsub.is_empty() {
            actions.push(Action::Send(ClientMessage::Unsub { tiles: to_unsub }));
        }
        actions
    }

    fn on_set_cell(&mut self, x: i64, y: i64, v: u8, now: i64) -> Vec<Action> {
        if x.unsigned_abs() > WORLD_MAX as u64 || y.unsigned_abs() > WORLD_MAX as u64 || v > 1 {
            return Vec::new();
        }
        let tile = TileKey::of_world(x, y);
        let i = cell_index(x, y);
        let op = uuid::Uuid::new_v4().to_string();
        // The intent outlives the socket: the op id makes the eventual
        // replay idempotent at the owner.
        self.outbox.record(tile, i, v, op.clone(), now);
        vec![Action::Send(ClientMessage::SetCell { tile, i, v, op })]
    }

    fn on_cursor(&mut self, x: f32, y: f32) -> Vec<Action> {
        if !is_world_coord_valid(x) || !is_world_coord_valid(y) {
            return Vec::new();
        }
        vec![Action::Send(ClientMessage::Cur { x, y })]
    }

    fn on_server_message(&mut self, msg: ServerMessage) -> Vec<Action> {
        match msg {
            ServerMessage::Hello { uid, name, token } => {
                let sep = if self.base_url.contains('?') { '&' } else { '?' };
                vec![
                    Action::SetUrl(format!("{}{}token={}", self.base_url, sep, token)),
                    Action::Emit(SessionEvent::Ready { uid, name }),
                ]
            }
            ServerMessage::TileSnap { tile, ver, bits } => match decode_rle64(&bits) {
                Ok(decoded) => {
                    self.store.lock().set_snapshot(tile, decoded, ver);
                    vec![Action::Emit(SessionEvent::TileUpdated { tile })]
                }
                Err(e) => {
                    tracing::warn!(%tile, ?e, "undecodable snapshot");
                    Vec::new()
                }
            },
            ServerMessage::CellUp { tile, i, v, ver } => {
                self.outbox.ack(tile, i, v);
                let applied = self.store.lock().apply_single(tile, i, v, ver);
                self.after_apply(tile, applied)
            }
            ServerMessage::CellUpBatch(CellUpBatch {
                tile,
                from_ver,
                to_ver,
                ops,
            }) => {
                for &(i, v) in &ops {
                    self.outbox.ack(tile, i, v);
                }
                let applied = self.store.lock().apply_batch(tile, from_ver, to_ver, &ops);
                self.after_apply(tile, applied)
            }
            ServerMessage::CurUp { uid, name, x, y } => {
                vec![Action::Emit(SessionEvent::RemoteCursor { uid, name, x, y })]
            }
            ServerMessage::Err { code, msg } => {
                vec![Action::Emit(SessionEvent::ServerError { code, msg })]
            }
        }
    }

    /// Gap handling: exactly one resync per gap arrival, nothing for
    /// belated echoes.
    fn after_apply(&mut self, tile: TileKey, applied: Applied) -> Vec<Action> {
        match applied {
            Applied::Ok { .. } => vec![Action::Emit(SessionEvent::TileUpdated { tile })],
            Applied::Stale => Vec::new(),
            Applied::Gap { have_ver } => {
                vec![Action::Send(ClientMessage::ResyncTile {
                    tile,
                    have_ver: have_ver.max(0) as u32,
                })]
            }
        }
    }

    fn on_tick(&mut self, now: i64) -> Vec<Action> {
        let mut actions = Vec::new();

        if !self.connected
            && !self.offline_warned
            && let Some(since) = self.disconnected_since
            && now - since >= OFFLINE_WARNING_MS
        {
            self.offline_warned = true;
            actions.push(Action::Emit(SessionEvent::Offline {
                for_ms: now - since,
                unsynced: self.outbox.len(),
            }));
        }

        if self.connected && self.replaying {
            for msg in self.outbox.replay_batch(now) {
                actions.push(Action::Send(msg));
            }
            if self.outbox.is_empty() {
                self.replaying = false;
            }
        }
        actions
    }
}

/// Handle the app holds onto; dropping it does not stop the session, call
/// `dispose` for that.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    tiles: Arc<Mutex<TileStore>>,
}

impl SessionHandle {
    pub fn viewport(&self, camera: CameraRect) {
        let _ = self.cmd_tx.send(SessionCmd::Viewport(camera));
    }

    pub fn set_cell(&self, x: i64, y: i64, v: u8) {
        let _ = self.cmd_tx.send(SessionCmd::SetCell { x, y, v });
    }

    pub fn cursor(&self, x: f32, y: f32) {
        let _ = self.cmd_tx.send(SessionCmd::Cursor { x, y });
    }

    pub fn dispose(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Dispose);
    }

    /// Shared read access to the decoded tile cache (render path).
    pub fn tiles(&self) -> Arc<Mutex<TileStore>> {
        self.tiles.clone()
    }
}

/// Start a session against `url` (e.g. `ws://host:3000/ws`).
pub fn start(url: String) -> (SessionHandle, async_channel::Receiver<SessionEvent>) {
    let store = Arc::new(Mutex::new(TileStore::new()));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = async_channel::bounded(1024);
    let (transport, transport_rx) = Transport::connect(url.clone());
    let state = SessionState::new(url, store.clone());

    tokio::spawn(run(state, transport, transport_rx, cmd_rx, event_tx));

    (SessionHandle { cmd_tx, tiles: store }, event_rx)
}

async fn run(
    mut state: SessionState,
    transport: Transport,
    transport_rx: async_channel::Receiver<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    events: async_channel::Sender<SessionEvent>,
) {
    let mut tick = interval(Duration::from_millis(PACED_DRAIN_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut commands_open = true;

    loop {
        let actions = tokio::select! {
            event = transport_rx.recv() => match event {
                Ok(TransportEvent::Open { reconnected }) => state.on_open(reconnected),
                Ok(TransportEvent::Message(msg)) => state.on_server_message(msg),
                Ok(TransportEvent::Closed { disposed: false }) => {
                    state.on_closed(now_ms());
                    Vec::new()
                }
                Ok(TransportEvent::Closed { disposed: true }) | Err(_) => break,
            },
            cmd = cmd_rx.recv(), if commands_open => match cmd {
                Some(SessionCmd::Viewport(camera)) => state.on_viewport(camera),
                Some(SessionCmd::SetCell { x, y, v }) => state.on_set_cell(x, y, v, now_ms()),
                Some(SessionCmd::Cursor { x, y }) => state.on_cursor(x, y),
                Some(SessionCmd::Dispose) => {
                    transport.dispose();
                    continue;
                }
                None => {
                    // Dropping every handle counts as dispose. The loop
                    // ends once the transport confirms the close.
                    commands_open = false;
                    transport.dispose();
                    continue;
                }
            },
            _ = tick.tick() => state.on_tick(now_ms()),
        };

        for action in actions {
            match action {
                Action::Send(msg) => transport.send(msg),
                Action::SetUrl(url) => transport.set_url(url),
                Action::Emit(event) => {
                    if events.send(event).await.is_err() {
                        transport.dispose();
                    }
                }
            }
        }
    }
}
