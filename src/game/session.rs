//! Session hosting and the authoritative tick loop

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::util::time::{tick_millis, SessionClock, TimeMs, SNAPSHOT_TPS};
use crate::ws::protocol::ControllerMsg;
use crate::ws::router::{MessageRouter, RouteEffect};

use super::authority::{AuthorityContext, Outbound, Recipient};
use super::capabilities::WorldGeometry;
use super::snapshot::SnapshotBuilder;
use super::weapon::FireHooks;
use super::world::StaticWorld;

/// Input channel depth per session
const INPUT_CHANNEL_SIZE: usize = 1024;
/// Outbound broadcast depth; slow connections lag past this
const OUTBOUND_CHANNEL_SIZE: usize = 512;

/// Controller message received from a WebSocket
#[derive(Debug, Clone)]
pub struct ParticipantInput {
    pub participant: Uuid,
    pub msg: ControllerMsg,
    pub received_at: u64,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<ParticipantInput>,
    pub outbound_tx: broadcast::Sender<Arc<Outbound>>,
    pub participant_count: Arc<AtomicUsize>,
    pub max_participants: usize,
}

impl SessionHandle {
    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }

    pub fn has_room(&self) -> bool {
        self.participant_count() < self.max_participants
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.outbound_tx.subscribe()
    }
}

/// Public view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub participants: usize,
    pub max_participants: usize,
}

/// Registry of all running sessions
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_participants(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.value().participant_count())
            .sum()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|s| SessionSummary {
                id: s.value().id,
                participants: s.value().participant_count(),
                max_participants: s.value().max_participants,
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Find a session with a free slot
    pub fn find_available(&self) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|s| s.value().has_room())
            .map(|s| s.value().clone())
    }

    /// Start a session on the runtime; it unregisters itself when it ends
    pub fn spawn_session(self: &Arc<Self>, config: &Config) -> SessionHandle {
        let (session, handle) = GameSession::new(Uuid::new_v4(), config, StaticWorld::new(), rand::random());
        self.insert(handle.clone());

        let registry = Arc::clone(self);
        let id = handle.id;
        tokio::spawn(async move {
            session.run().await;
            registry.remove(&id);
        });
        handle
    }

    /// Session for a new connection: an open one, or a fresh one
    pub fn join_or_create(self: &Arc<Self>, config: &Config) -> SessionHandle {
        match self.find_available() {
            Some(handle) => handle,
            None => self.spawn_session(config),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One authoritative session: a context, its router and the channels around it
pub struct GameSession<W = StaticWorld> {
    id: Uuid,
    ctx: AuthorityContext<W>,
    router: MessageRouter,
    input_rx: mpsc::Receiver<ParticipantInput>,
    outbound_tx: broadcast::Sender<Arc<Outbound>>,
    snapshot_builder: SnapshotBuilder,
    participant_count: Arc<AtomicUsize>,
    tick_rate: u32,
    ever_joined: bool,
}

impl<W: WorldGeometry> GameSession<W> {
    pub fn new(id: Uuid, config: &Config, world: W, seed: u64) -> (Self, SessionHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CHANNEL_SIZE);
        let participant_count = Arc::new(AtomicUsize::new(0));

        let handle = SessionHandle {
            id,
            input_tx,
            outbound_tx: outbound_tx.clone(),
            participant_count: participant_count.clone(),
            max_participants: config.max_participants,
        };

        let tick_rate = config.tick_rate.max(1);
        let session = Self {
            id,
            ctx: AuthorityContext::new(config.engine.clone(), FireHooks::default(), world, seed),
            router: MessageRouter::new(id, config.max_participants),
            input_rx,
            outbound_tx,
            snapshot_builder: SnapshotBuilder::new((tick_rate / SNAPSHOT_TPS).max(1)),
            participant_count,
            tick_rate,
            ever_joined: false,
        };

        (session, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &AuthorityContext<W> {
        &self.ctx
    }

    /// Run the authoritative tick loop until everyone has left
    pub async fn run(mut self) {
        info!(session_id = %self.id, tick_rate = self.tick_rate, "Session started");

        let clock = SessionClock::new();
        let tick_duration = Duration::from_millis(tick_millis(self.tick_rate));
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_tick: TimeMs = 0;

        loop {
            tick_interval.tick().await;

            let now = clock.now_ms();
            let dt = now.saturating_sub(last_tick);
            last_tick = now;
            self.step(now, dt);

            if self.ever_joined && self.ctx.participant_count() == 0 {
                info!(session_id = %self.id, "All participants left, ending session");
                break;
            }
        }

        info!(
            session_id = %self.id,
            ticks = self.ctx.current_tick(),
            snapshots = self.snapshot_builder.total_snapshots(),
            hit_mismatches = self.ctx.hit_mismatches(),
            "Session ended"
        );
    }

    /// Inputs, one simulation tick, then publish everything produced
    pub fn step(&mut self, now: TimeMs, dt_ms: TimeMs) {
        self.process_inputs(now);
        self.ctx.tick(now, dt_ms);

        if self.snapshot_builder.should_send() && self.ctx.participant_count() > 0 {
            let snapshot = self
                .snapshot_builder
                .build(self.ctx.current_tick(), self.ctx.weapon_snapshots(None));
            self.ctx.send(Recipient::All, snapshot);
        }

        self.publish();
    }

    /// Process all pending inputs from participants
    fn process_inputs(&mut self, now: TimeMs) {
        while let Ok(input) = self.input_rx.try_recv() {
            let joining = matches!(input.msg, ControllerMsg::Hello { .. });
            match self.router.route(&mut self.ctx, input.participant, input.msg, now) {
                RouteEffect::Joined => {
                    self.ever_joined = true;
                    self.snapshot_builder.force_next();
                    info!(
                        session_id = %self.id,
                        participant_id = %input.participant,
                        participant_count = self.ctx.participant_count(),
                        "Participant joined session"
                    );
                }
                RouteEffect::Left => {
                    info!(
                        session_id = %self.id,
                        participant_id = %input.participant,
                        "Participant left session"
                    );
                }
                RouteEffect::Continue if joining => {
                    debug!(participant_id = %input.participant, "hello refused");
                }
                RouteEffect::Continue => {}
            }
        }
        self.participant_count
            .store(self.ctx.participant_count(), Ordering::Relaxed);
    }

    fn publish(&mut self) {
        for outbound in self.ctx.take_outbound() {
            // No receivers is fine: nobody is connected yet
            let _ = self.outbound_tx.send(Arc::new(outbound));
        }
    }
}
