use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::protocol::{
    ChatSender, EndReason, QueueEntry, ServerMessage, SessionMode, VoiceInfo,
};
use crate::queue::WaitingQueue;
use crate::registry::{ParticipantStatus, Registry};
use crate::timers::{TimerKind, TimerTable};
use crate::voice::VoiceClient;

/// Tokens for both sides of a voice session, kept so reconnects and the
/// operator's re-join can be served without another provider round-trip.
pub struct VoiceSession {
    pub room_url: String,
    pub guest_token: String,
    pub mama_token: String,
}

/// The singleton active-session record. Created only by the accept
/// transition, cleared only by the end transition.
pub struct ActiveSession {
    pub durable_id: String,
    pub handle: String,
    pub room_tag: Option<String>,
    pub started_at: i64,
    pub max_ms: u64,
    epoch: u64,
    mood: Option<String>,
    mode: SessionMode,
    timers: TimerTable,
    voice: Option<VoiceSession>,
    voice_error: Option<String>,
}

impl ActiveSession {
    fn started_message(&self, for_mama: bool, resumed: bool) -> ServerMessage {
        let voice_info = self.voice.as_ref().map(|v| VoiceInfo {
            room_url: v.room_url.clone(),
            token: if for_mama {
                v.mama_token.clone()
            } else {
                v.guest_token.clone()
            },
        });
        ServerMessage::SessionStarted {
            handle: self.handle.clone(),
            mood: self.mood.clone(),
            mode: self.mode,
            room_tag: self.room_tag.clone(),
            started_at: self.started_at,
            max_ms: self.max_ms,
            resumed,
            voice_info,
            voice_error: self.voice_error.clone(),
        }
    }
}

struct OperatorLink {
    handle: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl OperatorLink {
    fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }
}

/// All mutable orchestration state lives here, behind one mutex. Every
/// transition acquires the lock, mutates without awaiting, and releases it,
/// which reproduces the run-to-completion model the lifecycle rules assume.
struct OrchestratorState {
    registry: Registry,
    queue: WaitingQueue,
    operator: Option<OperatorLink>,
    session: Option<ActiveSession>,
    next_epoch: u64,
}

/// The session lifecycle controller: owns the queue, the single active
/// session slot, identity reconciliation across reconnects, and the timers
/// that drive automatic transitions.
pub struct Orchestrator {
    config: Config,
    voice: Option<VoiceClient>,
    state: Mutex<OrchestratorState>,
    // Handed to timer tasks so they can re-enter the audited entry point.
    weak_self: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(config: Config, voice: Option<VoiceClient>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            voice,
            state: Mutex::new(OrchestratorState {
                registry: Registry::default(),
                queue: WaitingQueue::default(),
                operator: None,
                session: None,
                next_epoch: 0,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Spawn a timer that re-enters `timer_fired` at `deadline`, carrying
    /// the session epoch that makes late firings no-ops.
    fn spawn_timer(
        &self,
        timers: &mut TimerTable,
        kind: TimerKind,
        deadline: Instant,
        epoch: u64,
    ) {
        let weak = self.weak_self.clone();
        timers.schedule(kind, deadline, async move {
            if let Some(orch) = weak.upgrade() {
                orch.timer_fired(epoch, kind).await;
            }
        });
    }

    /// An operator connection appeared; the latest one wins. It immediately
    /// gets the queue snapshot and, when a session is running, its
    /// parameters flagged as a resumption.
    pub async fn operator_attached(&self, handle: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        info!(handle, "mama attached");
        state.operator = Some(OperatorLink {
            handle: handle.to_string(),
            tx,
        });
        broadcast_queue(state);

        // Self-heal: a session whose occupant record vanished with no grace
        // window protecting it cannot recover; force the end transition
        // instead of resending a dead session.
        let stale = state
            .session
            .as_ref()
            .map(|session| {
                let protected = session.timers.is_set(TimerKind::DisconnectGrace)
                    || session.timers.is_set(TimerKind::PayingGrace);
                !protected && !state.registry.contains(occupant_handle(state))
            })
            .unwrap_or(false);
        if stale {
            warn!("active session has no occupant record; forcing end");
            end_locked(state, EndReason::DisconnectTimeout);
            return;
        }

        if let Some(session) = &state.session {
            let message = session.started_message(true, true);
            notify_operator(state, message);
        }
    }

    /// A visitor connection appeared.
    pub async fn visitor_connected(&self, handle: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        let mut guard = self.state.lock().await;
        guard.registry.insert(handle, tx);
    }

    /// Visitor declares intent: bind identity, then either resume the
    /// session this durable id already occupies or join the queue.
    pub async fn register_intent(
        &self,
        handle: &str,
        durable_id: &str,
        mood: Option<String>,
        mode: SessionMode,
        room_tag: Option<String>,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.registry.contains(handle) {
            return;
        }
        state.registry.bind(handle, durable_id);

        if let Some(session) = &state.session {
            if session.durable_id == durable_id {
                if session.handle != handle {
                    resume_locked(state, handle);
                }
                // Already the active occupant: never re-queued.
                return;
            }
        }

        let assigned_tag;
        {
            let participant = state
                .registry
                .get_mut(handle)
                .expect("participant checked above");
            participant.durable_id = Some(durable_id.to_string());
            participant.mood = mood;
            participant.mode = mode;
            if let Some(tag) = room_tag {
                participant.room_tag = Some(tag);
            } else if participant.room_tag.is_none() {
                participant.room_tag = Some(generate_room_tag());
            }
            assigned_tag = participant.room_tag.clone();
            participant.status = ParticipantStatus::Waiting;
            participant.joined_at = Utc::now().timestamp_millis();
        }
        state.queue.enqueue(handle);
        info!(handle, durable_id, room_tag = ?assigned_tag, "guest registered");

        let position = state.queue.position_of(handle);
        let size = state.queue.len();
        state
            .registry
            .send_to(handle, ServerMessage::QueuePosition { position, size });
        broadcast_queue(state);
    }

    /// Visitor attaches to a room tag; resumes the active session when the
    /// tag matches it.
    pub async fn join_room(&self, handle: &str, room_tag: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(participant) = state.registry.get_mut(handle) {
            participant.room_tag = Some(room_tag.to_string());
        } else {
            return;
        }
        let matches = state
            .session
            .as_ref()
            .map(|s| s.room_tag.as_deref() == Some(room_tag) && s.handle != handle)
            .unwrap_or(false);
        if matches {
            resume_locked(state, handle);
        }
    }

    /// Visitor leaves: dequeue, or end the active session. A paying
    /// occupant gets the long grace window instead of an immediate end so
    /// an in-flight payment is not interrupted.
    pub async fn leave(&self, handle: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.registry.contains(handle) {
            return;
        }
        state.queue.remove(handle);

        if is_active_occupant(state, handle) {
            let paying = state
                .registry
                .get(handle)
                .map(|p| p.is_paying)
                .unwrap_or(false);
            if paying {
                self.schedule_grace(state, TimerKind::PayingGrace, self.config.paying_grace_ms);
                broadcast_queue(state);
            } else {
                end_locked(state, EndReason::GuestLeft);
                state.registry.remove(handle);
                state.registry.unbind(handle);
            }
            return;
        }

        // An explicit leave is a permanent departure: drop the identity
        // edges too, unlike a transport disconnect.
        state.registry.remove(handle);
        state.registry.unbind(handle);
        broadcast_queue(state);
    }

    /// Chat relay from the active occupant to the operator. Silently
    /// dropped for anyone else.
    pub async fn guest_message(&self, handle: &str, text: String) {
        let guard = self.state.lock().await;
        if is_active_occupant(&guard, handle) {
            if let Some(op) = &guard.operator {
                op.send(ServerMessage::ChatMessage {
                    from: ChatSender::Guest,
                    text,
                });
            }
        }
    }

    /// Chat relay from the operator to the active occupant.
    pub async fn operator_message(&self, text: String) {
        let guard = self.state.lock().await;
        if let Some(session) = &guard.session {
            guard.registry.send_to(
                &session.handle,
                ServerMessage::ChatMessage {
                    from: ChatSender::Mama,
                    text,
                },
            );
        }
    }

    /// The active occupant announced a tip: mark them paying and tell the
    /// operator. Session state is otherwise unchanged.
    pub async fn tip_intent(&self, handle: &str, amount: Option<u64>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !is_active_occupant(state, handle) {
            return;
        }
        if let Some(participant) = state.registry.get_mut(handle) {
            participant.is_paying = true;
        }
        let at = Utc::now().timestamp_millis();
        notify_operator(state, ServerMessage::TipIntent { amount, at });
    }

    /// Accept transition. Re-resolves the named handle through the durable
    /// id to the latest live connection, ends any running session with
    /// reason `switched`, and starts the new one.
    ///
    /// Voice tokens are requested between validation and mutation, outside
    /// the lock; the target is re-resolved afterwards since it may have
    /// vanished mid-flight. Token failure degrades the session rather than
    /// aborting the transition.
    pub async fn accept(&self, requested_handle: &str) {
        let need_voice = {
            let guard = self.state.lock().await;
            match resolve_latest(&guard, requested_handle) {
                Some(handle) => {
                    guard
                        .registry
                        .get(&handle)
                        .map(|p| p.mode == SessionMode::Voice)
                        .unwrap_or(false)
                }
                None => {
                    drop(guard);
                    self.reject_stale_accept().await;
                    return;
                }
            }
        };

        let mut voice_session = None;
        let mut voice_error = None;
        if need_voice {
            match &self.voice {
                Some(client) => {
                    let guest = client.issue_token("guest", false).await;
                    let mama = client.issue_token("mama", true).await;
                    match (guest, mama) {
                        (Ok(guest), Ok(mama)) => {
                            voice_session = Some(VoiceSession {
                                room_url: guest.room_url,
                                guest_token: guest.token,
                                mama_token: mama.token,
                            });
                        }
                        (Err(err), _) | (_, Err(err)) => {
                            warn!(error = %err, "voice token issuance failed");
                            voice_error = Some(err.to_string());
                        }
                    }
                }
                None => {
                    voice_error = Some("voice provider not configured".to_string());
                }
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(handle) = resolve_latest(state, requested_handle) else {
            drop(guard);
            self.reject_stale_accept().await;
            return;
        };
        if state.session.is_some() {
            end_locked(state, EndReason::Switched);
        }
        self.start_session_locked(state, &handle, voice_session, voice_error);
    }

    /// End transition; a no-op when no session is active.
    pub async fn end_session(&self, reason: EndReason) {
        let mut guard = self.state.lock().await;
        end_locked(&mut guard, reason);
    }

    /// Transport-level disconnect. The active occupant gets a grace window
    /// (long when paying); everyone else is discarded immediately.
    pub async fn connection_closed(&self, handle: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state
            .operator
            .as_ref()
            .map(|op| op.handle == handle)
            .unwrap_or(false)
        {
            info!(handle, "mama detached");
            state.operator = None;
            return;
        }

        if !state.registry.contains(handle) {
            return;
        }
        state.queue.remove(handle);

        if is_active_occupant(state, handle) {
            let paying = state
                .registry
                .get(handle)
                .map(|p| p.is_paying)
                .unwrap_or(false);
            if paying {
                self.schedule_grace(state, TimerKind::PayingGrace, self.config.paying_grace_ms);
            } else {
                self.schedule_grace(
                    state,
                    TimerKind::DisconnectGrace,
                    self.config.disconnect_grace_ms,
                );
            }
            // The record survives for the duration of the grace window.
            return;
        }

        state.registry.remove(handle);
        broadcast_queue(state);
    }

    /// Single entry point for every timer callback. Late firings from a
    /// session that has already ended are no-ops thanks to the epoch stamp.
    pub async fn timer_fired(&self, epoch: u64, kind: TimerKind) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(session) = &state.session else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        match kind {
            TimerKind::Warning => {
                let target = occupant_handle(state).to_string();
                state.registry.send_to(&target, ServerMessage::SessionWarning);
                notify_operator(state, ServerMessage::SessionWarning);
            }
            TimerKind::Expiry => end_locked(state, EndReason::Timeout),
            TimerKind::DisconnectGrace => end_locked(state, EndReason::DisconnectTimeout),
            TimerKind::PayingGrace => end_locked(state, EndReason::PayingDisconnectTimeout),
        }
    }

    /// Asynchronous payment confirmation from the processor webhook. Clears
    /// the paying flag and broadcasts; never changes session state.
    pub async fn payment_confirmed(
        &self,
        handle: Option<&str>,
        room_tag: Option<&str>,
        amount: i64,
        checkout_id: &str,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // Metadata may carry a handle from before a reconnect.
        let effective = handle.map(|h| {
            state
                .registry
                .resolve(h)
                .and_then(|d| state.registry.latest_handle(d))
                .unwrap_or(h)
                .to_string()
        });
        if let Some(h) = &effective {
            if let Some(participant) = state.registry.get_mut(h) {
                participant.is_paying = false;
            }
        }

        let visitor_target = effective
            .filter(|h| state.registry.contains(h))
            .or_else(|| {
                state
                    .session
                    .as_ref()
                    .filter(|s| room_tag.is_some() && s.room_tag.as_deref() == room_tag)
                    .map(|s| s.handle.clone())
            });
        if let Some(target) = visitor_target {
            state.registry.send_to(
                &target,
                ServerMessage::SystemNotice {
                    text: format!("Tip received ({amount}) - thank you!"),
                },
            );
        }

        let at = Utc::now().timestamp_millis();
        notify_operator(
            state,
            ServerMessage::TipConfirmed {
                amount,
                checkout_id: checkout_id.to_string(),
                at,
            },
        );
        counter!("snack_counter_tips_confirmed_total", 1);
        info!(checkout_id, amount, "tip confirmed");
    }

    /// Operator re-requests the stored voice payload.
    pub async fn voice_join(&self) {
        let guard = self.state.lock().await;
        let message = match guard.session.as_ref().and_then(|s| s.voice.as_ref()) {
            Some(voice) => ServerMessage::VoiceJoinReady {
                room_url: voice.room_url.clone(),
                token: voice.mama_token.clone(),
                resumed: true,
            },
            None => ServerMessage::VoiceJoinFailed {
                message: "no voice session available".to_string(),
            },
        };
        if let Some(op) = &guard.operator {
            op.send(message);
        }
    }

    async fn reject_stale_accept(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        notify_operator(
            state,
            ServerMessage::SystemNotice {
                text: "That guest has already left; refreshing the queue.".to_string(),
            },
        );
        broadcast_queue(state);
    }

    fn start_session_locked(
        &self,
        state: &mut OrchestratorState,
        handle: &str,
        voice: Option<VoiceSession>,
        voice_error: Option<String>,
    ) {
        state.queue.remove(handle);

        let (durable_id, mood, mode, room_tag) = {
            let Some(participant) = state.registry.get_mut(handle) else {
                return;
            };
            participant.status = ParticipantStatus::Active;
            (
                participant.durable_id.clone().unwrap_or_default(),
                participant.mood.clone(),
                participant.mode,
                participant.room_tag.clone(),
            )
        };

        let epoch = state.next_epoch;
        state.next_epoch += 1;
        let started = Instant::now();
        let max_ms = self.config.session_max_ms;

        let mut session = ActiveSession {
            durable_id,
            handle: handle.to_string(),
            room_tag,
            started_at: Utc::now().timestamp_millis(),
            max_ms,
            epoch,
            mood,
            mode,
            timers: TimerTable::default(),
            voice,
            voice_error,
        };

        self.spawn_timer(
            &mut session.timers,
            TimerKind::Expiry,
            started + Duration::from_millis(max_ms),
            epoch,
        );
        let warning_ms = max_ms.saturating_sub(self.config.warning_before_ms).max(1000);
        self.spawn_timer(
            &mut session.timers,
            TimerKind::Warning,
            started + Duration::from_millis(warning_ms),
            epoch,
        );

        info!(handle, epoch, mode = ?session.mode, "session started");
        counter!("snack_counter_sessions_started_total", 1);

        state
            .registry
            .send_to(handle, session.started_message(false, false));
        let mama_message = session.started_message(true, false);
        state.session = Some(session);
        notify_operator(state, mama_message);
        broadcast_queue(state);
    }

    fn schedule_grace(&self, state: &mut OrchestratorState, kind: TimerKind, delay_ms: u64) {
        let Some(session) = &mut state.session else {
            return;
        };
        if session.timers.is_set(kind) {
            return;
        }
        let epoch = session.epoch;
        self.spawn_timer(
            &mut session.timers,
            kind,
            Instant::now() + Duration::from_millis(delay_ms),
            epoch,
        );
        info!(kind = ?kind, delay_ms, "grace window opened");
    }
}

/// Follow a possibly stale handle to the latest live connection for its
/// durable id. None means the visitor is gone for good.
fn resolve_latest(state: &OrchestratorState, handle: &str) -> Option<String> {
    let durable_id = state.registry.resolve(handle)?;
    let latest = state.registry.latest_handle(durable_id)?;
    state.registry.contains(latest).then(|| latest.to_string())
}

/// Whether this handle speaks for the active occupant: either it is the
/// session's own handle, or it is the latest handle of the session's
/// durable id.
fn is_active_occupant(state: &OrchestratorState, handle: &str) -> bool {
    let Some(session) = &state.session else {
        return false;
    };
    if session.handle == handle {
        return true;
    }
    state.registry.resolve(handle) == Some(session.durable_id.as_str())
        && state.registry.latest_handle(&session.durable_id) == Some(handle)
}

/// Best current handle for the occupant, preferring the latest binding of
/// the session's durable id over the recorded handle.
fn occupant_handle(state: &OrchestratorState) -> &str {
    let session = state.session.as_ref().expect("active session");
    state
        .registry
        .latest_handle(&session.durable_id)
        .unwrap_or(session.handle.as_str())
}

/// Resume-on-reconnect: swap the session onto the new handle, carry the
/// old record's flags over, cancel the grace pair, and re-notify both
/// sides. The session budget is never extended.
fn resume_locked(state: &mut OrchestratorState, new_handle: &str) {
    let Some(session) = &mut state.session else {
        return;
    };
    let old_handle = std::mem::replace(&mut session.handle, new_handle.to_string());
    session.timers.cancel_grace();
    let durable_id = session.durable_id.clone();
    let mood = session.mood.clone();
    let mode = session.mode;
    let room_tag = session.room_tag.clone();

    let carried_paying = if old_handle != new_handle {
        state
            .registry
            .remove(&old_handle)
            .map(|p| p.is_paying)
            .unwrap_or(false)
    } else {
        false
    };
    if !durable_id.is_empty() {
        state.registry.bind(new_handle, &durable_id);
    }
    if let Some(participant) = state.registry.get_mut(new_handle) {
        participant.status = ParticipantStatus::Active;
        participant.is_paying = participant.is_paying || carried_paying;
        participant.durable_id = Some(durable_id);
        if participant.mood.is_none() {
            participant.mood = mood;
        }
        participant.mode = mode;
        if participant.room_tag.is_none() {
            participant.room_tag = room_tag;
        }
    }
    state.queue.remove(new_handle);

    info!(old = %old_handle, new = %new_handle, "guest resumed session");
    let message = state
        .session
        .as_ref()
        .expect("session checked above")
        .started_message(false, true);
    state.registry.send_to(new_handle, message);
    notify_operator(
        state,
        ServerMessage::SystemNotice {
            text: "Guest resumed the session.".to_string(),
        },
    );
}

/// End transition: cancel every timer, mark the occupant finished, notify
/// both sides, clear the slot, refresh the queue. Idempotent.
fn end_locked(state: &mut OrchestratorState, reason: EndReason) {
    let Some(mut session) = state.session.take() else {
        return;
    };
    session.timers.cancel_all();

    let target = state
        .registry
        .latest_handle(&session.durable_id)
        .unwrap_or(session.handle.as_str())
        .to_string();
    if let Some(participant) = state.registry.get_mut(&target) {
        participant.status = ParticipantStatus::Finished;
    }

    info!(handle = %target, reason = ?reason, "session ended");
    counter!("snack_counter_sessions_ended_total", 1);

    state
        .registry
        .send_to(&target, ServerMessage::SessionEnded { reason });
    notify_operator(state, ServerMessage::SessionEnded { reason });

    // A grace expiry means the occupant's transport is known dead; the
    // record is no longer protected.
    if matches!(
        reason,
        EndReason::DisconnectTimeout | EndReason::PayingDisconnectTimeout
    ) {
        state.registry.remove(&target);
        state.registry.unbind(&target);
    }

    broadcast_queue(state);
}

fn notify_operator(state: &OrchestratorState, message: ServerMessage) {
    if let Some(op) = &state.operator {
        op.send(message);
    }
}

/// Refresh the operator's queue snapshot, pruned of vanished handles. The
/// active occupant is excluded defensively even though the transitions
/// never leave it queued.
fn broadcast_queue(state: &mut OrchestratorState) {
    let OrchestratorState {
        registry,
        queue,
        operator,
        session,
        ..
    } = state;
    let active = session.as_ref().map(|s| s.handle.clone());
    let snapshot = queue.snapshot(|handle| {
        if active.as_deref() == Some(handle) {
            return None;
        }
        registry
            .get(handle)
            .filter(|p| p.status == ParticipantStatus::Waiting)
            .map(|p| QueueEntry {
                handle: handle.to_string(),
                mood: p.mood.clone(),
                mode: p.mode,
                joined_at: p.joined_at,
            })
    });
    if let Some(op) = operator {
        op.send(ServerMessage::QueueUpdate { queue: snapshot });
    }
}

fn generate_room_tag() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(10)
        .collect();
    format!("room_{suffix}")
}
