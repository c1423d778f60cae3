//! The session registry.
//!
//! Sessions and device links refer to each other by id only. The
//! orchestrator owns the session handles; [`DeviceLinks`] owns the links.

use crate::collaborators::{EntitlementSource, ProfileSource, StaticEntitlements, StaticProfiles};
use crate::config::{InvalidConfig, PipelineConfig, QuotaLimits};
use crate::error::SessionError;
use crate::ingress::AudioFrame;
use crate::pipeline::Engines;
use crate::session::{spawn_session, Command, SessionSetup, SessionShared, SessionSnapshot};
use crate::store::{MemoryTurnStore, TurnStore};
use holo_link::{DeviceLinks, LinkConfig};
use holo_types::{DeviceId, LinkId, ParticipantId, SessionId, SessionState, Turn, SYSTEM_PARTICIPANT};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Closed sessions remembered so late callers get `SessionClosed`.
const CLOSED_RETAINED: usize = 1024;

/// Upper bound on waiting for a session task to wind down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The external services a session consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub entitlements: Arc<dyn EntitlementSource>,
    pub profiles: Arc<dyn ProfileSource>,
    pub store: Arc<dyn TurnStore>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            entitlements: Arc::new(StaticEntitlements::default()),
            profiles: Arc::new(StaticProfiles::default()),
            store: Arc::new(MemoryTurnStore::default()),
        }
    }
}

/// Returned by [`Orchestrator::attach_device`]; the device presents both
/// when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAttachment {
    pub link_id: LinkId,
    pub token: String,
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    activity: Arc<AtomicU64>,
    owner: ParticipantId,
    participants: HashSet<ParticipantId>,
    limits: QuotaLimits,
    task: JoinHandle<()>,
}

/// Process-wide registry of live sessions.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    engines: Engines,
    collaborators: Collaborators,
    links: DeviceLinks,
    sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
    closed: Arc<RwLock<VecDeque<SessionSnapshot>>>,
    clock: Instant,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        engines: Engines,
        collaborators: Collaborators,
    ) -> Result<Self, InvalidConfig> {
        config.validate()?;
        let links = DeviceLinks::new(LinkConfig {
            unacked_capacity: config.link.unacked_capacity,
            grace_period: config.grace_period(),
        });
        Ok(Self {
            config: Arc::new(config),
            engines,
            collaborators,
            links,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(RwLock::new(VecDeque::new())),
            clock: Instant::now(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The device link registry shared by every session.
    pub fn links(&self) -> &DeviceLinks {
        &self.links
    }

    /// Opens a session between `participants` and a companion.
    ///
    /// The first participant owns the session; their tier decides the quota.
    pub async fn start_session(
        &self,
        companion_id: &str,
        participants: Vec<ParticipantId>,
    ) -> Result<SessionSnapshot, SessionError> {
        if companion_id.is_empty() {
            return Err(SessionError::InvalidRequest("companion_id is empty".into()));
        }
        let Some(owner) = participants.first().cloned() else {
            return Err(SessionError::InvalidRequest("no participants".into()));
        };
        let mut seen = HashSet::new();
        for participant in &participants {
            if participant.is_empty() || participant == SYSTEM_PARTICIPANT {
                return Err(SessionError::InvalidRequest(format!(
                    "invalid participant id: {participant:?}"
                )));
            }
            if !seen.insert(participant.clone()) {
                return Err(SessionError::InvalidRequest(format!(
                    "duplicate participant: {participant}"
                )));
            }
        }

        let tier = self.collaborators.entitlements.tier(&owner).await;
        let limits = self.config.quota(tier);
        let profile = self.collaborators.profiles.profile(companion_id).await;
        let session_id = Uuid::new_v4();

        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let open = sessions.values().filter(|h| h.owner == owner).count();
            if open >= limits.max_concurrent_sessions {
                tracing::warn!(owner = %owner, tier = %tier, open, "concurrent session quota reached");
                return Err(SessionError::QuotaExceeded {
                    tier,
                    limit: format!("{} concurrent sessions", limits.max_concurrent_sessions),
                });
            }
            let spawned = spawn_session(
                SessionSetup {
                    id: session_id,
                    owner: owner.clone(),
                    tier,
                    participants: participants.clone(),
                    profile,
                    limits,
                },
                SessionShared {
                    config: self.config.clone(),
                    engines: self.engines.clone(),
                    links: self.links.clone(),
                    store: self.collaborators.store.clone(),
                    clock: self.clock,
                },
            );
            let snapshot = spawned.snapshot.borrow().clone();
            sessions.insert(
                session_id,
                SessionHandle {
                    commands: spawned.commands,
                    snapshot: spawned.snapshot,
                    activity: spawned.activity,
                    owner,
                    participants: seen,
                    limits,
                    task: spawned.task,
                },
            );
            snapshot
        };

        if let Err(err) = self
            .collaborators
            .store
            .session_started(session_id, companion_id, &participants)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %err, "failed to record session start");
        }
        Ok(snapshot)
    }

    async fn missing(&self, session_id: SessionId) -> SessionError {
        if self
            .closed
            .read()
            .await
            .iter()
            .any(|s| s.session_id == session_id)
        {
            SessionError::SessionClosed(session_id)
        } else {
            SessionError::SessionNotFound(session_id)
        }
    }

    /// Resolves the command queue of an open session after `check` passes.
    async fn route<F>(&self, session_id: SessionId, check: F) -> Result<mpsc::Sender<Command>, SessionError>
    where
        F: FnOnce(&SessionHandle) -> Result<(), SessionError>,
    {
        let sessions = self.sessions.read().await;
        match sessions.get(&session_id) {
            Some(handle) => {
                if handle.snapshot.borrow().state == SessionState::Closed {
                    return Err(SessionError::SessionClosed(session_id));
                }
                check(handle)?;
                Ok(handle.commands.clone())
            }
            None => {
                drop(sessions);
                Err(self.missing(session_id).await)
            }
        }
    }

    async fn deliver(
        &self,
        session_id: SessionId,
        commands: mpsc::Sender<Command>,
        command: Command,
    ) -> Result<(), SessionError> {
        commands
            .send(command)
            .await
            .map_err(|_| SessionError::SessionClosed(session_id))
    }

    /// Checks that another turn may start; no adapter is invoked otherwise.
    fn turn_quota(handle: &SessionHandle) -> Result<(), SessionError> {
        let snapshot = handle.snapshot.borrow();
        if snapshot.turns.started >= handle.limits.max_turns_per_session {
            return Err(SessionError::QuotaExceeded {
                tier: snapshot.tier,
                limit: format!("{} turns per session", handle.limits.max_turns_per_session),
            });
        }
        Ok(())
    }

    /// Feeds one captured audio frame from `participant_id`.
    pub async fn submit_audio_frame(
        &self,
        session_id: SessionId,
        participant_id: &str,
        captured_at_ms: u64,
        pcm: Vec<u8>,
    ) -> Result<(), SessionError> {
        let commands = self
            .route(session_id, |handle| {
                if !handle.participants.contains(participant_id) {
                    return Err(SessionError::UnknownParticipant(participant_id.to_string()));
                }
                Self::turn_quota(handle)
            })
            .await?;
        let frame = AudioFrame {
            participant_id: participant_id.to_string(),
            captured_at_ms,
            pcm,
        };
        self.deliver(session_id, commands, Command::Audio(frame)).await
    }

    /// Signals that a participant's audio stream closed; any open utterance
    /// is finalized.
    pub async fn end_audio_stream(
        &self,
        session_id: SessionId,
        participant_id: &str,
    ) -> Result<(), SessionError> {
        let commands = self.route(session_id, |_| Ok(())).await?;
        self.deliver(
            session_id,
            commands,
            Command::EndStream(participant_id.to_string()),
        )
        .await
    }

    /// Submits typed text, or a system prompt when `participant_id` is
    /// [`SYSTEM_PARTICIPANT`], as an already-final utterance.
    pub async fn submit_text(
        &self,
        session_id: SessionId,
        participant_id: &str,
        text: &str,
    ) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidRequest("text is empty".into()));
        }
        let commands = self
            .route(session_id, |handle| {
                if participant_id != SYSTEM_PARTICIPANT
                    && !handle.participants.contains(participant_id)
                {
                    return Err(SessionError::UnknownParticipant(participant_id.to_string()));
                }
                Self::turn_quota(handle)
            })
            .await?;
        self.deliver(
            session_id,
            commands,
            Command::Text {
                participant: participant_id.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn heartbeat(&self, session_id: SessionId) -> Result<(), SessionError> {
        let commands = self.route(session_id, |_| Ok(())).await?;
        self.deliver(session_id, commands, Command::Heartbeat).await
    }

    /// Creates a device link for `device_id` and binds it to the session,
    /// replacing any link bound before.
    pub async fn attach_device(
        &self,
        session_id: SessionId,
        device_id: impl Into<DeviceId>,
    ) -> Result<DeviceAttachment, SessionError> {
        let commands = self.route(session_id, |_| Ok(())).await?;
        let (link_id, token) = self.links.attach(device_id, Some(session_id)).await;
        if let Err(err) = self
            .deliver(session_id, commands, Command::AttachLink(link_id))
            .await
        {
            let _ = self.links.close(link_id).await;
            return Err(err);
        }
        Ok(DeviceAttachment { link_id, token })
    }

    /// Ends a session and releases everything it owns.
    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionSnapshot, SessionError> {
        let handle = self.sessions.write().await.remove(&session_id);
        let Some(handle) = handle else {
            return Err(self.missing(session_id).await);
        };
        let (done_tx, done_rx) = oneshot::channel();
        let sent = handle.commands.send(Command::Close(done_tx)).await.is_ok();
        if sent && tokio::time::timeout(CLOSE_TIMEOUT, done_rx).await.is_err() {
            tracing::warn!(session_id = %session_id, "session did not close in time, aborting");
        }
        handle.task.abort();
        let snapshot = handle.snapshot.borrow().clone();

        let mut closed = self.closed.write().await;
        closed.push_back(snapshot.clone());
        while closed.len() > CLOSED_RETAINED {
            closed.pop_front();
        }
        Ok(snapshot)
    }

    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, SessionError> {
        if let Some(handle) = self.sessions.read().await.get(&session_id) {
            return Ok(handle.snapshot.borrow().clone());
        }
        self.closed
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == session_id)
            .cloned()
            .ok_or(SessionError::SessionNotFound(session_id))
    }

    /// Live snapshots of a session, updated on every change.
    pub async fn subscribe(
        &self,
        session_id: SessionId,
    ) -> Result<watch::Receiver<SessionSnapshot>, SessionError> {
        let sessions = self.sessions.read().await;
        if let Some(handle) = sessions.get(&session_id) {
            return Ok(handle.snapshot.clone());
        }
        drop(sessions);
        Err(self.missing(session_id).await)
    }

    /// Snapshots of all open sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = self
            .sessions
            .read()
            .await
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect::<Vec<_>>();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Number of open sessions owned by `owner`.
    pub async fn active_sessions_for(&self, owner: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| h.owner == owner)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Closes sessions with no input for longer than the idle timeout.
    pub async fn sweep_idle(&self) -> Vec<SessionId> {
        let now_ms = self.clock.elapsed().as_millis() as u64;
        let timeout = self.config.session.idle_timeout_ms;
        let expired = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, h)| now_ms.saturating_sub(h.activity.load(Ordering::Relaxed)) > timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        let mut closed = Vec::with_capacity(expired.len());
        for session_id in expired {
            tracing::info!(session_id = %session_id, "closing idle session");
            if self.end_session(session_id).await.is_ok() {
                closed.push(session_id);
            }
        }
        closed
    }

    /// Closes every open session.
    pub async fn shutdown(&self) {
        let ids = self.sessions.read().await.keys().copied().collect::<Vec<_>>();
        for session_id in ids {
            let _ = self.end_session(session_id).await;
        }
    }

    pub async fn list_turns(&self, session_id: SessionId) -> Result<Vec<Turn>, SessionError> {
        self.collaborators.store.list_turns(session_id).await
    }

    pub async fn export_session(&self, session_id: SessionId) -> Result<serde_json::Value, SessionError> {
        self.collaborators.store.export_session(session_id).await
    }

    pub async fn delete_turns(&self, session_id: SessionId) -> Result<usize, SessionError> {
        self.collaborators.store.delete_turns(session_id).await
    }
}
