//! The device link registry.

use crate::error::LinkError;
use crate::protocol::OutboundFrame;
use holo_types::{DeviceId, DevicePayload, LinkId, SessionId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Link tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Maximum frames awaiting acknowledgement. `send` waits when full.
    pub unacked_capacity: usize,
    /// How long a disconnected link keeps its pending frames.
    pub grace_period: Duration,
}

/// Something that happened on a link, broadcast to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transport connected; delivery resumes after `resumed_from`.
    Connected { resumed_from: u64 },
    /// The device acknowledged everything up to `seq`.
    Acked { seq: u64 },
    /// The transport dropped. Pending frames are kept.
    Disconnected,
    /// The grace period lapsed; `dropped` pending frames were discarded.
    GraceExpired { dropped: usize },
    /// The link was closed for good.
    Closed,
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LinkStatus {
    pub link_id: LinkId,
    pub device_id: DeviceId,
    pub session_id: Option<SessionId>,
    pub connected: bool,
    /// The grace period lapsed and the device has not come back.
    pub unreachable: bool,
    pub last_acked: u64,
    pub latest_seq: u64,
    pub unacked: usize,
}

/// A live transport connection to a link.
///
/// The transport forwards `frames` to the device until the channel closes,
/// which happens when the link is closed or a newer connection supersedes
/// this one.
#[derive(Debug)]
pub struct LinkConnection {
    pub link_id: LinkId,
    pub connection_id: Uuid,
    pub frames: mpsc::Receiver<OutboundFrame>,
}

#[derive(Debug)]
struct LinkState {
    device_id: DeviceId,
    session_id: Option<SessionId>,
    token: String,
    next_seq: u64,
    last_acked: u64,
    unacked: VecDeque<OutboundFrame>,
    sink: Option<(Uuid, mpsc::Sender<OutboundFrame>)>,
    /// Bumped on every connect and disconnect so stale grace timers can tell
    /// they were overtaken.
    epoch: u64,
    disconnected_at: Option<Instant>,
    /// Set once the grace period lapsed; cleared by the next connection or
    /// the next buffered frame.
    unreachable: bool,
    /// The device's own ack when a grace period first dropped its frames.
    /// Cleared once the device connects again.
    acked_before_expiry: Option<u64>,
    closed: bool,
}

impl LinkState {
    fn latest(&self) -> u64 {
        self.next_seq - 1
    }
}

#[derive(Debug)]
struct LinkEntry {
    state: Mutex<LinkState>,
    space: Notify,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkEntry {
    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine; the session may not be listening yet.
        let _ = self.events.send(event);
    }
}

/// Registry of every device link on this node.
///
/// Links refer to their session by id only; the session orchestrator looks
/// them up here and never holds a link directly.
#[derive(Debug, Clone)]
pub struct DeviceLinks {
    links: Arc<RwLock<HashMap<LinkId, Arc<LinkEntry>>>>,
    config: LinkConfig,
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

impl DeviceLinks {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> LinkConfig {
        self.config
    }

    async fn entry(&self, link_id: LinkId) -> Result<Arc<LinkEntry>, LinkError> {
        self.links
            .read()
            .await
            .get(&link_id)
            .cloned()
            .ok_or(LinkError::LinkNotFound(link_id))
    }

    /// Creates a link for `device_id`, bound to `session_id`, and returns its
    /// id and reconnect token. The link starts disconnected; the grace period
    /// runs until the device first connects.
    pub async fn attach(
        &self,
        device_id: impl Into<DeviceId>,
        session_id: Option<SessionId>,
    ) -> (LinkId, String) {
        let link_id = Uuid::new_v4();
        let token = new_token();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let device_id = device_id.into();
        let entry = Arc::new(LinkEntry {
            state: Mutex::new(LinkState {
                device_id: device_id.clone(),
                session_id,
                token: token.clone(),
                next_seq: 1,
                last_acked: 0,
                unacked: VecDeque::with_capacity(self.config.unacked_capacity),
                sink: None,
                epoch: 0,
                disconnected_at: Some(Instant::now()),
                unreachable: false,
                acked_before_expiry: None,
                closed: false,
            }),
            space: Notify::new(),
            events,
        });
        self.links.write().await.insert(link_id, entry.clone());
        self.start_grace_timer(link_id, entry, 0);
        tracing::info!(link_id = %link_id, device_id = %device_id, "device link attached");
        (link_id, token)
    }

    /// Subscribes to the link's events.
    pub async fn subscribe(&self, link_id: LinkId) -> Result<broadcast::Receiver<LinkEvent>, LinkError> {
        Ok(self.entry(link_id).await?.events.subscribe())
    }

    /// The session a link is bound to.
    pub async fn session_of(&self, link_id: LinkId) -> Result<Option<SessionId>, LinkError> {
        Ok(self.entry(link_id).await?.state.lock().await.session_id)
    }

    pub async fn status(&self, link_id: LinkId) -> Result<LinkStatus, LinkError> {
        let entry = self.entry(link_id).await?;
        let state = entry.state.lock().await;
        Ok(LinkStatus {
            link_id,
            device_id: state.device_id.clone(),
            session_id: state.session_id,
            connected: state.sink.is_some(),
            unreachable: state.unreachable,
            last_acked: state.last_acked,
            latest_seq: state.latest(),
            unacked: state.unacked.len(),
        })
    }

    pub async fn is_connected(&self, link_id: LinkId) -> bool {
        match self.entry(link_id).await {
            Ok(entry) => entry.state.lock().await.sink.is_some(),
            Err(_) => false,
        }
    }

    /// Transport handshake. `last_acked` is the device's resume point; `None`
    /// resumes from the link's own record.
    ///
    /// Frames up to the resume point are treated as acknowledged and every
    /// later pending frame is replayed, in order, into the new connection.
    /// A previous connection is superseded.
    pub async fn connect(
        &self,
        link_id: LinkId,
        token: &str,
        last_acked: Option<u64>,
    ) -> Result<LinkConnection, LinkError> {
        let entry = self.entry(link_id).await?;
        let mut state = entry.state.lock().await;
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.token != token {
            tracing::warn!(link_id = %link_id, "device link connect with invalid token");
            return Err(LinkError::InvalidToken);
        }

        let mut resume_from = last_acked.unwrap_or(state.last_acked);
        // Frames dropped at grace expiry count as played, so a device that
        // resumes from its real ack skips them.
        if resume_from < state.last_acked
            && state
                .acked_before_expiry
                .is_some_and(|acked| resume_from >= acked)
        {
            tracing::debug!(
                link_id = %link_id,
                requested = resume_from,
                acked = state.last_acked,
                "resume point predates expired frames, skipping them"
            );
            resume_from = state.last_acked;
        }
        if resume_from < state.last_acked || resume_from > state.latest() {
            return Err(LinkError::InvalidResumePoint {
                requested: resume_from,
                acked: state.last_acked,
                latest: state.latest(),
            });
        }
        // Past the grace period the frames between the recorded ack and the
        // resume point are gone, which is exactly what the device says it has.
        let freed = drain_acked(&mut state, resume_from);

        // Channel content is always a subset of `unacked`, so this capacity
        // never refuses a frame.
        let (tx, rx) = mpsc::channel(self.config.unacked_capacity.max(1));
        for frame in &state.unacked {
            if tx.try_send(frame.clone()).is_err() {
                break;
            }
        }
        let replayed = state.unacked.len();
        let connection_id = Uuid::new_v4();
        let superseded = state.sink.replace((connection_id, tx)).is_some();
        state.epoch += 1;
        state.disconnected_at = None;
        state.unreachable = false;
        state.acked_before_expiry = None;
        drop(state);

        if freed {
            entry.space.notify_waiters();
        }
        entry.emit(LinkEvent::Connected { resumed_from: resume_from });
        tracing::info!(
            link_id = %link_id,
            connection_id = %connection_id,
            resumed_from = resume_from,
            replayed,
            superseded,
            "device link connected"
        );
        Ok(LinkConnection {
            link_id,
            connection_id,
            frames: rx,
        })
    }

    /// Queues one payload for delivery and returns its sequence number.
    ///
    /// Waits while the unacked queue is full. While the device is away the
    /// frame is only buffered; buffering onto a link whose grace period
    /// already lapsed starts a fresh grace period.
    pub async fn send(&self, link_id: LinkId, payload: DevicePayload) -> Result<u64, LinkError> {
        let entry = self.entry(link_id).await?;
        loop {
            let mut state = entry.state.lock().await;
            if state.closed {
                return Err(LinkError::Closed);
            }
            if state.unacked.len() < self.config.unacked_capacity {
                let seq = state.next_seq;
                state.next_seq += 1;
                let frame = OutboundFrame { seq, payload };
                state.unacked.push_back(frame.clone());

                let dropped = match &state.sink {
                    Some((_, sink)) => sink.try_send(frame).is_err(),
                    None => false,
                };
                let rearm = if state.unreachable && state.sink.is_none() {
                    state.unreachable = false;
                    state.epoch += 1;
                    state.disconnected_at = Some(Instant::now());
                    Some(state.epoch)
                } else {
                    None
                };
                if dropped {
                    // The transport went away without telling us.
                    state.sink = None;
                    drop(state);
                    self.mark_disconnected(link_id, &entry).await;
                } else if let Some(epoch) = rearm {
                    drop(state);
                    self.start_grace_timer(link_id, entry.clone(), epoch);
                }
                return Ok(seq);
            }

            let notified = entry.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);
            tracing::trace!(link_id = %link_id, "unacked queue full, waiting for ack");
            notified.await;
        }
    }

    /// Records a device acknowledgement. Stale acks are ignored.
    pub async fn ack(&self, link_id: LinkId, seq: u64) -> Result<(), LinkError> {
        let entry = self.entry(link_id).await?;
        let mut state = entry.state.lock().await;
        if seq > state.latest() {
            return Err(LinkError::InvalidResumePoint {
                requested: seq,
                acked: state.last_acked,
                latest: state.latest(),
            });
        }
        if !drain_acked(&mut state, seq) {
            return Ok(());
        }
        drop(state);
        entry.space.notify_waiters();
        entry.emit(LinkEvent::Acked { seq });
        Ok(())
    }

    /// Called by the transport when `connection_id` closed. Ignored if a
    /// newer connection has already taken over.
    pub async fn disconnect(&self, link_id: LinkId, connection_id: Uuid) {
        let Ok(entry) = self.entry(link_id).await else {
            return;
        };
        {
            let mut state = entry.state.lock().await;
            match &state.sink {
                Some((current, _)) if *current == connection_id => state.sink = None,
                _ => return,
            }
        }
        self.mark_disconnected(link_id, &entry).await;
    }

    /// Drops whatever transport is connected, keeping pending frames.
    pub async fn detach(&self, link_id: LinkId) -> Result<(), LinkError> {
        let entry = self.entry(link_id).await?;
        let had_sink = entry.state.lock().await.sink.take().is_some();
        if had_sink {
            self.mark_disconnected(link_id, &entry).await;
        }
        Ok(())
    }

    /// Removes the link for good. Its connection, if any, sees its frame
    /// channel close.
    pub async fn close(&self, link_id: LinkId) -> Result<(), LinkError> {
        let entry = self
            .links
            .write()
            .await
            .remove(&link_id)
            .ok_or(LinkError::LinkNotFound(link_id))?;
        {
            let mut state = entry.state.lock().await;
            state.closed = true;
            state.sink = None;
            state.unacked.clear();
        }
        entry.space.notify_waiters();
        entry.emit(LinkEvent::Closed);
        tracing::info!(link_id = %link_id, "device link closed");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    async fn mark_disconnected(&self, link_id: LinkId, entry: &Arc<LinkEntry>) {
        let (epoch, pending) = {
            let mut state = entry.state.lock().await;
            state.epoch += 1;
            state.disconnected_at = Some(Instant::now());
            (state.epoch, state.unacked.len())
        };
        entry.emit(LinkEvent::Disconnected);
        tracing::warn!(
            link_id = %link_id,
            pending,
            grace_ms = self.config.grace_period.as_millis() as u64,
            "device link disconnected"
        );
        self.start_grace_timer(link_id, entry.clone(), epoch);
    }

    fn start_grace_timer(&self, link_id: LinkId, entry: Arc<LinkEntry>, epoch: u64) {
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let dropped = {
                let mut state = entry.state.lock().await;
                if state.closed || state.epoch != epoch || state.sink.is_some() {
                    return;
                }
                state.unreachable = true;
                let acked = state.last_acked;
                state.acked_before_expiry.get_or_insert(acked);
                // Treat the dropped frames as consumed so sequence numbers
                // keep increasing without gaps on the next connection.
                state.last_acked = state.latest();
                let dropped = state.unacked.len();
                state.unacked.clear();
                dropped
            };
            entry.space.notify_waiters();
            entry.emit(LinkEvent::GraceExpired { dropped });
            tracing::warn!(link_id = %link_id, dropped, "device link grace period expired");
        });
    }
}

/// Pops every frame up to and including `seq`. Returns false for stale acks.
fn drain_acked(state: &mut LinkState, seq: u64) -> bool {
    if seq <= state.last_acked {
        return false;
    }
    while state.unacked.front().is_some_and(|frame| frame.seq <= seq) {
        state.unacked.pop_front();
    }
    state.last_acked = seq;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_types::{AnimationCue, TurnCompletion};

    fn links(capacity: usize) -> DeviceLinks {
        DeviceLinks::new(LinkConfig {
            unacked_capacity: capacity,
            grace_period: Duration::from_secs(30),
        })
    }

    fn cue(offset: u64) -> DevicePayload {
        DevicePayload::Cue {
            turn_id: 1,
            cue: AnimationCue::viseme(offset, "AA", 40),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_start_at_one_and_increase() {
        let links = links(8);
        let (id, token) = links.attach("dev-1", None).await;
        let mut conn = links.connect(id, &token, None).await.unwrap();

        assert_eq!(links.send(id, cue(0)).await.unwrap(), 1);
        assert_eq!(links.send(id, cue(40)).await.unwrap(), 2);
        assert_eq!(conn.frames.recv().await.unwrap().seq, 1);
        assert_eq!(conn.frames.recv().await.unwrap().seq, 2);

        let status = links.status(id).await.unwrap();
        assert_eq!((status.latest_seq, status.unacked, status.last_acked), (2, 2, 0));
    }

    #[tokio::test]
    async fn ack_releases_frames_and_rejects_future_seq() {
        let links = links(8);
        let (id, token) = links.attach("dev-1", None).await;
        let _conn = links.connect(id, &token, None).await.unwrap();
        for i in 0..3 {
            links.send(id, cue(i * 40)).await.unwrap();
        }

        links.ack(id, 2).await.unwrap();
        links.ack(id, 1).await.unwrap();
        let status = links.status(id).await.unwrap();
        assert_eq!((status.last_acked, status.unacked), (2, 1));

        assert_eq!(
            links.ack(id, 9).await.unwrap_err(),
            LinkError::InvalidResumePoint {
                requested: 9,
                acked: 2,
                latest: 3
            }
        );
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let links = links(4);
        let (id, _token) = links.attach("dev-1", None).await;
        assert_eq!(
            links.connect(id, "not-the-token", None).await.unwrap_err(),
            LinkError::InvalidToken
        );
        assert!(matches!(
            links.connect(Uuid::new_v4(), "x", None).await.unwrap_err(),
            LinkError::LinkNotFound(_)
        ));
    }

    #[tokio::test]
    async fn full_queue_waits_for_ack() {
        let links = links(2);
        let (id, token) = links.attach("dev-1", None).await;
        let _conn = links.connect(id, &token, None).await.unwrap();
        links.send(id, cue(0)).await.unwrap();
        links.send(id, cue(40)).await.unwrap();

        let blocked = {
            let links = links.clone();
            tokio::spawn(async move { links.send(id, cue(80)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        links.ack(id, 1).await.unwrap();
        assert_eq!(blocked.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn close_wakes_blocked_sender() {
        let links = links(1);
        let (id, _token) = links.attach("dev-1", None).await;
        links.send(id, cue(0)).await.unwrap();
        let blocked = {
            let links = links.clone();
            tokio::spawn(async move { links.send(id, cue(40)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        links.close(id).await.unwrap();
        assert_eq!(blocked.await.unwrap().unwrap_err(), LinkError::Closed);
        assert!(links.is_empty().await);
    }

    #[tokio::test]
    async fn turn_end_seq_is_observable_through_acks() {
        let links = links(8);
        let (id, token) = links.attach("dev-1", None).await;
        let mut events = links.subscribe(id).await.unwrap();
        let _conn = links.connect(id, &token, None).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected { resumed_from: 0 });

        links.send(id, DevicePayload::TurnStart { turn_id: 1 }).await.unwrap();
        let end = links
            .send(
                id,
                DevicePayload::TurnEnd {
                    turn_id: 1,
                    completion: TurnCompletion::Completed,
                },
            )
            .await
            .unwrap();
        links.ack(id, end).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Acked { seq: end });
    }
}
