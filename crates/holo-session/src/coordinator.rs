//! Turn arbitration between participants and the companion.
//!
//! The coordinator is a plain state machine owned by the session actor; it
//! never blocks and never touches a clock. Callers pass in the session time
//! (`now_ms`) and act on the returned [`Decision`]s.
//!
//! Policy:
//! - The first utterance to cross the likely-final threshold (confidence
//!   plus minimum speech, or simply being final) acquires the floor.
//!   Crossings within the arbitration window of the first one compete, and
//!   the earliest speech start on the session clock wins, then the lowest
//!   participant id.
//! - Finalized utterances that arrive while someone else holds the floor
//!   are queued, bounded, and offered in order once the floor reopens.
//! - While the companion is speaking, a participant who sustains enough
//!   energy for long enough barges in and takes the floor directly.

use crate::config::TurnConfig;
use holo_types::{ParticipantId, Utterance, UtteranceOrigin};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Who holds the conversational floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Floor {
    Open,
    /// A participant holds the turn and is still speaking.
    Participant(ParticipantId),
    /// The companion is answering `speaker`'s turn.
    Companion { speaker: ParticipantId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// `participant` acquired the floor; recognition continues.
    Acquired(ParticipantId),
    /// A finalized utterance became the turn; start the response pipeline.
    TurnReady(Utterance),
    /// `participant` interrupted the companion; cancel the turn in flight.
    BargeIn(ParticipantId),
    /// A finalized utterance is waiting for the floor.
    Queued(ParticipantId),
    /// The holder's utterance came to nothing and the floor reopened.
    Released(ParticipantId),
    /// An utterance was discarded: empty, or pushed out of a full queue.
    Dropped(ParticipantId),
}

#[derive(Debug)]
struct Candidate {
    utterance: Utterance,
    crossed: bool,
}

#[derive(Debug)]
struct Arbitration {
    closes_at_ms: u64,
    contenders: BTreeSet<ParticipantId>,
}

#[derive(Debug)]
pub struct TurnCoordinator {
    config: TurnConfig,
    floor: Floor,
    speaking: HashMap<ParticipantId, Candidate>,
    arbitration: Option<Arbitration>,
    pending: VecDeque<Utterance>,
    loud_ms: HashMap<ParticipantId, u64>,
}

impl TurnCoordinator {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            floor: Floor::Open,
            speaking: HashMap::new(),
            arbitration: None,
            pending: VecDeque::new(),
            loud_ms: HashMap::new(),
        }
    }

    pub fn floor(&self) -> &Floor {
        &self.floor
    }

    /// The participant whose turn it is, if any.
    pub fn holder(&self) -> Option<&ParticipantId> {
        match &self.floor {
            Floor::Open => None,
            Floor::Participant(p) | Floor::Companion { speaker: p } => Some(p),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Session time at which [`tick`](Self::tick) must run next.
    pub fn next_due(&self) -> Option<u64> {
        self.arbitration.as_ref().map(|a| a.closes_at_ms)
    }

    pub fn speech_started(&mut self, participant: &str, at_ms: u64) {
        self.speaking
            .entry(participant.to_string())
            .or_insert_with(|| Candidate {
                utterance: Utterance::speech(participant, at_ms),
                crossed: false,
            });
    }

    /// Accounts one frame of speech and checks for barge-in.
    pub fn voice_activity(
        &mut self,
        participant: &str,
        at_ms: u64,
        duration_ms: u64,
        energy: f32,
        companion_speaking: bool,
    ) -> Option<Decision> {
        if let Some(candidate) = self.speaking.get_mut(participant) {
            candidate.utterance.audio_ms += duration_ms;
        }

        if !companion_speaking || !matches!(self.floor, Floor::Companion { .. }) {
            self.loud_ms.clear();
            return None;
        }
        let loud = self.loud_ms.entry(participant.to_string()).or_default();
        if energy < self.config.barge_in_energy {
            *loud = 0;
            return None;
        }
        *loud += duration_ms;
        if *loud < self.config.barge_in_min_ms {
            return None;
        }

        let started = at_ms.saturating_sub(loud.saturating_sub(duration_ms));
        self.loud_ms.clear();
        self.arbitration = None;
        self.speech_started(participant, started);
        self.floor = Floor::Participant(participant.to_string());
        tracing::info!(participant, at_ms, "barge-in");
        Some(Decision::BargeIn(participant.to_string()))
    }

    /// Applies a recognition update for `participant`'s current utterance.
    pub fn transcript(
        &mut self,
        participant: &str,
        text: &str,
        confidence: f32,
        is_final: bool,
        now_ms: u64,
    ) -> Vec<Decision> {
        let mut decisions = Vec::new();
        let Some(candidate) = self.speaking.get_mut(participant) else {
            return decisions;
        };
        candidate.utterance.transcript = text.to_string();
        candidate.utterance.confidence = confidence;
        if is_final {
            candidate.utterance.finalized = true;
            candidate.utterance.ended_at_ms =
                Some(candidate.utterance.started_at_ms.saturating_add(candidate.utterance.audio_ms));
        }

        if is_final && text.trim().is_empty() {
            self.abandon(participant, now_ms, &mut decisions);
            return decisions;
        }

        let crosses = is_final
            || (confidence >= self.config.likely_final_confidence
                && candidate.utterance.audio_ms >= self.config.likely_final_min_ms);

        match self.floor.clone() {
            Floor::Open => {
                if crosses && !candidate.crossed {
                    candidate.crossed = true;
                    let window = self.config.arbitration_window_ms;
                    self.arbitration
                        .get_or_insert_with(|| Arbitration {
                            closes_at_ms: now_ms.saturating_add(window),
                            contenders: BTreeSet::new(),
                        })
                        .contenders
                        .insert(participant.to_string());
                }
                decisions.extend(self.tick(now_ms));
            }
            Floor::Participant(holder) if holder == participant => {
                if is_final {
                    if let Some(candidate) = self.speaking.remove(participant) {
                        self.floor = Floor::Companion {
                            speaker: participant.to_string(),
                        };
                        decisions.push(Decision::TurnReady(candidate.utterance));
                    }
                }
            }
            Floor::Participant(_) | Floor::Companion { .. } => {
                if is_final {
                    if let Some(candidate) = self.speaking.remove(participant) {
                        self.enqueue(candidate.utterance, &mut decisions);
                    }
                } else if crosses {
                    candidate.crossed = true;
                }
            }
        }
        decisions
    }

    /// Recognition for `participant`'s utterance failed or yielded nothing.
    pub fn speech_abandoned(&mut self, participant: &str, now_ms: u64) -> Vec<Decision> {
        let mut decisions = Vec::new();
        self.abandon(participant, now_ms, &mut decisions);
        decisions
    }

    /// Offers an already-final utterance (typed text or a system prompt).
    pub fn submit(&mut self, utterance: Utterance, now_ms: u64) -> Vec<Decision> {
        let mut decisions = Vec::new();
        if self.floor == Floor::Open && self.arbitration.is_none() {
            self.floor = Floor::Companion {
                speaker: utterance.participant_id.clone(),
            };
            decisions.push(Decision::TurnReady(utterance));
        } else {
            self.enqueue(utterance, &mut decisions);
        }
        decisions.extend(self.tick(now_ms));
        decisions
    }

    /// Resolves an arbitration whose window has closed.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Decision> {
        let mut decisions = Vec::new();
        let closed = self
            .arbitration
            .as_ref()
            .is_some_and(|a| now_ms >= a.closes_at_ms);
        if closed {
            if let Some(arbitration) = self.arbitration.take() {
                self.resolve(arbitration.contenders, &mut decisions);
            }
        }
        decisions
    }

    /// The companion's turn ended (completed, degraded or abandoned).
    ///
    /// Reopens the floor and offers the next queued utterance, or resolves
    /// among participants who already crossed the threshold meanwhile.
    pub fn turn_finished(&mut self, now_ms: u64) -> Vec<Decision> {
        let mut decisions = Vec::new();
        if matches!(self.floor, Floor::Companion { .. }) {
            self.floor = Floor::Open;
            self.offer_next(now_ms, &mut decisions);
        }
        decisions
    }

    fn offer_next(&mut self, now_ms: u64, decisions: &mut Vec<Decision>) {
        if let Some(next) = self.pending.pop_front() {
            self.floor = Floor::Companion {
                speaker: next.participant_id.clone(),
            };
            decisions.push(Decision::TurnReady(next));
            return;
        }
        let crossed: BTreeSet<ParticipantId> = self
            .speaking
            .iter()
            .filter(|(_, c)| c.crossed)
            .map(|(p, _)| p.clone())
            .collect();
        if !crossed.is_empty() {
            self.arbitration = None;
            self.resolve(crossed, decisions);
        }
        decisions.extend(self.tick(now_ms));
    }

    fn resolve(&mut self, contenders: BTreeSet<ParticipantId>, decisions: &mut Vec<Decision>) {
        let winner = contenders
            .iter()
            .filter_map(|p| self.speaking.get(p).map(|c| (c.utterance.started_at_ms, p)))
            .min()
            .map(|(_, p)| p.clone());
        let Some(winner) = winner else {
            return;
        };
        self.floor = Floor::Participant(winner.clone());
        decisions.push(Decision::Acquired(winner.clone()));

        let finalized = self
            .speaking
            .get(&winner)
            .is_some_and(|c| c.utterance.finalized);
        if finalized {
            if let Some(candidate) = self.speaking.remove(&winner) {
                self.floor = Floor::Companion {
                    speaker: winner.clone(),
                };
                decisions.push(Decision::TurnReady(candidate.utterance));
            }
        }
        // Losers that already finished speaking wait in the queue.
        for loser in contenders.iter().filter(|p| **p != winner) {
            let done = self.speaking.get(loser).is_some_and(|c| c.utterance.finalized);
            if done {
                if let Some(candidate) = self.speaking.remove(loser) {
                    self.enqueue(candidate.utterance, decisions);
                }
            }
        }
    }

    fn abandon(&mut self, participant: &str, now_ms: u64, decisions: &mut Vec<Decision>) {
        self.speaking.remove(participant);
        if let Some(arbitration) = self.arbitration.as_mut() {
            arbitration.contenders.remove(participant);
            if arbitration.contenders.is_empty() {
                self.arbitration = None;
            }
        }
        if self.floor == Floor::Participant(participant.to_string()) {
            self.floor = Floor::Open;
            decisions.push(Decision::Released(participant.to_string()));
            self.offer_next(now_ms, decisions);
        }
    }

    fn enqueue(&mut self, utterance: Utterance, decisions: &mut Vec<Decision>) {
        if utterance.transcript.trim().is_empty() && utterance.origin != UtteranceOrigin::System {
            decisions.push(Decision::Dropped(utterance.participant_id));
            return;
        }
        let participant = utterance.participant_id.clone();
        self.pending.push_back(utterance);
        decisions.push(Decision::Queued(participant));
        while self.pending.len() > self.config.pending_capacity {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(participant = %dropped.participant_id, "pending queue full, dropping oldest utterance");
                decisions.push(Decision::Dropped(dropped.participant_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: u64) -> TurnConfig {
        TurnConfig {
            likely_final_confidence: 0.6,
            likely_final_min_ms: 300,
            arbitration_window_ms: window,
            pending_capacity: 2,
            barge_in_energy: 0.2,
            barge_in_min_ms: 200,
        }
    }

    /// Feeds `ms` of speech in 20 ms frames.
    fn speak(c: &mut TurnCoordinator, p: &str, from_ms: u64, ms: u64) {
        for t in (from_ms..from_ms + ms).step_by(20) {
            c.voice_activity(p, t, 20, 0.5, false);
        }
    }

    fn ready_speaker(decisions: &[Decision]) -> Option<&str> {
        decisions.iter().find_map(|d| match d {
            Decision::TurnReady(u) => Some(u.participant_id.as_str()),
            _ => None,
        })
    }

    #[test]
    fn first_to_cross_wins_and_other_is_queued() {
        let mut c = TurnCoordinator::new(config(100));
        c.speech_started("alice", 0);
        speak(&mut c, "alice", 0, 300);
        c.speech_started("bob", 300);
        speak(&mut c, "bob", 300, 100);

        // Alice crosses at 600; Bob only got partial confidence.
        assert!(c.transcript("bob", "wait", 0.3, false, 590).is_empty());
        assert!(c.transcript("alice", "hello", 0.8, false, 600).is_empty());
        assert_eq!(c.next_due(), Some(700));
        assert_eq!(c.tick(700), vec![Decision::Acquired("alice".into())]);
        assert_eq!(c.holder().map(String::as_str), Some("alice"));

        // Bob finishes while Alice holds the floor.
        assert_eq!(
            c.transcript("bob", "wait for me", 1.0, true, 750),
            vec![Decision::Queued("bob".into())]
        );
        let ready = c.transcript("alice", "hello", 1.0, true, 800);
        assert_eq!(ready_speaker(&ready), Some("alice"));

        // Bob's utterance is offered as soon as Alice's turn completes.
        let next = c.turn_finished(2_000);
        assert_eq!(ready_speaker(&next), Some("bob"));
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn later_starter_who_crosses_first_wins() {
        let mut c = TurnCoordinator::new(config(100));
        c.speech_started("alice", 0);
        c.speech_started("bob", 300);
        speak(&mut c, "alice", 0, 600);
        speak(&mut c, "bob", 300, 400);

        c.transcript("bob", "stop", 0.9, false, 700);
        assert_eq!(c.tick(800), vec![Decision::Acquired("bob".into())]);
        // Alice crosses well after the window closed: no contest.
        assert!(c.transcript("alice", "so anyway", 0.9, false, 900).is_empty());
        assert_eq!(c.holder().map(String::as_str), Some("bob"));
    }

    #[test]
    fn crossings_within_window_go_to_earliest_start() {
        let mut c = TurnCoordinator::new(config(100));
        c.speech_started("bob", 0);
        c.speech_started("alice", 300);
        speak(&mut c, "bob", 0, 400);
        speak(&mut c, "alice", 300, 400);

        c.transcript("alice", "hey", 0.9, false, 700);
        c.transcript("bob", "hi", 0.9, false, 760);
        assert_eq!(c.tick(800), vec![Decision::Acquired("bob".into())]);
    }

    #[test]
    fn exact_tie_goes_to_lowest_participant_id() {
        let mut c = TurnCoordinator::new(config(100));
        for p in ["zed", "amy"] {
            c.speech_started(p, 100);
            speak(&mut c, p, 100, 400);
        }
        c.transcript("zed", "one", 0.9, false, 500);
        c.transcript("amy", "two", 0.9, false, 500);
        assert_eq!(c.tick(600), vec![Decision::Acquired("amy".into())]);
    }

    #[test]
    fn short_final_utterance_acquires_directly() {
        let mut c = TurnCoordinator::new(config(0));
        c.speech_started("alice", 0);
        speak(&mut c, "alice", 0, 100);
        let decisions = c.transcript("alice", "hello", 1.0, true, 500);
        assert_eq!(decisions[0], Decision::Acquired("alice".into()));
        assert_eq!(ready_speaker(&decisions), Some("alice"));
        assert_eq!(c.floor(), &Floor::Companion { speaker: "alice".into() });
    }

    #[test]
    fn sustained_energy_barges_in() {
        let mut c = TurnCoordinator::new(config(0));
        c.submit(Utterance::text("alice", UtteranceOrigin::Text, "tell me a story", 0), 0);

        // A cough is too short.
        assert!(c.voice_activity("bob", 1_000, 20, 0.5, true).is_none());
        assert!(c.voice_activity("bob", 1_020, 20, 0.01, true).is_none());

        let mut decision = None;
        for t in (2_000..2_400).step_by(20) {
            if let Some(d) = c.voice_activity("bob", t, 20, 0.5, true) {
                decision = Some((t, d));
                break;
            }
        }
        let (at, decision) = decision.expect("barge-in");
        assert_eq!(decision, Decision::BargeIn("bob".into()));
        assert_eq!(at, 2_180);
        assert_eq!(c.floor(), &Floor::Participant("bob".into()));

        // The interrupted turn finishing does not reopen Bob's floor.
        assert!(c.turn_finished(2_300).is_empty());
        let ready = c.transcript("bob", "wait", 1.0, true, 2_600);
        assert_eq!(ready_speaker(&ready), Some("bob"));
    }

    #[test]
    fn zero_barge_in_minimum_needs_one_loud_frame() {
        let mut c = TurnCoordinator::new(TurnConfig {
            barge_in_min_ms: 0,
            ..config(0)
        });
        c.submit(Utterance::text("alice", UtteranceOrigin::Text, "go on", 0), 0);

        assert!(c.voice_activity("bob", 1_000, 20, 0.01, true).is_none());
        assert_eq!(
            c.voice_activity("bob", 1_020, 20, 0.5, true),
            Some(Decision::BargeIn("bob".into()))
        );
        assert_eq!(c.floor(), &Floor::Participant("bob".into()));
    }

    #[test]
    fn no_barge_in_while_companion_silent() {
        let mut c = TurnCoordinator::new(config(0));
        c.submit(Utterance::text("alice", UtteranceOrigin::Text, "hi", 0), 0);
        for t in (0..1_000).step_by(20) {
            assert!(c.voice_activity("bob", t, 20, 0.9, false).is_none());
        }
    }

    #[test]
    fn pending_queue_is_bounded() {
        let mut c = TurnCoordinator::new(config(0));
        c.submit(Utterance::text("a", UtteranceOrigin::Text, "first", 0), 0);
        let mut dropped = Vec::new();
        for (i, p) in ["b", "c", "d"].iter().enumerate() {
            let decisions = c.submit(Utterance::text(*p, UtteranceOrigin::Text, "x", i as u64), 0);
            dropped.extend(decisions.into_iter().filter(|d| matches!(d, Decision::Dropped(_))));
        }
        assert_eq!(dropped, vec![Decision::Dropped("b".into())]);
        assert_eq!(c.pending_len(), 2);
    }

    #[test]
    fn empty_final_releases_the_floor() {
        let mut c = TurnCoordinator::new(config(0));
        c.speech_started("alice", 0);
        speak(&mut c, "alice", 0, 400);
        assert_eq!(
            c.transcript("alice", "um", 0.9, false, 400),
            vec![Decision::Acquired("alice".into())]
        );
        c.submit(Utterance::text("bob", UtteranceOrigin::Text, "hello?", 450), 450);
        let decisions = c.transcript("alice", "", 1.0, true, 500);
        assert_eq!(decisions[0], Decision::Released("alice".into()));
        assert_eq!(ready_speaker(&decisions), Some("bob"));
    }

    #[test]
    fn floor_never_has_two_holders_under_interleaving() {
        // Deterministic pseudo-random interleaving of four speakers.
        let participants = ["p0", "p1", "p2", "p3"];
        let mut c = TurnCoordinator::new(config(50));
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        let mut in_flight: Option<String> = None;

        for step in 0..5_000u64 {
            let now = step * 10;
            let p = participants[(next() % 4) as usize];
            let decisions = match next() % 6 {
                0 => {
                    c.speech_started(p, now);
                    Vec::new()
                }
                1 => c
                    .voice_activity(p, now, 20, 0.5, in_flight.is_some())
                    .into_iter()
                    .collect(),
                2 => c.transcript(p, "words", 0.7, false, now),
                3 => c.transcript(p, "words done", 1.0, true, now),
                4 => c.tick(now),
                _ => {
                    if in_flight.take().is_some() {
                        c.turn_finished(now)
                    } else {
                        Vec::new()
                    }
                }
            };
            for d in decisions {
                match d {
                    Decision::TurnReady(u) => {
                        in_flight = Some(u.participant_id);
                    }
                    Decision::BargeIn(_) => in_flight = None,
                    _ => {}
                }
            }
            // The holder is always the single participant named by the floor.
            match c.floor() {
                Floor::Open => assert!(in_flight.is_none()),
                Floor::Companion { speaker } => assert_eq!(in_flight.as_ref(), Some(speaker)),
                Floor::Participant(_) => assert!(in_flight.is_none()),
            }
        }
    }
}
