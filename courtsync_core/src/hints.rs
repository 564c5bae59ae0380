//! Animation hints: short-lived cosmetic cues replicated beside the state.
//!
//! The coordinator keeps an [`HintOutbox`] of live hints and ships up to
//! `max_per_packet` of them with each snapshot. Followers feed received
//! hints into a [`HintInbox`], which fires each occurrence exactly once no
//! matter how many snapshots repeat it.

use crate::actor::ActorId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kinds of cosmetic effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HintKind {
    Knockback,
    Celebrate,
    Stumble,
    Dunk,
}

/// One hint occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationHint {
    pub kind: HintKind,
    pub target: ActorId,
    /// Frames the hint stays live if not refreshed
    pub ttl_frames: u32,
    #[serde(default)]
    pub meta: Value,
    /// Coordinator frame that issued this occurrence
    pub issued_frame: u64,
}

impl AnimationHint {
    pub fn new(kind: HintKind, target: ActorId, ttl_frames: u32, issued_frame: u64) -> Self {
        Self {
            kind,
            target,
            ttl_frames,
            meta: Value::Null,
            issued_frame,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    fn key(&self) -> (ActorId, HintKind) {
        (self.target, self.kind)
    }
}

// ============================================================================
// OUTBOX (coordinator)
// ============================================================================

#[derive(Debug, Clone)]
struct LiveHint {
    hint: AnimationHint,
    remaining: u32,
}

/// Live hints on the authoritative peer.
#[derive(Debug, Clone, Default)]
pub struct HintOutbox {
    live: Vec<LiveHint>,
}

impl HintOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hint, replacing a live one with the same (target, kind).
    pub fn push(&mut self, hint: AnimationHint) {
        self.live.retain(|l| l.hint.key() != hint.key());
        self.live.push(LiveHint {
            remaining: hint.ttl_frames,
            hint,
        });
    }

    /// Ages every hint by one frame and drops the expired ones.
    pub fn tick(&mut self) {
        for live in &mut self.live {
            live.remaining = live.remaining.saturating_sub(1);
        }
        self.live.retain(|l| l.remaining > 0);
    }

    /// Most recent live hints, at most `max`.
    pub fn packet(&self, max: usize) -> Vec<AnimationHint> {
        let skip = self.live.len().saturating_sub(max);
        self.live.iter().skip(skip).map(|l| l.hint.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

// ============================================================================
// INBOX (follower)
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SeenHint {
    issued_frame: u64,
    remaining: u32,
}

/// Idempotent hint receiver.
#[derive(Debug, Clone, Default)]
pub struct HintInbox {
    seen: HashMap<(ActorId, HintKind), SeenHint>,
}

impl HintInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the hints that fire now.
    ///
    /// A (target, kind) pair fires once per `issued_frame`; repeats refresh
    /// its TTL without firing again.
    pub fn receive(&mut self, hints: &[AnimationHint]) -> Vec<AnimationHint> {
        let mut fired = Vec::new();
        for hint in hints {
            let key = hint.key();
            let repeat = self
                .seen
                .get(&key)
                .is_some_and(|seen| seen.issued_frame >= hint.issued_frame);

            if repeat {
                if let Some(seen) = self.seen.get_mut(&key) {
                    seen.remaining = hint.ttl_frames;
                }
                continue;
            }

            self.seen.insert(
                key,
                SeenHint {
                    issued_frame: hint.issued_frame,
                    remaining: hint.ttl_frames,
                },
            );
            fired.push(hint.clone());
        }
        fired
    }

    /// Ages tracked pairs; an expired pair may fire again.
    pub fn tick(&mut self) {
        for seen in self.seen.values_mut() {
            seen.remaining = seen.remaining.saturating_sub(1);
        }
        self.seen.retain(|_, s| s.remaining > 0);
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_expires_after_ttl() {
        let mut outbox = HintOutbox::new();
        outbox.push(AnimationHint::new(HintKind::Knockback, ActorId(1), 2, 10));

        outbox.tick();
        assert_eq!(outbox.len(), 1);
        outbox.tick();
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_outbox_packet_capped() {
        let mut outbox = HintOutbox::new();
        for i in 0..5 {
            outbox.push(AnimationHint::new(HintKind::Stumble, ActorId(i), 10, 0));
        }
        let packet = outbox.packet(3);
        assert_eq!(packet.len(), 3);
        assert_eq!(packet[0].target, ActorId(2));
    }

    #[test]
    fn test_outbox_replaces_same_pair() {
        let mut outbox = HintOutbox::new();
        outbox.push(AnimationHint::new(HintKind::Knockback, ActorId(1), 5, 1));
        outbox.push(AnimationHint::new(HintKind::Knockback, ActorId(1), 5, 4));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.packet(8)[0].issued_frame, 4);
    }

    #[test]
    fn test_inbox_fires_once_per_occurrence() {
        let mut inbox = HintInbox::new();
        let hint = AnimationHint::new(HintKind::Knockback, ActorId(3), 4, 100);

        assert_eq!(inbox.receive(&[hint.clone()]).len(), 1);
        // Same occurrence delivered by later snapshots
        assert!(inbox.receive(&[hint.clone()]).is_empty());
        inbox.tick();
        assert!(inbox.receive(&[hint]).is_empty());

        // A new occurrence fires again
        let next = AnimationHint::new(HintKind::Knockback, ActorId(3), 4, 130);
        assert_eq!(inbox.receive(&[next]).len(), 1);
    }

    #[test]
    fn test_inbox_forgets_after_ttl() {
        let mut inbox = HintInbox::new();
        let hint = AnimationHint::new(HintKind::Celebrate, ActorId(0), 2, 7);
        inbox.receive(&[hint]);

        inbox.tick();
        inbox.tick();
        assert_eq!(inbox.tracked(), 0);
    }
}
