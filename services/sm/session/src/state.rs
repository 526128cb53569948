//! Session state: stanza counters, session flags and the reset policy.
//!
//! One [`SessionState`] exists per stream entity. Everything except the
//! resumable session (id, window, previous inbound count and the advisory
//! pending set) is transient per connection and cleared by [`SessionState::reset`].

use crate::store::ResumeRecord;
use minidom::Element;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Counters and flags for one stream entity
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Whether acknowledgment tracking is active
    enabled: bool,
    /// Last outbound count acknowledged by the peer
    outbound: u32,
    /// Countable stanzas received since the last enable
    inbound: u32,
    /// Resumable session id, empty when there is none
    session_id: String,
    /// Peer-advertised resumption window in seconds
    max_resume: u32,
    /// Local sequence of countable stanzas sent while enabled
    sent: u32,
    /// Stanzas sent while enabled and not yet covered by an ack
    pending: VecDeque<(u32, Element)>,
    /// Inbound count of the previous stream, kept for `<resume h=../>`
    resume_h: Option<u32>,
}

impl SessionState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Recreate the resumable part of a state from a stored record
    pub fn restore(record: &ResumeRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            max_resume: record.max_resume,
            resume_h: Some(record.h),
            ..Self::default()
        }
    }

    /// Whether acknowledgment tracking is active
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Last outbound count acknowledged by the peer
    pub fn outbound(&self) -> u32 {
        self.outbound
    }

    /// Countable stanzas received since the last enable
    pub fn inbound(&self) -> u32 {
        self.inbound
    }

    /// Resumable session id, empty when there is none
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a resumable session is held
    pub fn has_session(&self) -> bool {
        !self.session_id.is_empty()
    }

    /// Peer-advertised resumption window in seconds
    pub fn max_resume(&self) -> u32 {
        self.max_resume
    }

    /// Number of stanzas awaiting acknowledgment
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stanzas awaiting acknowledgment, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &Element> {
        self.pending.iter().map(|(_, element)| element)
    }

    /// The `h` value a resume attempt would carry
    pub fn resume_h(&self) -> u32 {
        self.resume_h.unwrap_or(self.inbound)
    }

    /// Record a countable stanza sent while enabled
    ///
    /// Returns the local sequence number assigned to it.
    pub fn record_outbound_attempt(&mut self, stanza: &Element) -> u32 {
        self.sent = self.sent.wrapping_add(1);
        self.pending.push_back((self.sent, stanza.clone()));
        self.sent
    }

    /// Count one received countable stanza
    pub fn record_inbound(&mut self) {
        self.inbound = self.inbound.wrapping_add(1);
    }

    /// Overwrite the outbound count with the peer's declared `h`
    ///
    /// A value lower than the current one is accepted as-is: the peer's count
    /// is authoritative even when it moves backwards.
    pub fn record_acked_outbound(&mut self, h: u32) {
        if serial_lt(h, self.outbound) {
            warn!(
                "Peer acknowledged h={} below previous outbound={}",
                h, self.outbound
            );
        }
        self.outbound = h;

        let before = self.pending.len();
        while let Some((seq, _)) = self.pending.front() {
            if serial_le(*seq, h) {
                self.pending.pop_front();
            } else {
                break;
            }
        }
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!("Ack h={} released {} pending stanzas", h, dropped);
        }
    }

    /// Reset the per-connection part of the state on an `online` transition
    pub fn reset(&mut self) {
        if self.has_session() {
            // Resume reports what the previous stream handled
            self.resume_h = Some(self.resume_h());
        } else {
            self.resume_h = None;
            self.sent = 0;
            self.pending.clear();
        }
        self.inbound = 0;
        self.outbound = 0;
        self.enabled = false;
    }

    /// Drop the oldest pending stanzas beyond `limit`
    pub(crate) fn trim_pending(&mut self, limit: usize) {
        let mut dropped = 0;
        while self.pending.len() > limit {
            self.pending.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                "Pending set over limit {}; forgot {} oldest stanzas",
                limit, dropped
            );
        }
    }

    /// Start counting our own stanzas from zero
    pub(crate) fn restart_outbound(&mut self) {
        self.outbound = 0;
        self.sent = 0;
        self.pending.clear();
    }

    /// Apply a successful `<enabled/>`
    pub(crate) fn mark_enabled(&mut self, session_id: Option<String>, max_resume: Option<u32>) {
        self.inbound = 0;
        self.enabled = true;
        self.session_id = session_id.unwrap_or_default();
        self.max_resume = max_resume.unwrap_or(0);
        self.resume_h = None;
    }

    /// Apply a successful `<resumed/>`
    pub(crate) fn mark_resumed(&mut self, h: Option<u32>) {
        // Counters continue from the values of the previous stream
        self.inbound = self.resume_h();
        self.resume_h = None;
        self.enabled = true;
        if let Some(h) = h {
            self.record_acked_outbound(h);
        }
    }

    /// Forget the resumable session after a failed resume or enable
    pub(crate) fn clear_session(&mut self) {
        self.session_id.clear();
        self.max_resume = 0;
        self.resume_h = None;
        self.enabled = false;
        self.sent = 0;
        self.pending.clear();
    }

    /// Snapshot of the resumable session, if any
    pub fn resume_record(&self) -> Option<ResumeRecord> {
        if !self.has_session() {
            return None;
        }
        Some(ResumeRecord::new(
            self.session_id.clone(),
            self.resume_h(),
            self.max_resume,
        ))
    }
}

// RFC 1982 serial number comparison over u32
fn serial_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < (1 << 31)
}

fn serial_le(a: u32, b: u32) -> bool {
    a == b || serial_lt(a, b)
}
