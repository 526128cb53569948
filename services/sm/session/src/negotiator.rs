//! Resume/enable negotiation state machine.
//!
//! ```text
//! Idle ──session id──▶ AttemptingResume ──<resumed/>──▶ Resumed
//!  │                          │
//!  │ no session id            │ <failed/>, other, transport error, timeout
//!  ▼                          ▼
//! NegotiatingFeatures ◀── ResumeFailed
//!  │
//!  │ binding done
//!  ▼
//! Enabling ──<enabled/>──▶ Enabled
//!  │
//!  └──<failed/>, other──▶ Failed
//! ```
//!
//! The negotiator never performs I/O. It hands out the element to send and
//! consumes the element that came back; the caller owns the round trip.

use crate::error::SmError;
use crate::state::SessionState;
use minidom::Element;
use sm_wire::{Nonza, NS_SM};
use std::fmt;
use tracing::{debug, info, warn};

/// Negotiation progress for the current stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing attempted on this stream yet
    Idle,
    /// `<resume/>` sent, waiting for the answer
    AttemptingResume,
    /// Previous session reattached
    Resumed,
    /// Resume rejected; session id forgotten
    ResumeFailed,
    /// Waiting for the rest of feature negotiation (binding)
    NegotiatingFeatures,
    /// `<enable/>` sent, waiting for the answer
    Enabling,
    /// Acknowledgment tracking active on a new session
    Enabled,
    /// Enable rejected; stream continues without the overlay
    Failed,
}

impl NegotiationState {
    /// Whether a response is outstanding
    pub fn is_waiting(&self) -> bool {
        matches!(self, NegotiationState::AttemptingResume | NegotiationState::Enabling)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AttemptingResume => "attempting resume",
            NegotiationState::Resumed => "resumed",
            NegotiationState::ResumeFailed => "resume failed",
            NegotiationState::NegotiatingFeatures => "negotiating features",
            NegotiationState::Enabling => "enabling",
            NegotiationState::Enabled => "enabled",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives resume-or-enable for one stream at a time
#[derive(Debug, Clone)]
pub struct Negotiator {
    state: NegotiationState,
    /// Ask for resumption support in `<enable/>`
    request_resumption: bool,
}

impl Negotiator {
    /// Create an idle negotiator
    pub fn new(request_resumption: bool) -> Self {
        Self {
            state: NegotiationState::Idle,
            request_resumption,
        }
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Back to idle for a new stream
    pub fn reset(&mut self) {
        self.state = NegotiationState::Idle;
    }

    /// Start of negotiation: resume if a session id is held
    ///
    /// Returns the `<resume/>` to send, or `None` when there is nothing to
    /// resume and negotiation should proceed to binding.
    pub fn begin_resume(&mut self, session: &SessionState) -> Result<Option<Element>, SmError> {
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("resume"));
        }

        if !session.has_session() {
            debug!("No previous session; deferring to binding");
            self.state = NegotiationState::NegotiatingFeatures;
            return Ok(None);
        }

        info!(
            "Attempting resume of session {} with h={}",
            session.session_id(),
            session.resume_h()
        );
        self.state = NegotiationState::AttemptingResume;
        Ok(Some(sm_wire::resume(session.resume_h(), session.session_id())))
    }

    /// Consume the answer to `<resume/>`
    ///
    /// Returns `true` when the session was reattached. Any answer other than
    /// `<resumed/>` forgets the session and returns `false`; a `<resumed/>`
    /// with a malformed `h` forgets the session and is reported as an error.
    pub fn on_resume_response(
        &mut self,
        session: &mut SessionState,
        response: &Element,
    ) -> Result<bool, SmError> {
        if self.state != NegotiationState::AttemptingResume {
            return Err(self.invalid("resume response"));
        }

        if !response.is("resumed", NS_SM) {
            self.resume_failed(session, &describe(response));
            return Ok(false);
        }

        match Nonza::try_from(response) {
            Ok(Nonza::Resumed { h, previd }) => {
                if let Some(previd) = previd.as_deref() {
                    if previd != session.session_id() {
                        warn!(
                            "Peer resumed previd={} but we asked for {}",
                            previd,
                            session.session_id()
                        );
                    }
                }
                session.mark_resumed(h);
                self.state = NegotiationState::Resumed;
                info!(
                    "Resumed session {} (inbound={}, outbound={})",
                    session.session_id(),
                    session.inbound(),
                    session.outbound()
                );
                Ok(true)
            }
            Ok(other) => {
                self.resume_failed(session, &other.to_string());
                Ok(false)
            }
            Err(e) => {
                self.resume_failed(session, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Give up on an outstanding resume (transport failure, timeout)
    pub fn resume_failed(&mut self, session: &mut SessionState, reason: &str) {
        if self.state != NegotiationState::AttemptingResume {
            return;
        }
        warn!(
            "Resume of session {} failed ({}); falling back to enable",
            session.session_id(),
            reason
        );
        session.clear_session();
        self.state = NegotiationState::ResumeFailed;
    }

    /// After binding: build `<enable/>`
    ///
    /// From `Idle` this is only allowed when no resumable session is held;
    /// a held session must go through [`Negotiator::begin_resume`] first.
    pub fn begin_enable(&mut self, session: &SessionState) -> Result<Element, SmError> {
        match self.state {
            NegotiationState::Idle if session.has_session() => {
                warn!(
                    "Enable requested before resuming session {}",
                    session.session_id()
                );
                Err(self.invalid("enable"))
            }
            NegotiationState::Idle
            | NegotiationState::NegotiatingFeatures
            | NegotiationState::ResumeFailed => {
                self.state = NegotiationState::Enabling;
                debug!("Enabling stream management (resume={})", self.request_resumption);
                Ok(sm_wire::enable(self.request_resumption))
            }
            _ => Err(self.invalid("enable")),
        }
    }

    /// `<enable/>` is on the wire: our own counter starts now
    pub fn enable_sent(&mut self, session: &mut SessionState) {
        session.restart_outbound();
    }

    /// Consume the answer to `<enable/>`
    pub fn on_enable_response(
        &mut self,
        session: &mut SessionState,
        response: &Element,
    ) -> Result<(), SmError> {
        if self.state != NegotiationState::Enabling {
            return Err(self.invalid("enable response"));
        }

        let parsed = if response.has_ns(NS_SM) {
            Some(Nonza::try_from(response))
        } else {
            None
        };

        match parsed {
            Some(Ok(Nonza::Enabled { id, max, resume })) => {
                if self.request_resumption && !resume {
                    debug!("Peer enabled stream management without resumption");
                }
                session.mark_enabled(id, max);
                self.state = NegotiationState::Enabled;
                info!(
                    "Stream management enabled (id={:?}, max={}s)",
                    session.session_id(),
                    session.max_resume()
                );
                Ok(())
            }
            Some(Ok(Nonza::Failed { condition, .. })) => {
                self.enable_failed(session, condition.as_deref().unwrap_or("failed"));
                Err(SmError::Rejected { condition })
            }
            Some(Err(e)) => {
                self.enable_failed(session, &e.to_string());
                Err(e.into())
            }
            _ => {
                self.enable_failed(session, &describe(response));
                Err(SmError::UnexpectedResponse(response.name().to_string()))
            }
        }
    }

    /// Give up on an outstanding enable
    pub fn enable_failed(&mut self, session: &mut SessionState, reason: &str) {
        warn!("Enable failed ({}); continuing without stream management", reason);
        session.clear_session();
        self.state = NegotiationState::Failed;
    }

    fn invalid(&self, operation: &'static str) -> SmError {
        SmError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

fn describe(element: &Element) -> String {
    match Nonza::try_from(element) {
        Ok(Nonza::Failed {
            condition: Some(condition),
            ..
        }) => format!("<failed/> {}", condition),
        _ => format!("<{}/>", element.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    fn session_with(id: &str, inbound: u32) -> SessionState {
        let mut state = SessionState::new();
        state.mark_enabled(Some(id.to_string()), Some(600));
        for _ in 0..inbound {
            state.record_inbound();
        }
        state
    }

    #[test]
    fn test_no_session_defers_to_binding() {
        let mut negotiator = Negotiator::new(true);
        let state = SessionState::new();

        assert!(negotiator.begin_resume(&state).unwrap().is_none());
        assert_eq!(negotiator.state(), NegotiationState::NegotiatingFeatures);
    }

    #[test]
    fn test_resume_request_carries_h_and_previd() {
        let mut negotiator = Negotiator::new(true);
        let state = session_with("abc", 5);

        let request = negotiator.begin_resume(&state).unwrap().unwrap();
        assert!(request.is("resume", NS_SM));
        assert_eq!(request.attr("h"), Some("5"));
        assert_eq!(request.attr("previd"), Some("abc"));
        assert_eq!(negotiator.state(), NegotiationState::AttemptingResume);
    }

    #[test]
    fn test_resume_success() {
        let mut negotiator = Negotiator::new(true);
        let mut state = session_with("abc", 5);
        state.reset();

        negotiator.begin_resume(&state).unwrap();
        let resumed = negotiator
            .on_resume_response(&mut state, &parse("<resumed xmlns='urn:xmpp:sm:3' h='2' previd='abc'/>"))
            .unwrap();

        assert!(resumed);
        assert_eq!(negotiator.state(), NegotiationState::Resumed);
        assert!(state.enabled());
        assert_eq!(state.session_id(), "abc");
        assert_eq!(state.inbound(), 5);
        assert_eq!(state.outbound(), 2);

        // No enable after a successful resume
        assert!(negotiator.begin_enable(&state).is_err());
    }

    #[test]
    fn test_resume_failure_clears_session() {
        let mut negotiator = Negotiator::new(true);
        let mut state = session_with("abc", 5);

        negotiator.begin_resume(&state).unwrap();
        let resumed = negotiator
            .on_resume_response(
                &mut state,
                &parse(
                    "<failed xmlns='urn:xmpp:sm:3'>\
                       <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                     </failed>",
                ),
            )
            .unwrap();

        assert!(!resumed);
        assert_eq!(negotiator.state(), NegotiationState::ResumeFailed);
        assert_eq!(state.session_id(), "");
        assert!(!state.enabled());

        let enable = negotiator.begin_enable(&state).unwrap();
        assert!(enable.is("enable", NS_SM));
    }

    #[test]
    fn test_malformed_resumed_is_error_and_clears() {
        let mut negotiator = Negotiator::new(true);
        let mut state = session_with("abc", 1);

        negotiator.begin_resume(&state).unwrap();
        let err = negotiator
            .on_resume_response(&mut state, &parse("<resumed xmlns='urn:xmpp:sm:3' h='x'/>"))
            .unwrap_err();

        assert!(matches!(err, SmError::Protocol(_)));
        assert!(!state.has_session());
        assert_eq!(negotiator.state(), NegotiationState::ResumeFailed);
    }

    #[test]
    fn test_enable_not_allowed_while_resume_outstanding() {
        let mut negotiator = Negotiator::new(true);
        let state = session_with("abc", 0);

        negotiator.begin_resume(&state).unwrap();
        let err = negotiator.begin_enable(&state).unwrap_err();
        assert!(matches!(
            err,
            SmError::InvalidState {
                operation: "enable",
                state: NegotiationState::AttemptingResume
            }
        ));
    }

    #[test]
    fn test_enable_success() {
        let mut negotiator = Negotiator::new(true);
        let mut state = SessionState::new();
        state.record_inbound();
        state.record_acked_outbound(9);

        negotiator.begin_resume(&state).unwrap();
        let enable = negotiator.begin_enable(&state).unwrap();
        assert_eq!(enable.attr("resume"), Some("true"));

        negotiator.enable_sent(&mut state);
        assert_eq!(state.outbound(), 0);

        negotiator
            .on_enable_response(&mut state, &parse("<enabled xmlns='urn:xmpp:sm:3' id='xyz' max='600' resume='true'/>"))
            .unwrap();

        assert_eq!(negotiator.state(), NegotiationState::Enabled);
        assert_eq!(state.inbound(), 0);
        assert!(state.enabled());
        assert_eq!(state.session_id(), "xyz");
        assert_eq!(state.max_resume(), 600);
    }

    #[test]
    fn test_enable_rejected() {
        let mut negotiator = Negotiator::new(true);
        let mut state = SessionState::new();

        negotiator.begin_enable(&state).unwrap();
        let err = negotiator
            .on_enable_response(
                &mut state,
                &parse(
                    "<failed xmlns='urn:xmpp:sm:3'>\
                       <unexpected-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                     </failed>",
                ),
            )
            .unwrap_err();

        match err {
            SmError::Rejected { condition } => {
                assert_eq!(condition.as_deref(), Some("unexpected-request"))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!state.enabled());
        assert_eq!(state.session_id(), "");
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }

    #[test]
    fn test_enable_unexpected_response() {
        let mut negotiator = Negotiator::new(false);
        let mut state = SessionState::new();

        let enable = negotiator.begin_enable(&state).unwrap();
        assert_eq!(enable.attr("resume"), None);

        let err = negotiator
            .on_enable_response(&mut state, &parse("<iq xmlns='jabber:client' type='error'/>"))
            .unwrap_err();
        assert!(matches!(err, SmError::UnexpectedResponse(name) if name == "iq"));
    }

    #[test]
    fn test_enable_refused_while_session_unresumed() {
        let mut negotiator = Negotiator::new(true);
        let mut state = session_with("abc", 3);
        state.reset();

        let err = negotiator.begin_enable(&state).unwrap_err();
        assert!(matches!(
            err,
            SmError::InvalidState {
                operation: "enable",
                state: NegotiationState::Idle
            }
        ));
        assert_eq!(state.session_id(), "abc");
        assert_eq!(negotiator.state(), NegotiationState::Idle);

        // Resume still possible afterwards
        let resume = negotiator.begin_resume(&state).unwrap().unwrap();
        assert_eq!(resume.attr("previd"), Some("abc"));
    }

    #[test]
    fn test_resume_failed_outside_attempt_is_noop() {
        let mut negotiator = Negotiator::new(true);
        let mut state = session_with("abc", 0);

        negotiator.resume_failed(&mut state, "timeout");
        assert!(state.has_session());
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }
}
