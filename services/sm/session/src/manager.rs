//! Stream management entry point.
//!
//! [`StreamManagement`] owns the session state, the acknowledgment exchange
//! and the negotiator. Transport events enter through [`StreamManagement::handle`]
//! one at a time; negotiation steps go through the `begin_*`/`*_response`
//! methods. Every call returns the elements the host must write, in order.

use crate::config::SmConfig;
use crate::error::SmError;
use crate::exchange::AckExchange;
use crate::negotiator::{NegotiationState, Negotiator};
use crate::state::SessionState;
use crate::store::ResumeRecord;
use minidom::Element;
use tracing::debug;

/// Transport events fed to the state machine
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent<'a> {
    /// A fresh stream came up
    Online,
    /// The host wrote this element
    Sent(&'a Element),
    /// The host read this element
    Received(&'a Element),
}

/// Stream management for one stream entity
#[derive(Debug, Clone)]
pub struct StreamManagement {
    config: SmConfig,
    state: SessionState,
    exchange: AckExchange,
    negotiator: Negotiator,
}

impl StreamManagement {
    /// Create with an empty state
    pub fn new(config: SmConfig) -> Self {
        Self::with_state(config, SessionState::new())
    }

    /// Create from a previously stored resumable session
    pub fn restore(config: SmConfig, record: &ResumeRecord) -> Self {
        Self::with_state(config, SessionState::restore(record))
    }

    fn with_state(config: SmConfig, state: SessionState) -> Self {
        Self {
            exchange: AckExchange::new(&config),
            negotiator: Negotiator::new(config.resume),
            config,
            state,
        }
    }

    /// Session state (read-only)
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Negotiation progress on the current stream
    pub fn negotiation(&self) -> NegotiationState {
        self.negotiator.state()
    }

    /// Configuration in use
    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    /// Serialized entry point for transport events
    pub fn handle(&mut self, event: StreamEvent<'_>) -> Result<Vec<Element>, SmError> {
        match event {
            StreamEvent::Online => {
                debug!(
                    "Stream online; resetting counters (session={:?})",
                    self.state.session_id()
                );
                self.state.reset();
                self.exchange.reset();
                self.negotiator.reset();
                Ok(Vec::new())
            }
            StreamEvent::Sent(element) => Ok(self
                .exchange
                .on_send(&mut self.state, element)
                .into_iter()
                .collect()),
            StreamEvent::Received(element) => Ok(self
                .exchange
                .on_receive(&mut self.state, element)?
                .into_iter()
                .collect()),
        }
    }

    /// Start of negotiation; `Some(<resume/>)` when a session can be resumed
    pub fn begin_resume(&mut self) -> Result<Option<Element>, SmError> {
        self.negotiator.begin_resume(&self.state)
    }

    /// Answer to `<resume/>`; `true` when the session was reattached
    pub fn resume_response(&mut self, response: &Element) -> Result<bool, SmError> {
        self.negotiator.on_resume_response(&mut self.state, response)
    }

    /// The resume round trip itself failed
    pub fn resume_failed(&mut self, reason: &str) {
        self.negotiator.resume_failed(&mut self.state, reason)
    }

    /// After binding: the `<enable/>` to send
    pub fn begin_enable(&mut self) -> Result<Element, SmError> {
        self.negotiator.begin_enable(&self.state)
    }

    /// `<enable/>` has been written
    pub fn enable_sent(&mut self) {
        self.negotiator.enable_sent(&mut self.state)
    }

    /// Answer to `<enable/>`; on success returns the priming `<r/>`
    pub fn enable_response(&mut self, response: &Element) -> Result<Vec<Element>, SmError> {
        self.negotiator.on_enable_response(&mut self.state, response)?;
        Ok(vec![self.exchange.request()])
    }

    /// The enable round trip itself failed
    pub fn enable_failed(&mut self, reason: &str) {
        self.negotiator.enable_failed(&mut self.state, reason)
    }

    /// Snapshot for a [`crate::ResumeStore`]
    pub fn resume_record(&self) -> Option<ResumeRecord> {
        self.state.resume_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_wire::NS_SM;

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    fn message() -> Element {
        Element::builder("message", "jabber:client").build()
    }

    fn enabled_manager() -> StreamManagement {
        let mut sm = StreamManagement::new(SmConfig::default());
        sm.handle(StreamEvent::Online).unwrap();
        sm.begin_resume().unwrap();
        sm.begin_enable().unwrap();
        sm.enable_sent();
        sm.enable_response(&parse("<enabled xmlns='urn:xmpp:sm:3' id='xyz' max='600' resume='true'/>"))
            .unwrap();
        sm
    }

    #[test]
    fn test_online_resets_irrespective_of_state() {
        let mut sm = enabled_manager();
        sm.handle(StreamEvent::Received(&message())).unwrap();
        sm.handle(StreamEvent::Received(&parse("<a xmlns='urn:xmpp:sm:3' h='3'/>")))
            .unwrap();

        sm.handle(StreamEvent::Online).unwrap();

        assert_eq!(sm.state().inbound(), 0);
        assert_eq!(sm.state().outbound(), 0);
        assert!(!sm.state().enabled());
        assert_eq!(sm.negotiation(), NegotiationState::Idle);
    }

    #[test]
    fn test_enable_primes_with_one_request() {
        let mut sm = StreamManagement::new(SmConfig::default());
        sm.handle(StreamEvent::Online).unwrap();
        assert!(sm.begin_resume().unwrap().is_none());
        sm.begin_enable().unwrap();
        sm.enable_sent();
        let out = sm
            .enable_response(&parse("<enabled xmlns='urn:xmpp:sm:3' id='xyz' max='600'/>"))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert!(out[0].is("r", NS_SM));
        assert_eq!(sm.state().session_id(), "xyz");
        assert_eq!(sm.state().max_resume(), 600);
    }

    #[test]
    fn test_enable_failure_emits_nothing() {
        let mut sm = StreamManagement::new(SmConfig::default());
        sm.begin_enable().unwrap();
        sm.enable_sent();
        assert!(sm
            .enable_response(&parse("<failed xmlns='urn:xmpp:sm:3'/>"))
            .is_err());

        // Stanzas keep flowing without requests
        let out = sm.handle(StreamEvent::Sent(&message())).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sent_and_received_flow() {
        let mut sm = enabled_manager();

        let out = sm.handle(StreamEvent::Sent(&message())).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is("r", NS_SM));

        sm.handle(StreamEvent::Received(&message())).unwrap();
        sm.handle(StreamEvent::Received(&message())).unwrap();
        let out = sm
            .handle(StreamEvent::Received(&parse("<r xmlns='urn:xmpp:sm:3'/>")))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr("h"), Some("2"));
    }

    #[test]
    fn test_restored_session_blocks_direct_enable() {
        let record = ResumeRecord::new("abc".to_string(), 12, 300);
        let mut sm = StreamManagement::restore(SmConfig::default(), &record);
        sm.handle(StreamEvent::Online).unwrap();

        assert!(matches!(
            sm.begin_enable(),
            Err(SmError::InvalidState { operation: "enable", .. })
        ));
        assert_eq!(sm.state().session_id(), "abc");
    }

    #[test]
    fn test_restore_then_resume() {
        let record = ResumeRecord::new("abc".to_string(), 12, 300);
        let mut sm = StreamManagement::restore(SmConfig::default(), &record);
        sm.handle(StreamEvent::Online).unwrap();

        let resume = sm.begin_resume().unwrap().unwrap();
        assert_eq!(resume.attr("h"), Some("12"));
        assert_eq!(resume.attr("previd"), Some("abc"));
    }
}
