//! Acknowledgment exchange: `<r/>` and `<a/>` handling around stanza traffic.

use crate::config::SmConfig;
use crate::error::SmError;
use crate::state::SessionState;
use minidom::Element;
use sm_wire::{is_countable, Nonza, NS_SM};
use tracing::{debug, trace};

/// Reacts to sent and received elements, mutating the counters
#[derive(Debug, Clone)]
pub struct AckExchange {
    /// Send `<r/>` after this many countable stanzas
    request_every: u32,
    /// Pending set limit
    max_pending: usize,
    /// Countable stanzas sent since the last `<r/>`
    since_request: u32,
}

impl AckExchange {
    /// Create an exchange from configuration
    pub fn new(config: &SmConfig) -> Self {
        Self {
            request_every: config.request_interval(),
            max_pending: config.max_pending,
            since_request: 0,
        }
    }

    /// Handle an element the host just sent
    ///
    /// Returns an `<r/>` to send when tracking is enabled and the request
    /// policy calls for one.
    pub fn on_send(&mut self, state: &mut SessionState, element: &Element) -> Option<Element> {
        if !state.enabled() || !is_countable(element) {
            return None;
        }

        let seq = state.record_outbound_attempt(element);
        state.trim_pending(self.max_pending);
        self.since_request += 1;
        trace!("Recorded outbound <{}/> seq={}", element.name(), seq);

        if self.since_request >= self.request_every {
            Some(self.request())
        } else {
            None
        }
    }

    /// Handle an element the host just received
    ///
    /// Countable stanzas are counted before anything else looks at them. An
    /// `<r/>` is answered with the inbound count at the time of the reply.
    pub fn on_receive(
        &mut self,
        state: &mut SessionState,
        element: &Element,
    ) -> Result<Option<Element>, SmError> {
        if is_countable(element) {
            state.record_inbound();
            return Ok(None);
        }

        if element.is("r", NS_SM) {
            let h = state.inbound();
            debug!("Answering ack request with h={}", h);
            return Ok(Some(sm_wire::ack(h)));
        }

        if element.is("a", NS_SM) {
            if let Nonza::Ack { h } = Nonza::try_from(element)? {
                debug!("Peer acknowledged h={}", h);
                state.record_acked_outbound(h);
            }
        }

        Ok(None)
    }

    /// Build an `<r/>` and restart the request interval
    pub fn request(&mut self) -> Element {
        self.since_request = 0;
        sm_wire::request()
    }

    /// Forget the request interval progress
    pub fn reset(&mut self) {
        self.since_request = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence() -> Element {
        Element::builder("presence", "jabber:client").build()
    }

    fn enabled_state() -> SessionState {
        let mut state = SessionState::new();
        state.mark_enabled(Some("abc".to_string()), Some(600));
        state
    }

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn test_no_request_while_disabled() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = SessionState::new();

        for _ in 0..3 {
            assert!(exchange.on_send(&mut state, &presence()).is_none());
        }
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_request_after_each_stanza() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();

        let r = exchange.on_send(&mut state, &presence()).unwrap();
        assert!(r.is("r", NS_SM));
        assert_eq!(state.pending_len(), 1);
    }

    #[test]
    fn test_nonza_send_is_not_counted() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();

        assert!(exchange.on_send(&mut state, &sm_wire::request()).is_none());
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_batched_requests() {
        let config = SmConfig {
            request_every: 3,
            ..Default::default()
        };
        let mut exchange = AckExchange::new(&config);
        let mut state = enabled_state();

        assert!(exchange.on_send(&mut state, &presence()).is_none());
        assert!(exchange.on_send(&mut state, &presence()).is_none());
        assert!(exchange.on_send(&mut state, &presence()).is_some());
        assert!(exchange.on_send(&mut state, &presence()).is_none());
    }

    #[test]
    fn test_request_answered_with_current_inbound() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();

        for _ in 0..3 {
            exchange.on_receive(&mut state, &presence()).unwrap();
        }
        let reply = exchange
            .on_receive(&mut state, &parse("<r xmlns='urn:xmpp:sm:3'/>"))
            .unwrap()
            .unwrap();
        assert!(reply.is("a", NS_SM));
        assert_eq!(reply.attr("h"), Some("3"));

        exchange.on_receive(&mut state, &presence()).unwrap();
        let reply = exchange
            .on_receive(&mut state, &parse("<r xmlns='urn:xmpp:sm:3'/>"))
            .unwrap()
            .unwrap();
        assert_eq!(reply.attr("h"), Some("4"));
    }

    #[test]
    fn test_request_answered_while_disabled() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = SessionState::new();

        let reply = exchange
            .on_receive(&mut state, &parse("<r xmlns='urn:xmpp:sm:3'/>"))
            .unwrap();
        assert_eq!(reply.unwrap().attr("h"), Some("0"));
    }

    #[test]
    fn test_ack_overwrites_outbound() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();

        exchange
            .on_receive(&mut state, &parse("<a xmlns='urn:xmpp:sm:3' h='7'/>"))
            .unwrap();
        assert_eq!(state.outbound(), 7);

        exchange
            .on_receive(&mut state, &parse("<a xmlns='urn:xmpp:sm:3' h='2'/>"))
            .unwrap();
        assert_eq!(state.outbound(), 2);
    }

    #[test]
    fn test_malformed_ack_is_protocol_error() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();
        state.record_acked_outbound(4);

        let err = exchange
            .on_receive(&mut state, &parse("<a xmlns='urn:xmpp:sm:3'/>"))
            .unwrap_err();
        assert!(matches!(err, SmError::Protocol(_)));

        let err = exchange
            .on_receive(&mut state, &parse("<a xmlns='urn:xmpp:sm:3' h='many'/>"))
            .unwrap_err();
        assert!(matches!(err, SmError::Protocol(_)));

        // State untouched by the bad acks
        assert_eq!(state.outbound(), 4);
    }

    #[test]
    fn test_other_namespaces_ignored() {
        let mut exchange = AckExchange::new(&SmConfig::default());
        let mut state = enabled_state();

        let reply = exchange
            .on_receive(&mut state, &parse("<r xmlns='urn:example:other'/>"))
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(state.inbound(), 0);
    }
}
