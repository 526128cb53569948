//! Managed stream: a transport with stream management applied to its traffic.
//!
//! [`ManagedStream`] is the single owner of both the transport and the
//! [`StreamManagement`] state. Every operation takes `&mut self`, so events
//! for one stream are processed strictly one after another. Hosts that need
//! to share a stream across tasks wrap it in a `tokio::sync::Mutex`.

use crate::error::{SmError, TransportError};
use crate::features::{FeaturePipeline, Negotiated};
use crate::manager::{StreamEvent, StreamManagement};
use crate::store::ResumeStore;
use crate::transport::Transport;
use minidom::Element;
use sm_wire::{is_countable, NS_SM};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Transport plus stream management
pub struct ManagedStream<T> {
    transport: T,
    sm: StreamManagement,
    /// Elements read while waiting for a negotiation response
    inbox: VecDeque<Element>,
}

impl<T: Transport> ManagedStream<T> {
    /// Wrap a connected transport
    pub fn new(transport: T, sm: StreamManagement) -> Self {
        Self {
            transport,
            sm,
            inbox: VecDeque::new(),
        }
    }

    /// Stream management state
    pub fn sm(&self) -> &StreamManagement {
        &self.sm
    }

    /// Stream management state (mutable, for hosts driving negotiation by hand)
    pub fn sm_mut(&mut self) -> &mut StreamManagement {
        &mut self.sm
    }

    /// Underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Split into transport and state
    pub fn into_parts(self) -> (T, StreamManagement) {
        (self.transport, self.sm)
    }

    /// The stream came up: apply the reset policy
    pub fn online(&mut self) -> Result<(), SmError> {
        let out = self.sm.handle(StreamEvent::Online)?;
        debug_assert!(out.is_empty());
        Ok(())
    }

    /// Swap in a fresh connection and go online on it
    ///
    /// Returns the previous transport. Stanzas already read but not yet
    /// delivered stay queued.
    pub fn reconnect(&mut self, transport: T) -> Result<T, SmError> {
        let old = std::mem::replace(&mut self.transport, transport);
        self.online()?;
        Ok(old)
    }

    /// Run feature negotiation for the current stream
    pub async fn negotiate(&mut self, pipeline: &mut FeaturePipeline<T>) -> Result<Negotiated, SmError>
    where
        T: 'static,
    {
        pipeline.run(self).await
    }

    /// Write an element, then let stream management react to it
    ///
    /// Nothing is recorded when the write fails.
    pub async fn send(&mut self, element: Element) -> Result<(), SmError> {
        self.transport.send(element.clone()).await?;
        let out = self.sm.handle(StreamEvent::Sent(&element))?;
        self.write_all(out).await
    }

    /// Next element for the application
    ///
    /// Stream management elements are consumed here: `<r/>` and `<a/>` are
    /// handled, and negotiation answers nobody is waiting for are dropped.
    /// Everything else is returned after stream management has counted it.
    pub async fn recv(&mut self) -> Result<Option<Element>, SmError> {
        if let Some(element) = self.inbox.pop_front() {
            return Ok(Some(element));
        }

        loop {
            match self.read_one().await? {
                None => return Ok(None),
                Some(element) if element.has_ns(NS_SM) => discard_unsolicited(&element),
                Some(element) => return Ok(Some(element)),
            }
        }
    }

    /// Send an element and wait for the stream-level answer to it
    ///
    /// The answer is the first element that is neither a countable stanza nor
    /// `<r/>`/`<a/>`. Stanzas arriving in between are counted and queued for
    /// [`ManagedStream::recv`].
    pub async fn send_receive(&mut self, element: Element) -> Result<Element, SmError> {
        self.send(element).await?;
        self.receive_matching(is_negotiation_response).await
    }

    /// Send an element and wait for the first element accepted by `matches`
    pub async fn send_receive_matching<F>(&mut self, element: Element, matches: F) -> Result<Element, SmError>
    where
        F: Fn(&Element) -> bool + Send + Sync,
    {
        self.send(element).await?;
        self.receive_matching(matches).await
    }

    /// Try to reattach the stored session; `false` means "go on and enable"
    pub async fn resume(&mut self) -> Result<bool, SmError> {
        let request = match self.sm.begin_resume()? {
            Some(request) => request,
            None => return Ok(false),
        };

        match self.send_receive_matching(request, is_resume_response).await {
            Ok(response) => self.sm.resume_response(&response),
            Err(e) if e.is_resume_fallback() => {
                self.sm.resume_failed(&e.to_string());
                Ok(false)
            }
            Err(e) => {
                self.sm.resume_failed(&e.to_string());
                Err(e)
            }
        }
    }

    /// Enable stream management on a bound stream
    pub async fn enable(&mut self) -> Result<(), SmError> {
        let request = self.sm.begin_enable()?;

        if let Err(e) = self.send(request).await {
            self.sm.enable_failed(&e.to_string());
            return Err(e);
        }
        self.sm.enable_sent();

        let response = match self.receive_matching(is_enable_response).await {
            Ok(response) => response,
            Err(e) => {
                self.sm.enable_failed(&e.to_string());
                return Err(e);
            }
        };

        let out = self.sm.enable_response(&response)?;
        self.write_all(out).await
    }

    /// Save or clear the resumable session in `store`
    pub async fn checkpoint<S>(&self, store: &S, key: &str) -> Result<(), SmError>
    where
        S: ResumeStore + ?Sized,
    {
        match self.sm.resume_record() {
            Some(record) => store.save(key, &record).await?,
            None => store.clear(key).await?,
        }
        Ok(())
    }

    async fn receive_matching<F>(&mut self, matches: F) -> Result<Element, SmError>
    where
        F: Fn(&Element) -> bool + Send + Sync,
    {
        let timeout = self.sm.config().response_timeout;
        match tokio::time::timeout(timeout, self.await_matching(&matches)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No response within {:?}", timeout);
                Err(SmError::Timeout(timeout))
            }
        }
    }

    async fn await_matching<F>(&mut self, matches: &F) -> Result<Element, SmError>
    where
        F: Fn(&Element) -> bool + Send + Sync,
    {
        loop {
            let element = self
                .read_one()
                .await?
                .ok_or(SmError::Transport(TransportError::Closed))?;

            if matches(&element) {
                return Ok(element);
            }
            if element.has_ns(NS_SM) {
                discard_unsolicited(&element);
            } else {
                trace!("Queued <{}/> while awaiting response", element.name());
                self.inbox.push_back(element);
            }
        }
    }

    async fn read_one(&mut self) -> Result<Option<Element>, SmError> {
        let element = match self.transport.recv().await? {
            Some(element) => element,
            None => return Ok(None),
        };
        let out = self.sm.handle(StreamEvent::Received(&element))?;
        self.write_all(out).await?;
        Ok(Some(element))
    }

    async fn write_all(&mut self, elements: Vec<Element>) -> Result<(), SmError> {
        for element in elements {
            debug!("Sending <{}/>", element.name());
            self.transport.send(element).await?;
        }
        Ok(())
    }
}

fn is_ack_traffic(element: &Element) -> bool {
    element.is("r", NS_SM) || element.is("a", NS_SM)
}

fn discard_unsolicited(element: &Element) {
    if !is_ack_traffic(element) {
        debug!("Discarding unsolicited <{}/>", element.name());
    }
}

/// Whether `element` can answer `<enable/>` or `<resume/>`
pub fn is_negotiation_response(element: &Element) -> bool {
    !is_countable(element) && !is_ack_traffic(element)
}

/// Whether `element` can answer `<resume/>`: `<resumed/>`, `<failed/>` or a
/// non stream management element such as a stream error
pub fn is_resume_response(element: &Element) -> bool {
    if element.has_ns(NS_SM) {
        element.name() == "resumed" || element.name() == "failed"
    } else {
        !is_countable(element)
    }
}

/// Whether `element` can answer `<enable/>`: `<enabled/>`, `<failed/>` or a
/// non stream management element such as a stream error
pub fn is_enable_response(element: &Element) -> bool {
    if element.has_ns(NS_SM) {
        element.name() == "enabled" || element.name() == "failed"
    } else {
        !is_countable(element)
    }
}
