//! Scripted stream management scenario against an in-process peer.
//!
//! The peer plays the receiving entity: it binds a resource, grants or
//! rejects `<enable/>` and `<resume/>`, echoes messages, answers `<r/>` and
//! sends its own `<r/>` after each echo. Sessions it granted survive link
//! drops for the lifetime of the process.

use crate::config::{SimConfig, StoreMode};
use crate::{component_debug, component_info, component_warn};
use anyhow::{Context, Result};
use async_trait::async_trait;
use minidom::Element;
use sm_session::{
    Feature, FeaturePipeline, FileStore, Flow, ManagedStream, MemoryStore, MemoryTransport,
    NegotiationState, Negotiated, Phase, ResumeStore, SmError, StreamManagement, Transport,
};
use sm_wire::{is_countable, Nonza, NS_SM, NS_STANZAS};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const NS_CLIENT: &str = "jabber:client";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// How the peer answers a negotiation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAnswer {
    /// Accept it
    Grant,
    /// Answer `<failed/>`
    Reject,
    /// Never answer
    Ignore,
}

impl FromStr for PeerAnswer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(PeerAnswer::Grant),
            "reject" => Ok(PeerAnswer::Reject),
            "ignore" => Ok(PeerAnswer::Ignore),
            other => Err(format!("invalid peer answer '{}', use grant, reject or ignore", other)),
        }
    }
}

/// Scenario settings
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Session and store configuration
    pub config: SimConfig,
    /// Messages exchanged on each connection
    pub stanzas: u32,
    /// Link drops after the first connection
    pub reconnects: u32,
    /// Peer behaviour for `<enable/>`
    pub peer_enable: PeerAnswer,
    /// Peer behaviour for `<resume/>`
    pub peer_resume: PeerAnswer,
    /// Resumption window the peer grants, in seconds
    pub peer_max_resume: u32,
}

/// Outcome of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    /// Whether the previous session was reattached
    pub resumed: bool,
    /// Negotiation state after the pipeline ran
    pub negotiation: NegotiationState,
    /// Inbound count at the end of the connection
    pub inbound: u32,
    /// Outbound count at the end of the connection
    pub outbound: u32,
    /// Session id at the end of the connection
    pub session_id: String,
    /// Stanzas still awaiting acknowledgment
    pub pending: usize,
}

/// Run the scenario and report every connection
pub async fn run(scenario: &Scenario) -> Result<Vec<ConnectionReport>> {
    let store = open_store(&scenario.config.store);
    let entity = scenario.config.entity.as_str();

    let sm = match store.load_live(entity).await? {
        Some(record) => {
            component_info!("client", "Found stored session {} (h={})", record.session_id, record.h);
            StreamManagement::restore(scenario.config.sm_config(), &record)
        }
        None => StreamManagement::new(scenario.config.sm_config()),
    };

    let peer = SimPeer::new(scenario);
    let (ours, theirs) = MemoryTransport::pair();
    let mut serving = peer.accept(theirs);
    let mut stream = ManagedStream::new(ours, sm);
    stream.online()?;

    let mut pipeline = FeaturePipeline::with_stream_management();
    pipeline.register(BindFeature::new("sim"));

    let mut reports = Vec::new();
    for connection in 0..=scenario.reconnects {
        if connection > 0 {
            component_info!("client", "Link dropped; reconnecting ({}/{})", connection, scenario.reconnects);
            let (ours, theirs) = MemoryTransport::pair();
            let next = peer.accept(theirs);
            drop(stream.reconnect(ours)?);
            serving.await.context("peer task failed")?;
            serving = next;
        }

        let resumed = negotiate(&mut stream, &mut pipeline).await?;
        exchange(&mut stream, scenario.stanzas).await?;
        stream.checkpoint(store.as_ref(), entity).await?;

        let state = stream.sm().state();
        let report = ConnectionReport {
            resumed,
            negotiation: stream.sm().negotiation(),
            inbound: state.inbound(),
            outbound: state.outbound(),
            session_id: state.session_id().to_string(),
            pending: state.pending_len(),
        };
        component_info!(
            "client",
            "Connection {} done: resumed={} inbound={} outbound={} pending={}",
            connection,
            report.resumed,
            report.inbound,
            report.outbound,
            report.pending
        );
        reports.push(report);
    }

    drop(stream);
    serving.await.context("peer task failed")?;
    Ok(reports)
}

fn open_store(mode: &StoreMode) -> Box<dyn ResumeStore> {
    match mode {
        StoreMode::Memory => Box::new(MemoryStore::new()),
        StoreMode::File { dir } => Box::new(FileStore::new(dir)),
    }
}

/// Run negotiation; a rejected or unanswered enable leaves the stream unmanaged
async fn negotiate(
    stream: &mut ManagedStream<MemoryTransport>,
    pipeline: &mut FeaturePipeline<MemoryTransport>,
) -> Result<bool> {
    match stream.negotiate(pipeline).await {
        Ok(Negotiated::ShortCircuited(_)) => Ok(stream.sm().negotiation() == NegotiationState::Resumed),
        Ok(Negotiated::Finished) => Ok(false),
        Err(e) if stream.sm().negotiation() == NegotiationState::Failed && !matches!(e, SmError::Transport(_)) => {
            component_warn!("client", "Continuing without stream management: {}", e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Send `count` messages and read their echoes
async fn exchange(stream: &mut ManagedStream<MemoryTransport>, count: u32) -> Result<()> {
    for i in 0..count {
        let body = format!("ping {}", i);
        stream.send(message(&body)).await?;

        let echo = stream
            .recv()
            .await?
            .context("peer closed the stream")?;
        component_debug!(
            "client",
            "Received <{}/> {:?}",
            echo.name(),
            echo.get_child("body", NS_CLIENT).map(|b| b.text())
        );
    }
    Ok(())
}

fn message(body: &str) -> Element {
    Element::builder("message", NS_CLIENT)
        .attr("type", "chat")
        .append(Element::builder("body", NS_CLIENT).append(body.to_string()).build())
        .build()
}

/// Resource binding over an `<iq type='set'/>` round trip
pub struct BindFeature {
    resource: String,
    next_id: u32,
}

impl BindFeature {
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            next_id: 0,
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> Feature<T> for BindFeature {
    fn name(&self) -> &str {
        "bind"
    }

    fn phase(&self) -> Phase {
        Phase::Bind
    }

    async fn negotiate(&mut self, stream: &mut ManagedStream<T>) -> Result<Flow, SmError> {
        self.next_id += 1;
        let id = format!("bind-{}", self.next_id);
        let request = Element::builder("iq", NS_CLIENT)
            .attr("type", "set")
            .attr("id", id.as_str())
            .append(
                Element::builder("bind", NS_BIND)
                    .append(Element::builder("resource", NS_BIND).append(self.resource.clone()).build())
                    .build(),
            )
            .build();

        let response = stream
            .send_receive_matching(request, |e| {
                e.is("iq", NS_CLIENT) && e.attr("id") == Some(id.as_str())
            })
            .await?;

        match response.attr("type") {
            Some("result") => {
                let jid = response
                    .get_child("bind", NS_BIND)
                    .and_then(|b| b.get_child("jid", NS_BIND))
                    .map(|j| j.text())
                    .unwrap_or_default();
                component_info!("client", "Bound as {}", jid);
                Ok(Flow::Continue)
            }
            _ => Err(SmError::UnexpectedResponse(format!(
                "iq type={}",
                response.attr("type").unwrap_or("none")
            ))),
        }
    }
}

/// Counters the peer keeps for a granted session
#[derive(Debug, Clone, Copy, Default)]
struct PeerSession {
    /// Countable stanzas received from the client
    handled: u32,
    /// Countable stanzas sent to the client
    sent: u32,
}

/// In-process receiving entity
#[derive(Clone)]
pub struct SimPeer {
    enable: PeerAnswer,
    resume: PeerAnswer,
    max_resume: u32,
    sessions: Arc<Mutex<HashMap<String, PeerSession>>>,
    next_session: Arc<Mutex<u32>>,
}

impl SimPeer {
    pub fn new(scenario: &Scenario) -> Self {
        Self {
            enable: scenario.peer_enable,
            resume: scenario.peer_resume,
            max_resume: scenario.peer_max_resume,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: Arc::new(Mutex::new(0)),
        }
    }

    /// Serve one connection until the client drops it
    pub fn accept(&self, transport: MemoryTransport) -> JoinHandle<()> {
        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.serve(transport).await {
                component_warn!("peer", "Connection ended with error: {}", e);
            }
        })
    }

    async fn serve(&self, mut transport: MemoryTransport) -> Result<()> {
        let mut session: Option<String> = None;
        let mut counters = PeerSession::default();

        while let Some(element) = transport.recv().await? {
            if is_countable(&element) && session.is_some() {
                counters.handled = counters.handled.wrapping_add(1);
            }

            let replies = if element.is("enable", NS_SM) {
                self.on_enable(&element, &mut session, &mut counters).await
            } else if element.is("resume", NS_SM) {
                self.on_resume(&element, &mut session, &mut counters).await?
            } else if element.is("r", NS_SM) {
                vec![sm_wire::ack(counters.handled)]
            } else if element.is("a", NS_SM) {
                if let Nonza::Ack { h } = Nonza::try_from(&element)? {
                    component_debug!("peer", "Client acknowledged {} of {}", h, counters.sent);
                }
                Vec::new()
            } else if element.is("iq", NS_CLIENT) && element.get_child("bind", NS_BIND).is_some() {
                vec![bind_result(&element)]
            } else if element.is("message", NS_CLIENT) {
                let body = element
                    .get_child("body", NS_CLIENT)
                    .map(|b| b.text())
                    .unwrap_or_default();
                let mut replies = vec![message(&format!("echo: {}", body))];
                if session.is_some() {
                    counters.sent = counters.sent.wrapping_add(1);
                    replies.push(sm_wire::request());
                }
                replies
            } else {
                Vec::new()
            };

            if let Some(id) = &session {
                self.sessions.lock().await.insert(id.clone(), counters);
            }
            for reply in replies {
                if transport.send(reply).await.is_err() {
                    component_debug!("peer", "Client went away mid-reply");
                    return Ok(());
                }
            }
        }

        component_debug!("peer", "Client closed the stream");
        Ok(())
    }

    async fn on_enable(
        &self,
        element: &Element,
        session: &mut Option<String>,
        counters: &mut PeerSession,
    ) -> Vec<Element> {
        match self.enable {
            PeerAnswer::Grant => {
                let id = {
                    let mut next = self.next_session.lock().await;
                    *next += 1;
                    format!("sim-{}", *next)
                };
                let resume = element.attr("resume") == Some("true") || element.attr("resume") == Some("1");
                component_info!("peer", "Enabled session {} (resume={})", id, resume);

                *counters = PeerSession::default();
                let enabled = Nonza::Enabled {
                    id: resume.then(|| id.clone()),
                    max: resume.then_some(self.max_resume),
                    resume,
                };
                *session = Some(id);
                vec![enabled.to_element()]
            }
            PeerAnswer::Reject => {
                component_info!("peer", "Rejecting enable");
                vec![failed(None, "unexpected-request")]
            }
            PeerAnswer::Ignore => {
                component_info!("peer", "Ignoring enable");
                Vec::new()
            }
        }
    }

    async fn on_resume(
        &self,
        element: &Element,
        session: &mut Option<String>,
        counters: &mut PeerSession,
    ) -> Result<Vec<Element>> {
        let (h, previd) = match Nonza::try_from(element)? {
            Nonza::Resume { h, previd } => (h, previd),
            _ => return Ok(Vec::new()),
        };

        if self.resume == PeerAnswer::Ignore {
            component_info!("peer", "Ignoring resume of {}", previd);
            return Ok(Vec::new());
        }

        let known = self.sessions.lock().await.get(&previd).copied();
        match known {
            Some(previous) if self.resume == PeerAnswer::Grant => {
                let unacked = previous.sent.wrapping_sub(h);
                component_info!(
                    "peer",
                    "Resumed {} (client handled {}, {} unacknowledged)",
                    previd,
                    h,
                    unacked
                );
                *counters = previous;
                *session = Some(previd.clone());
                Ok(vec![Nonza::Resumed {
                    h: Some(previous.handled),
                    previd: Some(previd),
                }
                .to_element()])
            }
            _ => {
                component_info!("peer", "Unknown or refused session {}", previd);
                Ok(vec![failed(known.map(|s| s.handled), "item-not-found")])
            }
        }
    }
}

fn failed(h: Option<u32>, condition: &str) -> Element {
    let mut builder = Element::builder("failed", NS_SM);
    if let Some(h) = h {
        builder = builder.attr("h", h.to_string());
    }
    builder
        .append(Element::builder(condition, NS_STANZAS).build())
        .build()
}

fn bind_result(request: &Element) -> Element {
    let resource = request
        .get_child("bind", NS_BIND)
        .and_then(|b| b.get_child("resource", NS_BIND))
        .map(|r| r.text())
        .unwrap_or_else(|| "sim".to_string());

    Element::builder("iq", NS_CLIENT)
        .attr("type", "result")
        .attr("id", request.attr("id").unwrap_or_default())
        .append(
            Element::builder("bind", NS_BIND)
                .append(
                    Element::builder("jid", NS_BIND)
                        .append(format!("user@example.com/{}", resource))
                        .build(),
                )
                .build(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn scenario() -> Scenario {
        Scenario {
            config: SimConfig::default(),
            stanzas: 3,
            reconnects: 1,
            peer_enable: PeerAnswer::Grant,
            peer_resume: PeerAnswer::Grant,
            peer_max_resume: 300,
        }
    }

    #[test]
    fn test_peer_answer_from_str() {
        assert_eq!("grant".parse::<PeerAnswer>().unwrap(), PeerAnswer::Grant);
        assert_eq!("ignore".parse::<PeerAnswer>().unwrap(), PeerAnswer::Ignore);
        assert!("maybe".parse::<PeerAnswer>().is_err());
    }

    #[tokio::test]
    async fn test_enable_then_resume() {
        let reports = run(&scenario()).await.unwrap();
        assert_eq!(reports.len(), 2);

        assert!(!reports[0].resumed);
        assert_eq!(reports[0].negotiation, NegotiationState::Enabled);
        assert_eq!(reports[0].inbound, 3);
        assert_eq!(reports[0].session_id, "sim-1");

        assert!(reports[1].resumed);
        assert_eq!(reports[1].session_id, "sim-1");
        // Counters continue across the link drop
        assert_eq!(reports[1].inbound, 6);
    }

    #[tokio::test]
    async fn test_rejected_resume_enables_new_session() {
        let reports = run(&Scenario {
            peer_resume: PeerAnswer::Reject,
            ..scenario()
        })
        .await
        .unwrap();

        assert!(!reports[1].resumed);
        assert_eq!(reports[1].negotiation, NegotiationState::Enabled);
        assert_eq!(reports[1].session_id, "sim-2");
        assert_eq!(reports[1].inbound, 3);
    }

    #[tokio::test]
    async fn test_rejected_enable_continues_unmanaged() {
        let reports = run(&Scenario {
            peer_enable: PeerAnswer::Reject,
            reconnects: 0,
            ..scenario()
        })
        .await
        .unwrap();

        assert_eq!(reports[0].negotiation, NegotiationState::Failed);
        assert_eq!(reports[0].session_id, "");
        assert_eq!(reports[0].pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_resume_times_out_and_falls_back() {
        let mut base = scenario();
        base.config.response_timeout = Duration::from_secs(2);
        let reports = run(&Scenario {
            peer_resume: PeerAnswer::Ignore,
            ..base
        })
        .await
        .unwrap();

        assert!(!reports[1].resumed);
        assert_eq!(reports[1].session_id, "sim-2");
    }

    #[tokio::test]
    async fn test_file_store_keeps_session_across_runs() {
        let dir = TempDir::new().unwrap();
        let mut config = SimConfig::default();
        config.store = StoreMode::File {
            dir: dir.path().to_path_buf(),
        };
        let single = Scenario {
            config,
            reconnects: 0,
            ..scenario()
        };

        run(&single).await.unwrap();
        let stored = FileStore::new(dir.path())
            .load(&single.config.entity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.session_id, "sim-1");
        assert_eq!(stored.h, 3);

        // A new process has a new peer that does not know the session
        let reports = run(&single).await.unwrap();
        assert!(!reports[0].resumed);
        assert_eq!(reports[0].negotiation, NegotiationState::Enabled);
    }
}
