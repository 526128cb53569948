//! Ordered stream feature negotiation.
//!
//! Features register for one of three phases. The pipeline runs them in
//! phase order (registration order within a phase) and stops early when a
//! feature reports [`Flow::Complete`]. Stream management registers twice:
//! resume before binding, enable after it, so an enable can never race the
//! bind and a resume always comes first.

use crate::error::SmError;
use crate::stream::ManagedStream;
use crate::transport::Transport;
use async_trait::async_trait;
use tracing::{debug, info};

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Before resource binding (stream resumption)
    PreBind,
    /// Resource binding
    Bind,
    /// After binding (stream management enable)
    PostBind,
}

/// What the pipeline does after a feature ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next feature
    Continue,
    /// Negotiation is complete for this stream
    Complete,
}

/// Result of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    /// Every feature ran
    Finished,
    /// The named feature ended negotiation early
    ShortCircuited(String),
}

/// A stream feature handler
#[async_trait]
pub trait Feature<T: Transport>: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Phase this handler runs in
    fn phase(&self) -> Phase;

    /// Negotiate the feature on `stream`
    async fn negotiate(&mut self, stream: &mut ManagedStream<T>) -> Result<Flow, SmError>;
}

/// Ordered list of feature handlers
pub struct FeaturePipeline<T: Transport> {
    features: Vec<Box<dyn Feature<T>>>,
}

impl<T: Transport + 'static> FeaturePipeline<T> {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
        }
    }

    /// Pipeline with stream management resume and enable registered
    pub fn with_stream_management() -> Self {
        let mut pipeline = Self::new();
        pipeline.register(ResumeFeature).register(EnableFeature);
        pipeline
    }

    /// Add a handler after those already registered for its phase
    pub fn register<F>(&mut self, feature: F) -> &mut Self
    where
        F: Feature<T> + 'static,
    {
        let phase = feature.phase();
        let at = self.features.partition_point(|f| f.phase() <= phase);
        self.features.insert(at, Box::new(feature));
        self
    }

    /// Handler names in run order
    pub fn order(&self) -> Vec<(Phase, String)> {
        self.features
            .iter()
            .map(|f| (f.phase(), f.name().to_string()))
            .collect()
    }

    /// Run every handler in order on `stream`
    pub async fn run(&mut self, stream: &mut ManagedStream<T>) -> Result<Negotiated, SmError> {
        for feature in self.features.iter_mut() {
            debug!("Negotiating {} ({:?})", feature.name(), feature.phase());
            if feature.negotiate(stream).await? == Flow::Complete {
                info!("Negotiation completed by {}", feature.name());
                return Ok(Negotiated::ShortCircuited(feature.name().to_string()));
            }
        }
        Ok(Negotiated::Finished)
    }
}

impl<T: Transport + 'static> Default for FeaturePipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream management resume, before binding
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeFeature;

#[async_trait]
impl<T: Transport + 'static> Feature<T> for ResumeFeature {
    fn name(&self) -> &str {
        "sm-resume"
    }

    fn phase(&self) -> Phase {
        Phase::PreBind
    }

    async fn negotiate(&mut self, stream: &mut ManagedStream<T>) -> Result<Flow, SmError> {
        if stream.resume().await? {
            Ok(Flow::Complete)
        } else {
            Ok(Flow::Continue)
        }
    }
}

/// Stream management enable, after binding
#[derive(Debug, Clone, Copy, Default)]
pub struct EnableFeature;

#[async_trait]
impl<T: Transport + 'static> Feature<T> for EnableFeature {
    fn name(&self) -> &str {
        "sm-enable"
    }

    fn phase(&self) -> Phase {
        Phase::PostBind
    }

    async fn negotiate(&mut self, stream: &mut ManagedStream<T>) -> Result<Flow, SmError> {
        stream.enable().await?;
        Ok(Flow::Continue)
    }
}
