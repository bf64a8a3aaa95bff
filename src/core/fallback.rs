//! Degraded implementations and the policy that selects them.
//!
//! A [`FallbackPolicy`] pairs a [`Fallback`] with the availability of the
//! task's primary backend, checked once when the policy is created. The
//! executor then chooses:
//!
//! - primary unavailable: run the fallback directly, never the primary
//! - primary fails (after retries): run the fallback
//! - otherwise: the primary's result stands

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::TaskContext;
use super::task::TaskError;

/// Result of probing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Unreachable, with the reason reported by the probe.
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

/// Checks whether a task's primary backend can be reached.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    /// Name of the probed backend, for logs.
    fn backend(&self) -> &str;

    async fn probe(&self) -> Availability;
}

/// A degraded implementation of a task.
///
/// A fallback sees the same declared reads and writes as the task it
/// stands in for, through a fresh [`TaskContext`].
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError>;

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}

/// Fallback attached to a task at registration.
#[derive(Clone)]
pub struct FallbackPolicy {
    fallback: Arc<dyn Fallback>,
    availability: Availability,
}

impl FallbackPolicy {
    /// Policy whose primary is assumed reachable.
    pub fn new(fallback: impl Fallback + 'static) -> Self {
        Self::from_arc(Arc::new(fallback))
    }

    /// Policy from a shared fallback.
    pub fn from_arc(fallback: Arc<dyn Fallback>) -> Self {
        Self {
            fallback,
            availability: Availability::Available,
        }
    }

    /// Policy whose primary availability is probed now.
    pub async fn probed<P>(fallback: impl Fallback + 'static, probe: &P) -> Self
    where
        P: AvailabilityProbe + ?Sized,
    {
        let availability = probe.probe().await;
        match &availability {
            Availability::Available => {
                debug!(backend = probe.backend(), "backend available");
            }
            Availability::Unavailable(reason) => {
                warn!(
                    backend = probe.backend(),
                    reason = %reason,
                    "backend unavailable, fallback will be used"
                );
            }
        }
        Self::new(fallback).with_availability(availability)
    }

    /// Builder: override the recorded availability.
    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// Whether the primary should be attempted at all.
    pub fn primary_available(&self) -> bool {
        self.availability.is_available()
    }

    pub fn fallback(&self) -> &dyn Fallback {
        self.fallback.as_ref()
    }
}

impl fmt::Debug for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("description", &self.fallback.description())
            .field("availability", &self.availability)
            .finish()
    }
}
