//! Context shared by every proxy instance of one interception session.

use std::sync::Arc;

use crate::events::EventSink;
use crate::firewall::Firewall;

/// Collaborators a proxy instance needs from its surrounding session.
#[derive(Clone)]
pub struct Session {
    /// Interface whose inbound traffic gets redirected.
    pub interface: String,
    pub firewall: Arc<dyn Firewall>,
    pub events: Arc<dyn EventSink>,
}

impl Session {
    pub fn new(
        interface: impl Into<String>,
        firewall: Arc<dyn Firewall>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            interface: interface.into(),
            firewall,
            events,
        }
    }
}
