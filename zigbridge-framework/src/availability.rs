//! Per-device availability publishing.
//!
//! Each device has a retained `<base>/<device>/availability` topic carrying
//! `online` or `offline`. The tracker remembers what was last published so a
//! topic is only written when the value actually changes.
//!
//! # Example
//!
//! ```ignore
//! use zigbridge_framework::AvailabilityTracker;
//!
//! let mut tracker = AvailabilityTracker::new(bus.clone(), topics.clone());
//!
//! tracker.set("kitchen_lamp", Availability::Online)?;
//!
//! // Device left the network
//! tracker.forget("kitchen_lamp")?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use zigbridge_common::{Availability, TopicBuilder};

use crate::bus::BusPublisher;
use crate::error::Result;

/// Tracks and publishes availability for every known device.
pub struct AvailabilityTracker {
    bus: Arc<dyn BusPublisher>,
    topics: TopicBuilder,
    /// Last value published per device name.
    published: HashMap<String, Availability>,
}

impl std::fmt::Debug for AvailabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityTracker")
            .field("base", &self.topics.base())
            .field("devices", &self.published.len())
            .finish()
    }
}

impl AvailabilityTracker {
    /// Create a tracker publishing under the given topics.
    pub fn new(bus: Arc<dyn BusPublisher>, topics: TopicBuilder) -> Self {
        Self {
            bus,
            topics,
            published: HashMap::new(),
        }
    }

    /// Set a device's availability, publishing only on change.
    ///
    /// Returns whether anything was published.
    pub fn set(&mut self, device: &str, availability: Availability) -> Result<bool> {
        if self.published.get(device) == Some(&availability) {
            return Ok(false);
        }

        self.bus.publish(
            &self.topics.device_availability(device),
            availability.as_str().as_bytes().to_vec(),
            true,
        )?;
        self.published.insert(device.to_string(), availability);

        tracing::debug!(device = %device, availability = %availability, "Availability changed");
        Ok(true)
    }

    /// Current availability of a device, if ever published.
    pub fn get(&self, device: &str) -> Option<Availability> {
        self.published.get(device).copied()
    }

    /// Clear a device's retained availability and stop tracking it.
    pub fn forget(&mut self, device: &str) -> Result<()> {
        if self.published.remove(device).is_some() {
            // An empty retained payload deletes the retained message.
            self.bus
                .publish(&self.topics.device_availability(device), Vec::new(), true)?;
            tracing::debug!(device = %device, "Availability cleared");
        }
        Ok(())
    }

    /// Move a device's availability to a new name.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if let Some(availability) = self.published.get(from).copied() {
            self.forget(from)?;
            self.set(to, availability)?;
        }
        Ok(())
    }
}
