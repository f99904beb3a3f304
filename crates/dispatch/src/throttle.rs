//! Per-endpoint preview admission.
//!
//! A counter per endpoint, not a queue: a preview that finds every slot
//! taken is dropped, never buffered. Admitted previews hold a ticket that
//! is redeemed exactly once, either by the consumer reporting the preview
//! fetched or by the release timeout, whichever comes first.

use std::collections::HashMap;

use fleet_core::types::EndpointId;

/// Outcome of [`PreviewThrottle::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; redeem the ticket to free it.
    Granted { ticket: u64 },
    /// Every slot was busy. The run keeps the drop count.
    Dropped,
    /// Previews are switched off.
    Disabled,
}

#[derive(Debug)]
pub struct PreviewThrottle {
    max_per_endpoint: usize,
    enabled: bool,
    in_flight: Vec<usize>,
    tickets: HashMap<u64, EndpointId>,
    next_ticket: u64,
}

impl PreviewThrottle {
    pub fn new(endpoints: usize, max_per_endpoint: usize, enabled: bool) -> Self {
        Self {
            max_per_endpoint,
            enabled,
            in_flight: vec![0; endpoints],
            tickets: HashMap::new(),
            next_ticket: 1,
        }
    }

    /// Check-and-increment the endpoint's counter.
    ///
    /// Returns `false` when previews are disabled, the endpoint is
    /// unknown, or the endpoint is at its limit.
    pub fn admit(&mut self, endpoint: EndpointId) -> bool {
        if !self.enabled {
            return false;
        }
        match self.in_flight.get_mut(endpoint) {
            Some(count) if *count < self.max_per_endpoint => {
                *count += 1;
                true
            }
            _ => false,
        }
    }

    /// Decrement the endpoint's counter, floored at zero.
    pub fn release(&mut self, endpoint: EndpointId) {
        if let Some(count) = self.in_flight.get_mut(endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    /// Admit a preview and hand out a ticket.
    pub fn try_acquire(&mut self, endpoint: EndpointId) -> Admission {
        if !self.enabled {
            return Admission::Disabled;
        }
        if !self.admit(endpoint) {
            return Admission::Dropped;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.tickets.insert(ticket, endpoint);
        Admission::Granted { ticket }
    }

    /// Free the slot held by `ticket`. Returns `false` if the ticket was
    /// already redeemed or never issued.
    pub fn redeem(&mut self, ticket: u64) -> bool {
        match self.tickets.remove(&ticket) {
            Some(endpoint) => {
                self.release(endpoint);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self, endpoint: EndpointId) -> usize {
        self.in_flight.get(endpoint).copied().unwrap_or(0)
    }

    pub fn max_per_endpoint(&self) -> usize {
        self.max_per_endpoint
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
