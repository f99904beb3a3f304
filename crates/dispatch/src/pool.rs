//! Endpoint occupancy and event attribution.
//!
//! Each endpoint holds at most one [`Assignment`]. Raw events are
//! attributed to the assignment's job; events that name a handle the
//! endpoint already retired, or that arrive while the endpoint is idle,
//! are superseded.

use std::collections::HashSet;

use serde::Serialize;

use fleet_core::error::CoreError;
use fleet_core::types::{EndpointId, EngineHandle, JobId, RunId};

use crate::throttle::PreviewThrottle;

/// The job currently bound to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: JobId,
    pub run_id: RunId,
    /// Engine handle, once known.
    pub handle: Option<EngineHandle>,
}

#[derive(Debug, Default)]
struct Slot {
    available: bool,
    assignment: Option<Assignment>,
    retired: HashSet<EngineHandle>,
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub endpoint: EndpointId,
    pub available: bool,
    pub job_id: Option<JobId>,
    pub previews_in_flight: usize,
}

#[derive(Debug)]
pub struct EndpointPool {
    slots: Vec<Slot>,
    previews: PreviewThrottle,
}

impl EndpointPool {
    pub fn new(endpoints: usize, max_previews: usize, previews_enabled: bool) -> Self {
        Self {
            slots: (0..endpoints)
                .map(|_| Slot {
                    available: true,
                    ..Slot::default()
                })
                .collect(),
            previews: PreviewThrottle::new(endpoints, max_previews, previews_enabled),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lowest-index endpoint that is available and holds no job.
    pub fn find_idle(&self) -> Option<EndpointId> {
        self.slots
            .iter()
            .position(|slot| slot.available && slot.assignment.is_none())
    }

    /// Bind `job_id` to an idle endpoint.
    pub fn assign(
        &mut self,
        endpoint: EndpointId,
        job_id: JobId,
        run_id: RunId,
    ) -> Result<(), CoreError> {
        let slot = self.slot_mut(endpoint)?;
        if !slot.available {
            return Err(CoreError::EndpointUnavailable {
                job_id: Some(job_id),
            });
        }
        if let Some(current) = &slot.assignment {
            return Err(CoreError::invalid_state(
                Some(job_id),
                format!("endpoint {endpoint} is busy with job {}", current.job_id),
            ));
        }
        slot.assignment = Some(Assignment {
            job_id,
            run_id,
            handle: None,
        });
        Ok(())
    }

    /// Record the handle `submit` returned for `job_id`.
    ///
    /// Returns `false` when the endpoint no longer holds that job; the
    /// handle is then retired so its late events are discarded.
    pub fn set_handle(&mut self, endpoint: EndpointId, job_id: JobId, handle: EngineHandle) -> bool {
        let Some(slot) = self.slots.get_mut(endpoint) else {
            return false;
        };
        match slot.assignment.as_mut() {
            Some(assignment) if assignment.job_id == job_id => {
                assignment.handle = Some(handle);
                true
            }
            _ => {
                slot.retired.insert(handle);
                false
            }
        }
    }

    /// Free the endpoint and retire its job's handle.
    pub fn release(&mut self, endpoint: EndpointId) -> Option<Assignment> {
        let slot = self.slots.get_mut(endpoint)?;
        let assignment = slot.assignment.take()?;
        if let Some(handle) = &assignment.handle {
            slot.retired.insert(handle.clone());
        }
        Some(assignment)
    }

    pub fn assignment(&self, endpoint: EndpointId) -> Option<&Assignment> {
        self.slots.get(endpoint)?.assignment.as_ref()
    }

    /// Resolve which job a raw event is about.
    ///
    /// An event naming a new handle is adopted by an assignment whose
    /// handle is not yet known (events can outrun `submit`'s return).
    pub fn attribute(
        &mut self,
        endpoint: EndpointId,
        run_id: Option<RunId>,
        handle: Option<&str>,
    ) -> Result<JobId, CoreError> {
        let superseded = CoreError::SupersededEvent { endpoint, run_id };
        let slot = self.slot_mut(endpoint)?;
        let Some(assignment) = slot.assignment.as_mut() else {
            return Err(superseded);
        };
        if Some(assignment.run_id) != run_id {
            return Err(superseded);
        }
        match handle {
            None => Ok(assignment.job_id),
            Some(h) if slot.retired.contains(h) => Err(superseded),
            Some(h) => match &assignment.handle {
                Some(known) if known == h => Ok(assignment.job_id),
                Some(_) => Err(superseded),
                None => {
                    assignment.handle = Some(h.to_string());
                    Ok(assignment.job_id)
                }
            },
        }
    }

    /// Exclude the endpoint from dispatch for the rest of the run.
    pub fn mark_unavailable(&mut self, endpoint: EndpointId) {
        if let Some(slot) = self.slots.get_mut(endpoint) {
            slot.available = false;
        }
    }

    pub fn is_available(&self, endpoint: EndpointId) -> bool {
        self.slots.get(endpoint).is_some_and(|slot| slot.available)
    }

    /// Re-enable every endpoint and forget retired handles. Called when a
    /// new run starts.
    pub fn reset_availability(&mut self) {
        for slot in &mut self.slots {
            slot.available = true;
            slot.retired.clear();
        }
    }

    pub fn endpoint_of(&self, job_id: JobId) -> Option<EndpointId> {
        self.slots.iter().position(|slot| {
            slot.assignment
                .as_ref()
                .is_some_and(|assignment| assignment.job_id == job_id)
        })
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.assignment.is_some()).count()
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.available).count()
    }

    pub fn previews(&self) -> &PreviewThrottle {
        &self.previews
    }

    pub fn previews_mut(&mut self) -> &mut PreviewThrottle {
        &mut self.previews
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.slots
            .iter()
            .enumerate()
            .map(|(endpoint, slot)| EndpointStatus {
                endpoint,
                available: slot.available,
                job_id: slot.assignment.as_ref().map(|a| a.job_id),
                previews_in_flight: self.previews.in_flight(endpoint),
            })
            .collect()
    }

    fn slot_mut(&mut self, endpoint: EndpointId) -> Result<&mut Slot, CoreError> {
        self.slots
            .get_mut(endpoint)
            .ok_or_else(|| CoreError::not_found("endpoint", endpoint))
    }
}
