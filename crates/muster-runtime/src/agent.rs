//! Per-agent runtime state: liveness, heartbeat cadence, event queue, and
//! the Idle ⇄ Busy state machine.
//!
//! Only the control loop touches these — no locks, no sharing.

use chrono::{DateTime, TimeZone, Utc};

use crate::dispatch::ExecutionHandle;
use crate::queue::{PendingEvent, PriorityEventQueue};

/// The one execution an agent may have outstanding.
pub struct InFlight {
    pub event: PendingEvent,
    pub started_at: DateTime<Utc>,
    pub handle: ExecutionHandle,
}

/// Runtime record of one agent. Not persisted beyond the liveness snapshot.
pub struct AgentState {
    pub agent_id: String,
    pub active: bool,
    pub heartbeat_secs: u64,
    pub last_heartbeat_emitted_at: Option<DateTime<Utc>>,
    pub queue: PriorityEventQueue,
    in_flight: Option<InFlight>,
}

impl AgentState {
    pub fn new(agent_id: &str, heartbeat_secs: u64, queue_capacity: usize) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            active: false,
            heartbeat_secs,
            last_heartbeat_emitted_at: None,
            queue: PriorityEventQueue::new(queue_capacity),
            in_flight: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Task id of the outstanding execution, if it is task-backed.
    pub fn in_flight_task(&self) -> Option<&str> {
        self.in_flight
            .as_ref()
            .and_then(|inflight| inflight.event.kind.task_id())
    }

    /// Idle → Busy. Caller must have checked `is_busy()`; a double submit
    /// would break the single-flight invariant.
    pub fn begin(&mut self, in_flight: InFlight) {
        debug_assert!(self.in_flight.is_none(), "agent already has an in-flight execution");
        self.in_flight = Some(in_flight);
    }

    /// Busy → Idle if the execution finished; returns what completed.
    /// Leaves the agent Busy when still running.
    pub fn try_harvest(
        &mut self,
    ) -> Option<(
        PendingEvent,
        muster_core::Result<muster_core::traits::ExecutionOutcome>,
    )> {
        let inflight = self.in_flight.as_mut()?;
        let result = inflight.handle.try_harvest()?;
        let inflight = self.in_flight.take().expect("in_flight checked above");
        Some((inflight.event, result))
    }

    /// Whether the quantized heartbeat boundary has passed.
    pub fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active || self.heartbeat_secs == 0 {
            return false;
        }
        match self.last_heartbeat_emitted_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.heartbeat_secs as i64,
        }
    }

    /// Advance the boundary: quantize `now` down to a whole multiple of the
    /// cadence, so emission stays aligned regardless of tick jitter.
    pub fn advance_heartbeat(&mut self, now: DateTime<Utc>) {
        let secs = self.heartbeat_secs as i64;
        let quantized = now.timestamp() - now.timestamp().rem_euclid(secs);
        self.last_heartbeat_emitted_at = Utc.timestamp_opt(quantized, 0).single();
    }
}
