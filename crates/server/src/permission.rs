//! Permission gate — per-session state machine pausing execution while a
//! human decides on a sensitive tool call.
//!
//! `Running` means input/output flow freely. `AwaitingDecision` holds
//! exactly one current request; further requests queue behind it, never
//! clobber it. Resolving requires naming the current request — a response
//! to a stale/previous request is a no-op, not an error.

use std::collections::VecDeque;

use gangway_protocol::PermissionRequest;

#[derive(Debug)]
enum GateState {
    Running,
    AwaitingDecision {
        current: PermissionRequest,
        queue: VecDeque<PermissionRequest>,
    },
}

/// Outcome of resolving a request against the gate
#[derive(Debug, PartialEq)]
pub enum Resolution {
    /// The named request was current; it has been removed and, if another
    /// request was queued, `next` is now the current one.
    Applied {
        request: PermissionRequest,
        next: Option<PermissionRequest>,
    },
    /// The named request is not the current one. No state change.
    Stale,
}

#[derive(Debug)]
pub struct PermissionGate {
    state: GateState,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGate {
    pub fn new() -> Self {
        Self {
            state: GateState::Running,
        }
    }

    /// True while a decision is outstanding. Output delivery and input
    /// forwarding are suspended in this state.
    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, GateState::AwaitingDecision { .. })
    }

    pub fn current(&self) -> Option<&PermissionRequest> {
        match &self.state {
            GateState::Running => None,
            GateState::AwaitingDecision { current, .. } => Some(current),
        }
    }

    /// Submit a new request. Returns true when it became the current one
    /// (the gate was `Running`); false when it queued behind an earlier
    /// outstanding request.
    pub fn submit(&mut self, request: PermissionRequest) -> bool {
        match &mut self.state {
            GateState::Running => {
                self.state = GateState::AwaitingDecision {
                    current: request,
                    queue: VecDeque::new(),
                };
                true
            }
            GateState::AwaitingDecision { queue, .. } => {
                queue.push_back(request);
                false
            }
        }
    }

    /// Resolve the current request by id. Promotes the next queued request,
    /// if any, to current.
    pub fn resolve(&mut self, request_id: &str) -> Resolution {
        match std::mem::replace(&mut self.state, GateState::Running) {
            GateState::Running => Resolution::Stale,
            GateState::AwaitingDecision { current, mut queue } => {
                if current.id != request_id {
                    self.state = GateState::AwaitingDecision { current, queue };
                    return Resolution::Stale;
                }
                let next = queue.pop_front();
                if let Some(promoted) = next.clone() {
                    self.state = GateState::AwaitingDecision {
                        current: promoted,
                        queue,
                    };
                }
                Resolution::Applied {
                    request: current,
                    next,
                }
            }
        }
    }

    /// Drop all outstanding requests (process exit, session teardown).
    /// Returns them so their reply slots can be answered with a denial.
    pub fn clear(&mut self) -> Vec<PermissionRequest> {
        match std::mem::replace(&mut self.state, GateState::Running) {
            GateState::Running => Vec::new(),
            GateState::AwaitingDecision { current, queue } => {
                let mut all = vec![current];
                all.extend(queue);
                all
            }
        }
    }
}
