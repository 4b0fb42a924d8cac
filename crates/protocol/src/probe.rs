//! Readiness probe state machine.
//!
//! Pure transition function deciding, per browser tab, which proxy
//! addressing scheme is reachable. Phase 1 probes the path-based address
//! with exponential backoff until the proxy marker is seen or attempts run
//! out; phase 2 makes exactly one probe against the port-based address.
//! The decision is terminal until a fresh `StartProbe`.
//!
//! The server's side of this contract is the `X-Proxy-Active` header set on
//! every gateway response; see [`PROXY_ACTIVE_HEADER`].

use std::time::Duration;

use crate::types::ProxyMode;

/// Marker header the gateway sets on every response, ready or not.
pub const PROXY_ACTIVE_HEADER: &str = "x-proxy-active";

/// Path-based probe attempts before giving up.
pub const MAX_PATH_ATTEMPTS: u32 = 10;

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 4_000;

/// What a single probe response told us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Response carried the proxy marker header.
    Ready,
    /// No marker (or a network error): the gateway is not reachable there.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    /// Begin (or restart, e.g. on a new target URL) the two-phase probe.
    StartProbe,
    PathResponse(ProbeOutcome),
    PortResponse(ProbeOutcome),
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    /// Probing the path-based address; `attempt` counts from 1.
    PathProbing { attempt: u32 },
    /// Marker seen on the path; one probe against the port-based address.
    PortChecking,
    Decided { mode: ProxyMode },
    Exhausted,
    Aborted,
}

/// Advance the probe machine. Responses that do not match the current phase
/// (late arrivals after an abort or a decision) leave the state unchanged.
pub fn transition(state: ProbeState, event: ProbeEvent) -> ProbeState {
    match (state, event) {
        (_, ProbeEvent::Abort) => ProbeState::Aborted,
        (_, ProbeEvent::StartProbe) => ProbeState::PathProbing { attempt: 1 },

        (ProbeState::PathProbing { .. }, ProbeEvent::PathResponse(ProbeOutcome::Ready)) => {
            ProbeState::PortChecking
        }
        (ProbeState::PathProbing { attempt }, ProbeEvent::PathResponse(ProbeOutcome::NotReady)) => {
            if attempt >= MAX_PATH_ATTEMPTS {
                ProbeState::Exhausted
            } else {
                ProbeState::PathProbing {
                    attempt: attempt + 1,
                }
            }
        }

        (ProbeState::PortChecking, ProbeEvent::PortResponse(ProbeOutcome::Ready)) => {
            ProbeState::Decided {
                mode: ProxyMode::PortBased,
            }
        }
        (ProbeState::PortChecking, ProbeEvent::PortResponse(ProbeOutcome::NotReady)) => {
            ProbeState::Decided {
                mode: ProxyMode::PathBased,
            }
        }

        // Out-of-phase responses are stale; ignore them.
        (state, _) => state,
    }
}

/// Delay before the next path-based attempt. Exponential from 250ms, capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_ready_moves_to_port_check() {
        let state = ProbeState::PathProbing { attempt: 3 };
        assert_eq!(
            transition(state, ProbeEvent::PathResponse(ProbeOutcome::Ready)),
            ProbeState::PortChecking
        );
    }

    #[test]
    fn path_attempts_exhaust_at_max() {
        let state = ProbeState::PathProbing {
            attempt: MAX_PATH_ATTEMPTS,
        };
        assert_eq!(
            transition(state, ProbeEvent::PathResponse(ProbeOutcome::NotReady)),
            ProbeState::Exhausted
        );
    }

    #[test]
    fn port_response_decides_mode() {
        assert_eq!(
            transition(
                ProbeState::PortChecking,
                ProbeEvent::PortResponse(ProbeOutcome::Ready)
            ),
            ProbeState::Decided {
                mode: ProxyMode::PortBased
            }
        );
        assert_eq!(
            transition(
                ProbeState::PortChecking,
                ProbeEvent::PortResponse(ProbeOutcome::NotReady)
            ),
            ProbeState::Decided {
                mode: ProxyMode::PathBased
            }
        );
    }

    #[test]
    fn five_not_ready_then_ready_walk() {
        let mut state = transition(ProbeState::Idle, ProbeEvent::StartProbe);
        for expected_attempt in 1..=5u32 {
            assert_eq!(
                state,
                ProbeState::PathProbing {
                    attempt: expected_attempt
                }
            );
            state = transition(state, ProbeEvent::PathResponse(ProbeOutcome::NotReady));
        }
        assert_eq!(state, ProbeState::PathProbing { attempt: 6 });
        state = transition(state, ProbeEvent::PathResponse(ProbeOutcome::Ready));
        assert_eq!(state, ProbeState::PortChecking);
    }

    #[test]
    fn decision_is_terminal_without_fresh_start() {
        let decided = ProbeState::Decided {
            mode: ProxyMode::PathBased,
        };
        // Late responses do not re-enter probing.
        assert_eq!(
            transition(decided, ProbeEvent::PathResponse(ProbeOutcome::Ready)),
            decided
        );
        assert_eq!(
            transition(decided, ProbeEvent::PortResponse(ProbeOutcome::Ready)),
            decided
        );
        // A new target URL restarts the whole probe.
        assert_eq!(
            transition(decided, ProbeEvent::StartProbe),
            ProbeState::PathProbing { attempt: 1 }
        );
    }

    #[test]
    fn abort_wins_from_any_state() {
        for state in [
            ProbeState::Idle,
            ProbeState::PathProbing { attempt: 4 },
            ProbeState::PortChecking,
            ProbeState::Exhausted,
        ] {
            assert_eq!(transition(state, ProbeEvent::Abort), ProbeState::Aborted);
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(250));
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10), Duration::from_millis(4000));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(4000));
    }
}
