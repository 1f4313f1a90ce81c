//! Two-party call state machine.
//!
//! ```text
//!   Available ──initiate──► Calling / Receiving ──accept──► InCall
//!       ▲                          │                          │
//!       └──────── decline / end ───┴────────── end ───────────┘
//! ```
//!
//! Every transition is applied to both participants through
//! `PeerRegistry::set_status`, so a caller holding the registry never observes
//! a half-applied transition. Accepted calls get an `ActiveCall` record keyed by
//! the canonical pair id; it is used to compute the duration reported when the
//! call ends.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::PeerId;
use crate::registry::{CallState, PeerRegistry};

/// A call operation that was refused. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("You cannot call yourself")]
    SelfCall,

    #[error("User '{0}' is not online")]
    UnknownPeer(PeerId),

    #[error("You are already in a call")]
    CallerBusy,

    #[error("User '{0}' is busy")]
    TargetBusy(PeerId),

    #[error("There is no incoming call to accept")]
    NoIncomingCall,
}

/// Order-independent key for the unordered pair `{a, b}`: the lexically
/// smaller id, an underscore, then the larger one.
pub fn call_id(a: &str, b: &str) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}_{}", low, high)
}

/// An accepted call.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub caller: PeerId,
    pub callee: PeerId,
    pub started_at: Instant,
}

/// A call that just finished after being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub caller: PeerId,
    pub callee: PeerId,
    pub duration: Duration,
}

/// Accepted calls keyed by canonical pair id.
#[derive(Debug, Default)]
pub struct ActiveCalls {
    calls: HashMap<String, ActiveCall>,
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, caller: &str, callee: &str, now: Instant) {
        self.calls.insert(
            call_id(caller, callee),
            ActiveCall {
                caller: caller.to_string(),
                callee: callee.to_string(),
                started_at: now,
            },
        );
    }

    /// Close the record for `{a, b}`, if there is one.
    pub fn finish(&mut self, a: &str, b: &str, now: Instant) -> Option<CompletedCall> {
        let call = self.calls.remove(&call_id(a, b))?;
        Some(CompletedCall {
            duration: now.saturating_duration_since(call.started_at),
            caller: call.caller,
            callee: call.callee,
        })
    }

    #[cfg(test)]
    pub fn get(&self, a: &str, b: &str) -> Option<&ActiveCall> {
        self.calls.get(&call_id(a, b))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Outcome of `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ended {
    pub partner: PeerId,
    /// Present only when the call had been accepted.
    pub completed: Option<CompletedCall>,
}

/// Whether `caller` may ring `target` right now. No request queueing: a busy
/// target is refused and the caller retries.
pub fn can_call(registry: &PeerRegistry, caller: &str, target: &str) -> Result<(), CallError> {
    if caller == target {
        return Err(CallError::SelfCall);
    }
    let caller_peer = registry
        .get(caller)
        .ok_or_else(|| CallError::UnknownPeer(caller.to_string()))?;
    let target_peer = registry
        .get(target)
        .ok_or_else(|| CallError::UnknownPeer(target.to_string()))?;

    if caller_peer.state != CallState::Available {
        return Err(CallError::CallerBusy);
    }
    if target_peer.state != CallState::Available {
        return Err(CallError::TargetBusy(target.to_string()));
    }
    Ok(())
}

/// Ring `target`: caller becomes `Calling(target)`, target `Receiving(caller)`.
pub fn initiate(registry: &mut PeerRegistry, caller: &str, target: &str) -> Result<(), CallError> {
    can_call(registry, caller, target)?;
    registry.set_status(caller, CallState::Calling(target.to_string()));
    registry.set_status(target, CallState::Receiving(caller.to_string()));
    Ok(())
}

/// Accept the call ringing `acceptor`. Returns the caller's id.
///
/// The partner must still be `Calling` the acceptor; a call that was already
/// cancelled is refused without touching any state.
pub fn accept(
    registry: &mut PeerRegistry,
    calls: &mut ActiveCalls,
    acceptor: &str,
    now: Instant,
) -> Result<PeerId, CallError> {
    let caller = registry
        .get(acceptor)
        .and_then(|peer| peer.state.partner())
        .map(str::to_string)
        .ok_or(CallError::NoIncomingCall)?;

    let still_calling = registry
        .get(&caller)
        .map(|peer| peer.state == CallState::Calling(acceptor.to_string()))
        .unwrap_or(false);
    if !still_calling {
        return Err(CallError::NoIncomingCall);
    }

    registry.set_status(acceptor, CallState::InCall(caller.clone()));
    registry.set_status(&caller, CallState::InCall(acceptor.to_string()));
    calls.start(&caller, acceptor, now);
    Ok(caller)
}

/// Decline a call that is still ringing, from either side. Returns the former
/// partner, or `None` when there was nothing to decline. An accepted call can
/// only be left through `end`, which closes its record.
pub fn decline(registry: &mut PeerRegistry, decliner: &str) -> Option<PeerId> {
    let partner = match &registry.get(decliner)?.state {
        CallState::Calling(p) | CallState::Receiving(p) => p.clone(),
        CallState::Available | CallState::InCall(_) => return None,
    };
    registry.set_status(decliner, CallState::Available);
    registry.set_status(&partner, CallState::Available);
    Some(partner)
}

/// End (or cancel) the current call. Returns `None` when the peer had no
/// partner, which makes repeated calls harmless.
pub fn end(
    registry: &mut PeerRegistry,
    calls: &mut ActiveCalls,
    ender: &str,
    now: Instant,
) -> Option<Ended> {
    let state = registry.get(ender)?.state.clone();
    let partner = state.partner()?.to_string();

    registry.set_status(ender, CallState::Available);
    registry.set_status(&partner, CallState::Available);

    let completed = match state {
        CallState::InCall(_) => calls.finish(ender, &partner, now),
        _ => None,
    };
    Some(Ended { partner, completed })
}
