//! Server state management.
//!
//! Owns the peer registry, the pending-signal buffer and the active call
//! records. All three sit behind one mutex so that every registry mutation,
//! including the partner-release cascade, happens in a single critical
//! section. The lock is never held across an `.await`; outbound frames are
//! pushed into per-connection unbounded channels, which never block.
//!
//! Roster fan-out takes a snapshot under the lock and sends outside it. A
//! recipient whose channel is closed is removed, and the fan-out repeats for
//! the shrunken set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::accounts::{AccountStore, AccountWrite, AccountWriter, Detached};
use crate::call::{self, ActiveCalls, CallError, CompletedCall};
use crate::pending::PendingSignals;
use crate::protocol::{PeerId, PeerSummary, ServerMessage};
use crate::registry::{CallState, ClientSender, Peer, PeerRegistry};

/// Default staleness threshold for heartbeats.
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Default liveness sweep period.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default number of buffered signals kept per peer.
const DEFAULT_MAX_PENDING_PER_PEER: usize = 256;

/// Default cap on distinct peers with buffered signals.
const DEFAULT_MAX_PENDING_TARGETS: usize = 1024;

/// Default lifetime of a buffered signal (5 minutes).
const DEFAULT_PENDING_TTL_SECS: u64 = 300;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_pending_per_peer: usize,
    pub max_pending_targets: usize,
    pub pending_ttl_secs: u64,
    /// Refuse connections that do not present a session token.
    pub require_token: bool,
    /// SQLite file for accounts and the call log. `None` runs detached.
    pub database_path: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_pending_per_peer: DEFAULT_MAX_PENDING_PER_PEER,
            max_pending_targets: DEFAULT_MAX_PENDING_TARGETS,
            pending_ttl_secs: DEFAULT_PENDING_TTL_SECS,
            require_token: false,
            database_path: None,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// Result of relaying a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Buffered,
    /// Undeliverable and the buffer refused it.
    Dropped,
}

/// Why a peer is leaving the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Its session ended.
    Disconnected,
    /// Heartbeat timed out.
    Expired,
    /// A roster push to it failed.
    Unreachable,
    /// The same identity registered again from a new session.
    Replaced,
}

impl Exit {
    /// Expiry is silent; the partner learns from the next roster.
    fn notifies_partner(self) -> bool {
        !matches!(self, Exit::Expired)
    }

    fn goes_offline(self) -> bool {
        !matches!(self, Exit::Replaced)
    }
}

/// A peer that just left the registry.
struct Departure {
    peer: Peer,
    exit: Exit,
    completed: Option<CompletedCall>,
}

struct Core {
    registry: PeerRegistry,
    pending: PendingSignals,
    calls: ActiveCalls,
}

impl Core {
    /// Remove `id`, release its partner, and close its call record.
    /// Pending signals survive a replacement; the new session flushes them.
    fn depart(&mut self, id: &str, exit: Exit, now: Instant) -> Option<Departure> {
        let peer = self.registry.remove(id)?;

        if exit == Exit::Replaced {
            let _ = peer.sender.send(ServerMessage::Error {
                message: "Signed in from another connection".to_string(),
            });
        } else {
            let dropped = self.pending.discard(id);
            if dropped > 0 {
                tracing::debug!(peer = id, dropped, "Discarded pending signals");
            }
        }

        let completed = match &peer.state {
            CallState::InCall(partner) => self.calls.finish(id, partner, now),
            _ => None,
        };

        if exit.notifies_partner() {
            if let Some(partner) = peer.state.partner().and_then(|p| self.registry.get(p)) {
                let _ = partner.sender.send(ServerMessage::PeerDisconnected {
                    peer_id: id.to_string(),
                    message: format!("{} disconnected", peer.display_name),
                });
            }
        }

        Some(Departure {
            peer,
            exit,
            completed,
        })
    }

    /// Whether the registry entry for `id` is bound to `sender`.
    fn owns(&self, id: &str, sender: &ClientSender) -> bool {
        self.registry
            .get(id)
            .map(|peer| peer.sender.same_channel(sender))
            .unwrap_or(false)
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    core: Arc<Mutex<Core>>,

    /// Account system collaborator (identity, profiles, call log).
    pub accounts: Arc<dyn AccountStore>,

    writes: AccountWriter,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create a relay state without an account store.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_accounts(config, Arc::new(Detached))
    }

    /// Create a relay state backed by the given account store.
    pub fn with_accounts(config: RelayConfig, accounts: Arc<dyn AccountStore>) -> Self {
        let core = Core {
            registry: PeerRegistry::new(),
            pending: PendingSignals::new(
                config.max_pending_per_peer,
                config.max_pending_targets,
                config.pending_ttl(),
            ),
            calls: ActiveCalls::new(),
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            writes: AccountWriter::start(accounts.clone()),
            accounts,
            config,
        }
    }

    // ── Peer Lifecycle ────────────────────────────────────────────────────

    /// Register a peer on `sender` and start its session.
    ///
    /// Buffered signals are flushed first, then `registered` is sent, then
    /// everyone gets a fresh roster. Returns the peer's color.
    pub fn register_peer(
        &self,
        id: &str,
        display_name: &str,
        avatar_url: Option<String>,
        sender: ClientSender,
    ) -> &'static str {
        let now = Instant::now();

        let (color, flushed, replaced) = {
            let mut core = self.core.lock();
            let replaced = core.depart(id, Exit::Replaced, now);
            let color = core
                .registry
                .add(id, sender.clone(), display_name, avatar_url, now);

            let backlog = core.pending.drain(id, now);
            let flushed = backlog.len();
            for message in backlog {
                let _ = sender.send(message);
            }

            let _ = sender.send(ServerMessage::Registered {
                user_id: id.to_string(),
                display_name: display_name.to_string(),
                color: color.to_string(),
                users: core.registry.list(Some(id)),
            });
            (color, flushed, replaced)
        };

        tracing::info!(peer = id, name = display_name, flushed, "Peer registered");

        if let Some(departure) = replaced {
            self.settle(vec![departure]);
        }
        self.persist_online(id, true);
        self.broadcast_roster();
        color
    }

    /// Tear down the peer bound to `sender`. A no-op if the entry has since
    /// been taken over by a newer session.
    pub fn teardown(&self, id: &str, sender: &ClientSender) -> bool {
        let departure = {
            let mut core = self.core.lock();
            if core.owns(id, sender) {
                core.depart(id, Exit::Disconnected, Instant::now())
            } else {
                None
            }
        };

        match departure {
            Some(departure) => {
                self.settle(vec![departure]);
                self.broadcast_roster();
                true
            }
            None => {
                tracing::debug!(peer = id, "Teardown skipped, entry not owned by session");
                false
            }
        }
    }

    /// Remove every peer whose heartbeat is older than the timeout, and drop
    /// expired pending signals. Returns the number of peers removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.config.heartbeat_timeout();

        let (departures, purged) = {
            let mut core = self.core.lock();
            let stale = core.registry.stale(now, timeout);
            let departures: Vec<Departure> = stale
                .iter()
                .filter_map(|id| core.depart(id, Exit::Expired, now))
                .collect();
            (departures, core.pending.purge_expired(now))
        };

        if purged > 0 {
            tracing::debug!(count = purged, "Purged expired pending signals");
        }

        let removed = departures.len();
        if removed > 0 {
            self.settle(departures);
            self.broadcast_roster();
        }
        removed
    }

    /// Refresh liveness for `id`.
    pub fn heartbeat(&self, id: &str) -> bool {
        self.core.lock().registry.touch(id, Instant::now())
    }

    /// Post-removal work that must not run under the lock.
    fn settle(&self, departures: Vec<Departure>) {
        for departure in departures {
            let id = departure.peer.id.as_str();
            tracing::info!(peer = id, exit = ?departure.exit, "Peer removed");

            if let Some(completed) = &departure.completed {
                self.persist_call(completed);
            }
            if departure.exit.goes_offline() {
                self.persist_online(id, false);
            }
        }
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Relay a negotiation payload. Undeliverable payloads are buffered for
    /// the target's next session instead of being dropped.
    pub fn relay_signal(&self, from: &str, to: &str, payload: Value) -> Delivery {
        let message = ServerMessage::Signal {
            sender_id: from.to_string(),
            payload,
        };

        let mut core = self.core.lock();
        let undelivered = match core.registry.get(to) {
            Some(peer) => peer.sender.send(message).err().map(|e| e.0),
            None => Some(message),
        };

        match undelivered {
            None => {
                tracing::debug!(from, to, "Relayed signal");
                Delivery::Delivered
            }
            Some(message) => {
                if core.pending.push(to, message, Instant::now()) {
                    tracing::debug!(from, to, "Signal target unreachable, buffered");
                    Delivery::Buffered
                } else {
                    Delivery::Dropped
                }
            }
        }
    }

    /// Push the roster to every live connection, each excluding itself.
    pub fn broadcast_roster(&self) {
        loop {
            let snapshot: Vec<(PeerId, ClientSender, ServerMessage)> = {
                let core = self.core.lock();
                core.registry
                    .senders()
                    .into_iter()
                    .map(|(id, sender)| {
                        let users = core.registry.list(Some(&id));
                        (id, sender, ServerMessage::UserList { users })
                    })
                    .collect()
            };

            let failed: Vec<(PeerId, ClientSender)> = snapshot
                .into_iter()
                .filter_map(|(id, sender, message)| {
                    sender.send(message).err().map(|_| (id, sender))
                })
                .collect();

            if failed.is_empty() {
                return;
            }

            let departures: Vec<Departure> = {
                let mut core = self.core.lock();
                let now = Instant::now();
                let mut departures = Vec::new();
                for (id, sender) in &failed {
                    // A newer session may have claimed the id meanwhile.
                    if !core.owns(id, sender) {
                        continue;
                    }
                    departures.extend(core.depart(id, Exit::Unreachable, now));
                }
                departures
            };

            if departures.is_empty() {
                return;
            }
            tracing::warn!(count = departures.len(), "Roster push failed, removing peers");
            self.settle(departures);
        }
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    /// Ring `target` on behalf of `caller`.
    pub fn request_call(&self, caller: &str, target: &str) -> Result<(), CallError> {
        {
            let mut core = self.core.lock();
            call::initiate(&mut core.registry, caller, target)?;

            let notice = core.registry.get(caller).map(|peer| ServerMessage::IncomingCall {
                caller_id: caller.to_string(),
                caller_name: peer.display_name.clone(),
                caller_color: peer.color.to_string(),
            });
            if let (Some(notice), Some(callee)) = (notice, core.registry.get(target)) {
                if callee.sender.send(notice).is_err() {
                    tracing::warn!(peer = target, "Failed to deliver incoming call");
                }
            }
        }

        tracing::info!(caller, target, "Call requested");
        self.broadcast_roster();
        Ok(())
    }

    /// Accept the call ringing `acceptor`.
    pub fn accept_call(&self, acceptor: &str) -> Result<PeerId, CallError> {
        let caller = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let caller = call::accept(&mut core.registry, &mut core.calls, acceptor, Instant::now())?;

            if let (Some(callee), Some(caller_peer)) =
                (core.registry.get(acceptor), core.registry.get(&caller))
            {
                let _ = caller_peer.sender.send(ServerMessage::CallAccepted {
                    callee_id: acceptor.to_string(),
                    callee_name: callee.display_name.clone(),
                });
            }
            caller
        };

        tracing::info!(caller = caller.as_str(), callee = acceptor, "Call accepted");
        self.broadcast_roster();
        Ok(caller)
    }

    /// Decline the call ringing `decliner`. `None` if there was none.
    pub fn decline_call(&self, decliner: &str) -> Option<PeerId> {
        let partner = {
            let mut core = self.core.lock();
            let partner = call::decline(&mut core.registry, decliner)?;
            if let Some(peer) = core.registry.get(&partner) {
                let _ = peer.sender.send(ServerMessage::CallDeclined {
                    decliner_id: decliner.to_string(),
                    message: "Call declined".to_string(),
                });
            }
            partner
        };

        tracing::info!(decliner, partner = partner.as_str(), "Call declined");
        self.broadcast_roster();
        Some(partner)
    }

    /// End (or cancel) `ender`'s call. `None` if there was none.
    pub fn end_call(&self, ender: &str) -> Option<PeerId> {
        let ended = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let ended = call::end(&mut core.registry, &mut core.calls, ender, Instant::now())?;
            if let Some(peer) = core.registry.get(&ended.partner) {
                let _ = peer.sender.send(ServerMessage::CallEnded {
                    peer_id: ender.to_string(),
                    message: "Call ended".to_string(),
                });
            }
            ended
        };

        tracing::info!(ender, partner = ended.partner.as_str(), "Call ended");
        if let Some(completed) = &ended.completed {
            self.persist_call(completed);
        }
        self.broadcast_roster();
        Some(ended.partner)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Roster as seen by `id`.
    pub fn roster(&self, id: &str) -> Vec<PeerSummary> {
        self.core.lock().registry.list(Some(id))
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.core.lock().registry.get(id).cloned()
    }

    /// Whether `id` is still bound to the session behind `sender`.
    pub fn owns_session(&self, id: &str, sender: &ClientSender) -> bool {
        self.core.lock().owns(id, sender)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.core.lock().registry.contains(id)
    }

    pub fn online_count(&self) -> usize {
        self.core.lock().registry.len()
    }

    pub fn active_call_count(&self) -> usize {
        self.core.lock().calls.len()
    }

    pub fn pending_count(&self) -> usize {
        self.core.lock().pending.len()
    }

    // ── Collaborator Calls ────────────────────────────────────────────────

    fn persist_online(&self, id: &str, online: bool) {
        self.writes.submit(AccountWrite::Online {
            peer: id.to_string(),
            online,
        });
    }

    fn persist_call(&self, completed: &CompletedCall) {
        self.writes.submit(AccountWrite::Call {
            caller: completed.caller.clone(),
            callee: completed.callee.clone(),
            duration_secs: completed.duration.as_secs(),
        });
    }
}
