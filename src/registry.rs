//! Peer registry.
//!
//! The authoritative map from peer id to connection handle, display metadata,
//! call state and liveness timestamp. The registry itself is a plain owned
//! structure; `RelayState` serializes access to it.
//!
//! Call partners are symmetric: if A is in a call state pointing at B, then B
//! points back at A. `set_status` and `remove` are the only mutation points for
//! call state and both repair the previous partner in the same step.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::{PeerId, PeerStatus, PeerSummary, ServerMessage};

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Palette used for roster avatars.
const AVATAR_COLORS: [&str; 10] = [
    "#0088cc", "#00a884", "#ff6b6b", "#51cf66", "#ffd43b", "#20c997", "#be4bdb", "#f76707",
    "#339af0", "#ff8787",
];

/// Stable hash-to-palette mapping; purely cosmetic.
pub fn avatar_color(id: &str) -> &'static str {
    let sum = id.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
    AVATAR_COLORS[sum % AVATAR_COLORS.len()]
}

/// Call state of a peer. The partner is carried by the variant, so a partner
/// exists exactly when the peer is not `Available`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Available,
    Calling(PeerId),
    Receiving(PeerId),
    InCall(PeerId),
}

impl CallState {
    pub fn status(&self) -> PeerStatus {
        match self {
            CallState::Available => PeerStatus::Available,
            CallState::Calling(_) => PeerStatus::Calling,
            CallState::Receiving(_) => PeerStatus::Receiving,
            CallState::InCall(_) => PeerStatus::InCall,
        }
    }

    pub fn partner(&self) -> Option<&str> {
        match self {
            CallState::Available => None,
            CallState::Calling(p) | CallState::Receiving(p) | CallState::InCall(p) => Some(p),
        }
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub color: &'static str,
    pub state: CallState,
    pub last_heartbeat: Instant,
    /// Non-owning handle; the connection session owns the socket.
    pub sender: ClientSender,
}

impl Peer {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            status: self.state.status(),
            color: self.color.to_string(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// In-memory peer registry.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return its display color.
    ///
    /// An existing entry under the same id is removed first (partner released),
    /// so a reconnecting identity always starts `Available`.
    pub fn add(
        &mut self,
        id: &str,
        sender: ClientSender,
        display_name: &str,
        avatar_url: Option<String>,
        now: Instant,
    ) -> &'static str {
        if self.remove(id).is_some() {
            tracing::info!(peer = id, "Replaced existing registry entry");
        }

        let color = avatar_color(id);
        self.peers.insert(
            id.to_string(),
            Peer {
                id: id.to_string(),
                display_name: display_name.to_string(),
                avatar_url,
                color,
                state: CallState::Available,
                last_heartbeat: now,
                sender,
            },
        );
        color
    }

    /// Remove a peer, releasing its partner back to `Available`.
    /// Returns the removed entry, or `None` if the id was not registered.
    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        let peer = self.peers.remove(id)?;
        if let Some(partner) = peer.state.partner() {
            self.release(partner, id);
        }
        Some(peer)
    }

    /// Set a peer's call state. If this moves the peer away from a previous
    /// partner, that partner is reset to `Available` when it still points back.
    pub fn set_status(&mut self, id: &str, state: CallState) -> bool {
        let previous = match self.peers.get_mut(id) {
            Some(peer) => std::mem::replace(&mut peer.state, state),
            None => return false,
        };

        if let Some(old_partner) = previous.partner() {
            let current_partner = self.peers.get(id).and_then(|p| p.state.partner());
            if current_partner != Some(old_partner) {
                let old_partner = old_partner.to_string();
                self.release(&old_partner, id);
            }
        }
        true
    }

    /// Reset `partner` to `Available` if it is still paired with `from`.
    fn release(&mut self, partner: &str, from: &str) {
        if let Some(peer) = self.peers.get_mut(partner) {
            if peer.state.partner() == Some(from) {
                tracing::debug!(peer = partner, released_from = from, "Released call partner");
                peer.state = CallState::Available;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Roster as seen by `excluding`, sorted case-insensitively by display name.
    pub fn list(&self, excluding: Option<&str>) -> Vec<PeerSummary> {
        let mut users: Vec<PeerSummary> = self
            .peers
            .values()
            .filter(|peer| Some(peer.id.as_str()) != excluding)
            .map(Peer::summary)
            .collect();
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        users
    }

    /// Refresh a peer's liveness timestamp.
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Ids of peers whose last heartbeat is older than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_heartbeat) > timeout)
            .map(|peer| peer.id.clone())
            .collect()
    }

    /// Stable copy of every live handle, for fan-out outside the registry.
    pub fn senders(&self) -> Vec<(PeerId, ClientSender)> {
        self.peers
            .values()
            .map(|peer| (peer.id.clone(), peer.sender.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
