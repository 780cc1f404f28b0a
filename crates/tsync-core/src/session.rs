use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use git_sync::MergeVerdict;
use lan_peers::Peer;
use serde::Serialize;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Offering,
    AwaitingRequest,
    Transferring,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    fn allows(self, to: Phase, role: Role) -> bool {
        use Phase::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Connecting) => role == Role::Client,
            (Idle, Connected) => role == Role::Server,
            (Connecting, Connected) => true,
            (Connected, Offering) => role == Role::Server,
            (Connected, AwaitingRequest) => role == Role::Client,
            (Offering | AwaitingRequest, Transferring) => true,
            (Offering | AwaitingRequest, Completed) => true,
            (Transferring, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Imported {
        project_id: String,
        /// A local copy existed and the received history was merged into it
        merged: bool,
        /// Classifier verdict, present when `merged`
        verdict: Option<MergeVerdict>,
    },
    Declined,
    Sent {
        project_id: String,
        bytes: u64,
    },
    Failed {
        reason: String,
    },
}

/// State of one device-to-device exchange.
#[derive(Debug)]
pub struct TransferSession {
    id: String,
    role: Role,
    phase: Phase,
    peer: Peer,
    project_id: Option<String>,
    failure: Option<String>,
}

impl TransferSession {
    pub fn new(role: Role, peer: Peer) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            phase: Phase::Idle,
            peer,
            project_id: None,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn set_project(&mut self, project_id: impl Into<String>) {
        self.project_id = Some(project_id.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn advance(&mut self, to: Phase) -> Result<(), TransferError> {
        if !self.phase.allows(to, self.role) {
            return Err(TransferError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::debug!("session {} {:?} -> {:?}", self.id, self.phase, to);
        self.phase = to;
        Ok(())
    }

    /// Move to `Failed` unless already terminal. Returns whether it moved.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        let reason = reason.into();
        tracing::warn!(
            "session {} with {} failed in {:?}: {}",
            self.id,
            self.peer.alias,
            self.phase,
            reason
        );
        self.phase = Phase::Failed;
        self.failure = Some(reason);
        true
    }
}

/// Whole percent of `done` out of `total`; an empty transfer is complete.
pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total).saturating_mul(100) / total) as u8
}

/// Peers (by IP) with a live session. Shared by the server and client roles
/// of one device so a peer never has two sessions at once.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashMap<IpAddr, Role>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, ip: IpAddr, role: Role) -> Result<SessionClaim, TransferError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&ip) {
            return Err(TransferError::PeerBusy(ip));
        }
        active.insert(ip, role);
        Ok(SessionClaim {
            registry: self.clone(),
            ip,
        })
    }

    pub fn is_active(&self, ip: IpAddr) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&ip)
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Released when dropped.
pub struct SessionClaim {
    registry: SessionRegistry,
    ip: IpAddr,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.ip);
    }
}
