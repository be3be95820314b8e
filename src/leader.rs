//! Leader election among the local instances of one storage scope.
//!
//! There is no coordinator other than the shared [`LocalStore`]: the leader
//! token is a versioned record updated with compare-and-swap, and a lease
//! that is not renewed expires so a crashed leader's slot can be reclaimed.
//! Only the instance holding an unexpired token may talk to the remote.

use crate::clock::{chrono_duration, Clock};
use crate::store::{CasResult, LocalStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// CAS conflicts are retried this many times before giving up on one attempt.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Identifier of one local instance (window, tab, embedded view).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease record stored once per storage scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderToken {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Incremented every time a different holder takes the token
    pub epoch: u64,
}

impl LeaderToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, candidate: &InstanceId) -> bool {
        self.holder_id == candidate.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("leadership held by {holder} until {expires_at}")]
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    #[error("lost leadership (current holder: {})", .holder.as_deref().unwrap_or("none"))]
    LostLeadership { holder: Option<String> },
    #[error("leader token kept changing during {0} attempts")]
    Contended(usize),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Acquire/renew/release protocol over the leader token record.
#[derive(Clone)]
pub struct LeaderElection {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    scope: String,
    lease: Duration,
}

impl LeaderElection {
    pub fn new(
        store: Arc<LocalStore>,
        clock: Arc<dyn Clock>,
        scope: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            scope: scope.into(),
            lease,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Read the current token, expired or not.
    pub fn current(&self) -> Result<Option<LeaderToken>, ElectionError> {
        Ok(self.store.leader_token(&self.scope)?)
    }

    /// Take the token if it is free or expired, or renew it if already held.
    pub fn acquire(
        &self,
        candidate: &InstanceId,
        lease: Duration,
    ) -> Result<LeaderToken, ElectionError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.leader_token(&self.scope)?;

            let next = match &current {
                Some(token) if token.is_held_by(candidate) => LeaderToken {
                    expires_at: now + chrono_duration(lease),
                    ..token.clone()
                },
                Some(token) if !token.is_expired_at(now) => {
                    return Err(ElectionError::Held {
                        holder: token.holder_id.clone(),
                        expires_at: token.expires_at,
                    });
                }
                _ => LeaderToken {
                    holder_id: candidate.0.clone(),
                    acquired_at: now,
                    expires_at: now + chrono_duration(lease),
                    epoch: current.as_ref().map(|t| t.epoch + 1).unwrap_or(1),
                },
            };

            match self
                .store
                .compare_and_set_leader(&self.scope, current.as_ref(), Some(&next))?
            {
                CasResult::Swapped => {
                    if current.as_ref().map(|t| t.epoch) != Some(next.epoch) {
                        info!(
                            "[leader] {} acquired leadership of '{}' (epoch {})",
                            candidate, self.scope, next.epoch
                        );
                    }
                    return Ok(next);
                }
                CasResult::Conflict { .. } => {
                    debug!("[leader] CAS conflict for {}, retrying", candidate);
                }
            }
        }
        Err(ElectionError::Contended(MAX_CAS_ATTEMPTS))
    }

    /// Extend the lease of a token this instance still holds.
    ///
    /// Fails with [`ElectionError::LostLeadership`] if another instance has
    /// taken over (for example after this one was suspended past expiry).
    pub fn renew(&self, candidate: &InstanceId) -> Result<LeaderToken, ElectionError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.leader_token(&self.scope)?;

            let token = match &current {
                Some(token) if token.is_held_by(candidate) => token,
                other => {
                    return Err(ElectionError::LostLeadership {
                        holder: other.as_ref().map(|t| t.holder_id.clone()),
                    });
                }
            };
            let next = LeaderToken {
                expires_at: now + chrono_duration(self.lease),
                ..token.clone()
            };

            match self
                .store
                .compare_and_set_leader(&self.scope, current.as_ref(), Some(&next))?
            {
                CasResult::Swapped => return Ok(next),
                CasResult::Conflict { .. } => continue,
            }
        }
        Err(ElectionError::Contended(MAX_CAS_ATTEMPTS))
    }

    /// Give up leadership immediately. Returns whether a token was cleared.
    pub fn release(&self, candidate: &InstanceId) -> Result<bool, ElectionError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.leader_token(&self.scope)?;
            match &current {
                Some(token) if token.is_held_by(candidate) => {}
                _ => return Ok(false),
            }
            if let CasResult::Swapped =
                self.store
                    .compare_and_set_leader(&self.scope, current.as_ref(), None)?
            {
                info!("[leader] {} released leadership of '{}'", candidate, self.scope);
                return Ok(true);
            }
        }
        Err(ElectionError::Contended(MAX_CAS_ATTEMPTS))
    }
}

/// An instance's own view of the lease it was last granted.
#[derive(Debug, Clone, Default)]
pub struct Leadership {
    token: Option<LeaderToken>,
}

impl Leadership {
    pub fn granted(&mut self, token: LeaderToken) {
        self.token = Some(token);
    }

    pub fn revoke(&mut self) -> Option<LeaderToken> {
        self.token.take()
    }

    pub fn token(&self) -> Option<&LeaderToken> {
        self.token.as_ref()
    }

    /// Whether the last granted lease is still unexpired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.token
            .as_ref()
            .map(|t| !t.is_expired_at(now))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const LEASE: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<ManualClock>, LeaderElection) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::default());
        let election = LeaderElection::new(store, clock.clone(), "default", LEASE);
        (clock, election)
    }

    #[test]
    fn test_acquire_free_slot() {
        let (clock, election) = setup();
        let a = InstanceId::new("a");
        let token = election.acquire(&a, LEASE).unwrap();
        assert_eq!(token.holder_id, "a");
        assert_eq!(token.epoch, 1);
        assert_eq!(token.expires_at, clock.now() + chrono_duration(LEASE));
    }

    #[test]
    fn test_second_candidate_is_refused_until_expiry() {
        let (clock, election) = setup();
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        election.acquire(&a, LEASE).unwrap();

        match election.acquire(&b, LEASE) {
            Err(ElectionError::Held { holder, .. }) => assert_eq!(holder, "a"),
            other => panic!("expected Held, got {:?}", other),
        }

        clock.advance(LEASE);
        let token = election.acquire(&b, LEASE).unwrap();
        assert_eq!(token.holder_id, "b");
        assert_eq!(token.epoch, 2);
    }

    #[test]
    fn test_acquire_by_holder_renews() {
        let (clock, election) = setup();
        let a = InstanceId::new("a");
        let first = election.acquire(&a, LEASE).unwrap();
        clock.advance(Duration::from_secs(4));
        let second = election.acquire(&a, LEASE).unwrap();
        assert_eq!(second.epoch, first.epoch);
        assert_eq!(second.acquired_at, first.acquired_at);
        assert!(second.expires_at > first.expires_at);
    }

    #[test]
    fn test_renew_after_takeover_reports_lost_leadership() {
        let (clock, election) = setup();
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        election.acquire(&a, LEASE).unwrap();
        clock.advance(LEASE + Duration::from_secs(1));
        election.acquire(&b, LEASE).unwrap();

        match election.renew(&a) {
            Err(ElectionError::LostLeadership { holder }) => {
                assert_eq!(holder.as_deref(), Some("b"))
            }
            other => panic!("expected LostLeadership, got {:?}", other),
        }
        assert!(election.renew(&b).is_ok());
    }

    #[test]
    fn test_expired_holder_can_renew_if_nobody_took_over() {
        let (clock, election) = setup();
        let a = InstanceId::new("a");
        election.acquire(&a, LEASE).unwrap();
        clock.advance(LEASE * 2);
        let renewed = election.renew(&a).unwrap();
        assert!(!renewed.is_expired_at(clock.now()));
    }

    #[test]
    fn test_release_frees_slot_immediately() {
        let (_clock, election) = setup();
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        election.acquire(&a, LEASE).unwrap();

        assert!(!election.release(&b).unwrap());
        assert!(election.release(&a).unwrap());
        assert!(election.current().unwrap().is_none());
        assert_eq!(election.acquire(&b, LEASE).unwrap().holder_id, "b");
    }

    #[test]
    fn test_leadership_view() {
        let (clock, election) = setup();
        let mut view = Leadership::default();
        assert!(!view.is_valid_at(clock.now()));

        view.granted(election.acquire(&InstanceId::new("a"), LEASE).unwrap());
        assert!(view.is_valid_at(clock.now()));
        clock.advance(LEASE);
        assert!(!view.is_valid_at(clock.now()));
        assert!(view.revoke().is_some());
        assert!(view.token().is_none());
    }
}
