//! Process-wide authentication status.
//!
//! Route guards and the callback controller race each other: a guard may
//! start a remote check, a callback may complete a sign-in, and only then
//! does the guard's (now stale) answer arrive. Every check therefore holds a
//! [`CheckTicket`] stamped from a monotonically increasing sequence, and
//! [`AuthState::update`] discards answers that would undo a newer event:
//!
//! - a ticket issued before the latest sign-in cannot downgrade to
//!   `Unauthenticated`;
//! - a ticket issued before the latest sign-out cannot re-authenticate.
//!
//! A ticket dropped without an update counts as a failed check, so
//! `Checking` always resolves.
//!
//! Changes observed outside a check (provider auth-change events) carry a
//! [`AuthState::stamp`] taken when they were observed and obey the same
//! ordering.

use crate::listeners::{Listeners, Subscription};
use crate::types::{AuthStatus, Session, User};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::debug;

struct Inner {
    status: AuthStatus,
    last_sign_in: u64,
    last_sign_out: u64,
    outstanding: usize,
}

struct Shared {
    inner: RwLock<Inner>,
    seq: AtomicU64,
    listeners: Listeners<AuthStatus>,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `mutate` and notify subscribers if the status changed.
    fn transition<R>(&self, mutate: impl FnOnce(&mut Inner, &Shared) -> R) -> R {
        let (result, changed) = {
            let mut inner = self.write();
            let before = inner.status.clone();
            let result = mutate(&mut inner, self);
            let changed = (inner.status != before).then(|| inner.status.clone());
            (result, changed)
        };

        if let Some(status) = changed {
            debug!(status = %status, "Auth status changed");
            self.listeners.notify(&status);
        }
        result
    }

    fn release_check(inner: &mut Inner) {
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.status == AuthStatus::Checking && inner.outstanding == 0 {
            inner.status = AuthStatus::Unauthenticated;
        }
    }
}

/// Shared handle to the authentication status. Clones observe the same state.
#[derive(Clone)]
pub struct AuthState {
    shared: Arc<Shared>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    status: AuthStatus::Unknown,
                    last_sign_in: 0,
                    last_sign_out: 0,
                    outstanding: 0,
                }),
                seq: AtomicU64::new(0),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn current(&self) -> AuthStatus {
        self.shared.read().status.clone()
    }

    /// Register a check. Moves `Unknown` to `Checking`.
    pub fn begin_check(&self) -> CheckTicket {
        let issued = self.shared.next_seq();
        self.shared.transition(|inner, _| {
            inner.outstanding += 1;
            if inner.status == AuthStatus::Unknown {
                inner.status = AuthStatus::Checking;
            }
        });

        CheckTicket {
            issued,
            shared: Arc::downgrade(&self.shared),
            settled: false,
        }
    }

    /// Whether a positive outcome for `ticket` would still be applied, i.e.
    /// no sign-out has completed since it was issued.
    ///
    /// Check before writing anything derived from the check to storage.
    pub fn admits(&self, ticket: &CheckTicket) -> bool {
        ticket.issued > self.shared.read().last_sign_out
    }

    /// Mark the current point in the sign-in/sign-out order.
    pub fn stamp(&self) -> u64 {
        self.shared.next_seq()
    }

    /// True if no sign-in or sign-out has completed since `stamp`.
    pub fn is_current(&self, stamp: u64) -> bool {
        let inner = self.shared.read();
        stamp > inner.last_sign_in && stamp > inner.last_sign_out
    }

    /// Sign out because of a change observed at `stamp`.
    ///
    /// Ignored (returns `false`) if nobody is signed in or a sign-in
    /// completed after the observation.
    pub fn sign_out_observed(&self, stamp: u64) -> bool {
        self.shared.transition(|inner, shared| {
            if !inner.status.is_authenticated() || stamp < inner.last_sign_in {
                return false;
            }
            inner.last_sign_out = shared.next_seq();
            inner.status = AuthStatus::Unauthenticated;
            true
        })
    }

    /// Settle a check with its outcome.
    ///
    /// Returns `false` if the outcome was discarded as stale.
    pub fn update(&self, mut ticket: CheckTicket, outcome: Option<(User, Session)>) -> bool {
        ticket.settled = true;
        let issued = ticket.issued;

        let applied = self.shared.transition(|inner, shared| {
            let applied = match outcome {
                Some((user, session)) => {
                    if issued < inner.last_sign_out {
                        false
                    } else {
                        inner.last_sign_in = shared.next_seq();
                        inner.status = AuthStatus::Authenticated { user, session };
                        true
                    }
                }
                None => {
                    if issued < inner.last_sign_in {
                        false
                    } else {
                        inner.status = AuthStatus::Unauthenticated;
                        true
                    }
                }
            };
            Shared::release_check(inner);
            applied
        });

        if !applied {
            debug!(ticket = issued, "Discarded stale auth check result");
        }
        applied
    }

    /// Record a completed sign-in (callback exchange or password sign-in).
    pub fn sign_in_completed(&self, user: User, session: Session) {
        self.shared.transition(|inner, shared| {
            inner.last_sign_in = shared.next_seq();
            inner.status = AuthStatus::Authenticated { user, session };
        });
    }

    pub fn sign_out(&self) {
        self.shared.transition(|inner, shared| {
            inner.last_sign_out = shared.next_seq();
            inner.status = AuthStatus::Unauthenticated;
        });
    }

    /// Swap in a refreshed session. No-op unless authenticated.
    pub fn replace_session(&self, session: Session) -> bool {
        self.shared.transition(|inner, _| match &mut inner.status {
            AuthStatus::Authenticated { session: current, .. } => {
                *current = session;
                true
            }
            _ => false,
        })
    }

    /// Swap in updated user attributes. No-op unless authenticated.
    pub fn replace_user(&self, user: User) -> bool {
        self.shared.transition(|inner, _| match &mut inner.status {
            AuthStatus::Authenticated { user: current, .. } => {
                *current = user;
                true
            }
            _ => false,
        })
    }

    /// Called with the new status on every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthStatus) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(callback)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("status", &self.current())
            .finish()
    }
}

/// An outstanding check. Settle it with [`AuthState::update`].
#[must_use = "dropping a ticket resolves the check as unauthenticated"]
pub struct CheckTicket {
    issued: u64,
    shared: Weak<Shared>,
    settled: bool,
}

impl CheckTicket {
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

impl fmt::Debug for CheckTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckTicket")
            .field("issued", &self.issued)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for CheckTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.transition(|inner, _| Shared::release_check(inner));
        }
    }
}
