//! Distributed single-flight execution lease.
//!
//! The lease lives in the shared state backend, so it excludes concurrent
//! runs across processes and hosts. `max_hold` bounds how long a crashed
//! holder can wedge the job; `min_hold` keeps a fast or failing run from
//! freeing the lease immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use rehome_state::StateBackend;
use uuid::Uuid;

use crate::errors::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub min_hold: Duration,
    pub max_hold: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            min_hold: Duration::from_secs(60),
            max_hold: Duration::from_secs(3600),
        }
    }
}

/// Longest hold a lease may request.
pub const MAX_HOLD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lease expiries are persisted as text, so `at + hold` must stay inside
/// four-digit years for string comparison to order correctly.
fn plus(at: DateTime<Utc>, hold: Duration) -> DateTime<Utc> {
    let hold = chrono::Duration::from_std(hold.min(MAX_HOLD)).unwrap_or(chrono::Duration::zero());
    at.checked_add_signed(hold).unwrap_or(at)
}

/// OS hostname, lossily decoded.
#[must_use]
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Acquires leases on behalf of this process.
#[derive(Clone)]
pub struct ExecutionLock {
    store: Arc<dyn StateBackend>,
    holder: String,
}

impl ExecutionLock {
    /// Holder identity is `<hostname>:<uuid>`, unique per instance.
    #[must_use]
    pub fn new(store: Arc<dyn StateBackend>) -> Self {
        let holder = format!("{}:{}", hostname(), Uuid::new_v4());
        Self::with_holder(store, holder)
    }

    #[must_use]
    pub fn with_holder(store: Arc<dyn StateBackend>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take `name` if it is free or expired. `None` means another holder
    /// owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend fails.
    pub async fn try_acquire(
        &self,
        name: &str,
        policy: LockPolicy,
    ) -> anyhow::Result<Option<LeaseGuard>> {
        // Stored timestamps keep microseconds; the guard must agree with the row.
        let now = Utc::now().trunc_subsecs(6);
        let locked_until = plus(now, policy.max_hold);
        let store = Arc::clone(&self.store);
        let (lease_name, holder) = (name.to_string(), self.holder.clone());
        let acquired = tokio::task::spawn_blocking(move || {
            store.try_acquire_lease(&lease_name, &holder, now, locked_until)
        })
        .await
        .context("lease acquire task panicked")?
        .with_context(|| format!("Failed to acquire lease '{name}'"))?;

        if !acquired {
            tracing::info!(lock = name, holder = %self.holder, "Lease held elsewhere");
            return Ok(None);
        }
        tracing::info!(lock = name, holder = %self.holder, locked_until = %locked_until, "Lease acquired");
        Ok(Some(LeaseGuard {
            store: Arc::clone(&self.store),
            name: name.to_string(),
            holder: self.holder.clone(),
            acquired_at: now,
            min_hold: policy.min_hold,
            released: false,
        }))
    }

    /// Run `body` while holding `name`.
    ///
    /// # Errors
    ///
    /// [`RunError::AlreadyRunning`] without running `body` if the lease is
    /// held; otherwise `body`'s error or a backend error.
    pub async fn try_acquire_and_run<T, F, Fut>(
        &self,
        name: &str,
        policy: LockPolicy,
        body: F,
    ) -> Result<T, RunError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RunError>>,
    {
        let Some(guard) = self.try_acquire(name, policy).await? else {
            return Err(RunError::AlreadyRunning {
                lock_name: name.to_string(),
            });
        };
        let result = body().await;
        if let Err(e) = guard.release().await {
            tracing::warn!(lock = name, error = %e, "Lease release failed");
        }
        result
    }
}

/// Proof of holding a lease. Release with [`release`](Self::release);
/// dropping an unreleased guard releases it on a blocking task.
pub struct LeaseGuard {
    store: Arc<dyn StateBackend>,
    name: String,
    holder: String,
    acquired_at: DateTime<Utc>,
    min_hold: Duration,
    released: bool,
}

impl LeaseGuard {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Expiry written on release: never earlier than `acquired_at + min_hold`.
    fn release_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(plus(self.acquired_at, self.min_hold))
    }

    fn release_blocking(
        store: &dyn StateBackend,
        name: &str,
        holder: &str,
        locked_until: DateTime<Utc>,
    ) -> rehome_state::error::Result<bool> {
        let released = store.release_lease(name, holder, locked_until)?;
        if released {
            tracing::info!(lock = name, locked_until = %locked_until, "Lease released");
        } else {
            tracing::warn!(lock = name, holder, "Lease was taken over before release");
        }
        Ok(released)
    }

    /// Give the lease back. Returns `false` if another holder had already
    /// taken it over.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend fails.
    pub async fn release(mut self) -> anyhow::Result<bool> {
        self.released = true;
        let locked_until = self.release_until(Utc::now());
        let store = Arc::clone(&self.store);
        let (name, holder) = (self.name.clone(), self.holder.clone());
        tokio::task::spawn_blocking(move || {
            Self::release_blocking(store.as_ref(), &name, &holder, locked_until)
        })
        .await
        .context("lease release task panicked")?
        .with_context(|| format!("Failed to release lease '{}'", self.name))
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locked_until = self.release_until(Utc::now());
        let store = Arc::clone(&self.store);
        let (name, holder) = (self.name.clone(), self.holder.clone());
        let release = move || {
            if let Err(e) = Self::release_blocking(store.as_ref(), &name, &holder, locked_until) {
                tracing::warn!(lock = %name, error = %e, "Lease release on drop failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(release)),
            Err(_) => release(),
        }
    }
}
