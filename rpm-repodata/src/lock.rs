// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writer exclusion.

[RepositoryLock] serializes updates of one repository across processes sharing
a [Storage]. A writer stores a uniquely named proposal carrying an expiry time
under the repository prefix, then lists all proposals. The lock is obtained
only if no other unexpired proposal exists. Otherwise the writer withdraws its
proposal and retries after a random delay until a timeout elapses.

Proposals of crashed writers stop counting once they expire and are removed by
the next writer that sees them.

[WriterLock] serializes writers within one process that append to shared
output.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        storage::{join_key, Storage},
    },
    chrono::{DateTime, Duration as ChronoDuration, Utc},
    log::{debug, warn},
    rand::Rng,
    std::{
        ops::{Deref, DerefMut},
        time::{Duration, Instant},
    },
    tokio::sync::{Mutex, MutexGuard},
};

/// Directory under a repository prefix holding lock proposals.
pub const LOCK_DIRECTORY: &str = ".rpm-lock";

/// Timing of [RepositoryLock] acquisition.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// How long a proposal remains valid unless renewed.
    pub lease: Duration,
    /// How long to keep retrying before giving up.
    pub timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(3600),
            timeout: Duration::from_secs(60),
        }
    }
}

fn expiry_after(lease: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::days(1))
}

fn retry_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(10..100))
}

/// An exclusive lease on a repository prefix.
///
/// Must be given back with [Self::release()].
pub struct RepositoryLock<'a> {
    storage: &'a dyn Storage,
    prefix: String,
    key: String,
    expires: DateTime<Utc>,
}

impl<'a> RepositoryLock<'a> {
    /// Acquire the lock, retrying until [LockOptions::timeout] elapses.
    pub async fn acquire(
        storage: &'a dyn Storage,
        prefix: &str,
        options: LockOptions,
    ) -> Result<RepositoryLock<'a>> {
        let deadline = Instant::now() + options.timeout;

        loop {
            if let Some(lock) = Self::try_acquire(storage, prefix, options.lease).await? {
                return Ok(lock);
            }

            if Instant::now() >= deadline {
                return Err(RpmRepositoryError::LockHeld(prefix.to_string()));
            }

            tokio::time::sleep(retry_delay()).await;
        }
    }

    /// Make a single attempt at acquiring the lock.
    ///
    /// Returns [None] if another writer holds or is acquiring the lock.
    pub async fn try_acquire(
        storage: &'a dyn Storage,
        prefix: &str,
        lease: Duration,
    ) -> Result<Option<RepositoryLock<'a>>> {
        let key = join_key(
            prefix,
            &format!("{}/{}", LOCK_DIRECTORY, uuid::Uuid::new_v4()),
        );
        let expires = expiry_after(lease);

        storage
            .write_bytes(&key, expires.timestamp_millis().to_string().into_bytes())
            .await?;

        match Self::competing_proposals(storage, prefix, &key).await {
            Ok(0) => {
                debug!("acquired repository lock {}", key);

                Ok(Some(Self {
                    storage,
                    prefix: prefix.to_string(),
                    key,
                    expires,
                }))
            }
            Ok(_) => {
                storage.delete_path(&key).await?;
                Ok(None)
            }
            Err(e) => {
                storage.delete_path(&key).await.ok();
                Err(e)
            }
        }
    }

    /// Count unexpired proposals other than `own`, removing expired ones.
    async fn competing_proposals(storage: &dyn Storage, prefix: &str, own: &str) -> Result<usize> {
        let directory = format!("{}/", join_key(prefix, LOCK_DIRECTORY));
        let now = Utc::now().timestamp_millis();
        let mut count = 0;

        for key in storage.list(&directory).await? {
            if key == own {
                continue;
            }

            let data = match storage.read_to_vec(&key).await {
                Ok(data) => data,
                // Withdrawn since listed.
                Err(RpmRepositoryError::KeyNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            match String::from_utf8_lossy(&data).trim().parse::<i64>() {
                Ok(expires) if expires <= now => {
                    debug!("removing expired lock proposal {}", key);
                    storage.delete_path(&key).await?;
                }
                Ok(_) => {
                    count += 1;
                }
                Err(_) => {
                    warn!("unreadable lock proposal {}; treating as held", key);
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    /// The repository prefix this lock covers.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// When the lease runs out.
    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    /// Verify the lease is still in effect.
    pub async fn check(&self) -> Result<()> {
        if Utc::now() >= self.expires || !self.storage.exists(&self.key).await? {
            Err(RpmRepositoryError::LockHeld(self.prefix.clone()))
        } else {
            Ok(())
        }
    }

    /// Extend the lease.
    pub async fn renew(&mut self, lease: Duration) -> Result<()> {
        self.check().await?;

        let expires = expiry_after(lease);
        self.storage
            .write_bytes(&self.key, expires.timestamp_millis().to_string().into_bytes())
            .await?;
        self.expires = expires;

        Ok(())
    }

    /// Give up the lock.
    pub async fn release(self) -> Result<()> {
        debug!("releasing repository lock {}", self.key);
        self.storage.delete_path(&self.key).await
    }
}

/// Mutual exclusion between in-process writers appending to shared output.
///
/// The protected value is only reachable through the [WriterGuard] returned by
/// [Self::lock()]. The lock is released when the guard is dropped, including while
/// unwinding, or explicitly with [Self::unlock()].
pub struct WriterLock<T> {
    value: Mutex<T>,
}

impl<T> WriterLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Wait until the lock is available and take it.
    pub async fn lock(&self) -> WriterGuard<'_, T> {
        WriterGuard {
            owner: self,
            inner: self.value.lock().await,
        }
    }

    /// Release the lock held by `guard`.
    ///
    /// # Panics
    ///
    /// Panics if `guard` was not obtained from this lock.
    pub fn unlock(&self, guard: WriterGuard<'_, T>) {
        if !std::ptr::eq(self, guard.owner) {
            panic!("WriterLock::unlock() called without a matching lock()");
        }

        drop(guard);
    }

    /// Take back the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Exclusive access to the value of a [WriterLock].
pub struct WriterGuard<'a, T> {
    owner: &'a WriterLock<T>,
    inner: MutexGuard<'a, T>,
}

impl<'a, T> Deref for WriterGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T> DerefMut for WriterGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
