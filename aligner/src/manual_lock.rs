use common::Shared;
use tokio::sync::OwnedMutexGuard;

/// Single-holder token serializing manual registrations across the session.
#[derive(Debug, Clone, Default)]
pub struct ManualLock {
    token: Shared<()>,
}

#[derive(Debug)]
#[must_use = "the manual lock is released when the guard is dropped"]
pub struct ManualLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ManualLock {
    pub async fn acquire(&self) -> ManualLockGuard {
        ManualLockGuard {
            _guard: self.token.lock_owned().await,
        }
    }

    pub fn is_held(&self) -> bool {
        self.token.try_lock().is_err()
    }
}

impl ManualLockGuard {
    pub fn release(self) {}
}
