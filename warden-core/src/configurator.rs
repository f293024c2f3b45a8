//! The leader-only network side effect: one address on one interface.

use crate::{Result, WardenError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Adds, removes and queries a single address on a named interface.
///
/// `add_ip` and `delete_ip` are idempotent. Implementations may announce the
/// address after adding it; a failed announcement never rolls the add back.
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    async fn add_ip(&self) -> Result<()>;

    async fn delete_ip(&self) -> Result<()>;

    async fn is_set(&self) -> Result<bool>;
}

/// Configurator that tracks presence in memory.
///
/// Used by tests to observe the reconciliation loop, simulate external drift
/// and inject failures.
#[derive(Debug, Default)]
pub struct InMemoryConfigurator {
    present: AtomicBool,
    failing: AtomicBool,
    adds: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips presence without counting a mutation, as an operator or another
    /// process would.
    pub fn set_externally(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// While set, every operation fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn add_count(&self) -> u64 {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WardenError::network("injected configurator failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for InMemoryConfigurator {
    async fn add_ip(&self) -> Result<()> {
        self.check()?;
        if !self.present.swap(true, Ordering::SeqCst) {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete_ip(&self) -> Result<()> {
        self.check()?;
        if self.present.swap(false, Ordering::SeqCst) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_set(&self) -> Result<bool> {
        self.check()?;
        Ok(self.is_present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_configurator_is_idempotent() {
        let configurator = InMemoryConfigurator::new();
        configurator.add_ip().await.unwrap();
        configurator.add_ip().await.unwrap();
        assert!(configurator.is_set().await.unwrap());
        assert_eq!(configurator.add_count(), 1);

        configurator.delete_ip().await.unwrap();
        configurator.delete_ip().await.unwrap();
        assert!(!configurator.is_set().await.unwrap());
        assert_eq!(configurator.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let configurator = InMemoryConfigurator::new();
        configurator.set_failing(true);
        assert!(configurator.add_ip().await.is_err());
        assert!(!configurator.is_present());
    }
}
