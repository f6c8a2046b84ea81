//! Bookkeeping of the cancellation tokens of running sessions
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// The cancellation tokens of every live session
///
/// Every token is a child of the registry's root token: cancelling the root via
/// [`Registry::shutdown`] also reaches sessions registered after it fired.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    root: CancellationToken,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    tokens: HashMap<u64, CancellationToken>,
}

impl Registry {
    /// Registers a fresh token for a session about to be spawned
    ///
    /// The entry is removed again when the returned [`Registration`] is dropped.
    pub(crate) fn register(self: &Arc<Self>) -> Registration {
        let token = self.root.child_token();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tokens.insert(id, token.clone());
        Registration {
            id,
            token,
            registry: Arc::downgrade(self),
        }
    }

    /// Cancels and forgets every registered token, returning how many there were
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<CancellationToken> = self.inner.lock().tokens.drain().map(|(_, t)| t).collect();
        for token in &drained {
            token.cancel();
        }
        drained.len()
    }

    /// Cancels every current and future token
    pub(crate) fn shutdown(&self) -> usize {
        self.root.cancel();
        self.cancel_all()
    }

    /// A token cancelled on [`shutdown`](Self::shutdown) only
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().tokens.len()
    }
}

/// A session's entry in the [`Registry`]
#[derive(Debug)]
pub(crate) struct Registration {
    id: u64,
    token: CancellationToken,
    registry: Weak<Registry>,
}

impl Registration {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.inner.lock().tokens.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_all_signals_each_token_once_and_forgets_it() {
        let registry = Arc::new(Registry::default());
        let regs: Vec<_> = (0..3).map(|_| registry.register()).collect();
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.cancel_all(), 3);
        assert!(regs.iter().all(|r| r.token().is_cancelled()));
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn dropping_a_registration_deregisters_it() {
        let registry = Arc::new(Registry::default());
        let first = registry.register();
        let second = registry.register();
        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(!second.token().is_cancelled());
    }

    #[test]
    fn shutdown_reaches_late_registrations() {
        let registry = Arc::new(Registry::default());
        let early = registry.register();
        assert_eq!(registry.shutdown(), 1);
        let late = registry.register();
        assert!(early.token().is_cancelled());
        assert!(late.token().is_cancelled());
    }

    #[test]
    fn cancel_all_spares_the_root() {
        let registry = Arc::new(Registry::default());
        let election = registry.child_token();
        registry.register();
        registry.cancel_all();
        assert!(!election.is_cancelled());
        assert!(!registry.register().token().is_cancelled());
    }
}
