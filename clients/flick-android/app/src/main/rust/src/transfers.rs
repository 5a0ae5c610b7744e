// Registry of running engine calls, so the host can cancel them

use flick_core::CancellationToken;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static ACTIVE: Mutex<Vec<(u64, CancellationToken)>> = Mutex::new(Vec::new());

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn active() -> MutexGuard<'static, Vec<(u64, CancellationToken)>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One running transfer; deregisters itself when dropped
pub struct ActiveTransfer {
    id: u64,
    token: CancellationToken,
}

impl ActiveTransfer {
    pub fn start() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        active().push((id, token.clone()));
        log::debug!("Transfer {id} registered");
        Self { id, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        active().retain(|(id, _)| *id != self.id);
    }
}

/// Cancel every running transfer, returning how many were signalled
pub fn cancel_all() -> usize {
    let running = active();
    for (id, token) in running.iter() {
        log::info!("Cancelling transfer {id}");
        token.cancel();
    }
    running.len()
}

/// Number of running transfers
#[cfg(test)]
pub fn count() -> usize {
    active().len()
}
