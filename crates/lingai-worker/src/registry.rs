//! In-flight request tracking.
//!
//! Every dispatched request is registered before any work starts and leaves
//! the registry exactly once, when its terminal response passes through
//! [`CorrelationRegistry::resolve`] or it is swept. Anything resolved after
//! that point is dropped, which absorbs duplicate terminal emissions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use lingai_types::{RequestKind, WorkerResponse};
use log::debug;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::WorkerError;

/// Requests without a correlation id get an internal key so they can be
/// tracked like any other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RegistryKey {
    Correlated(String),
    Anonymous(Uuid),
}

struct Entry {
    serial: u64,
    kind: RequestKind,
    cancel: CancellationToken,
    registered_at: Instant,
}

/// Handle held by the task serving one request.
#[derive(Debug)]
pub struct CorrelationToken {
    key: RegistryKey,
    serial: u64,
    kind: RequestKind,
    cancel: CancellationToken,
}

impl CorrelationToken {
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.key {
            RegistryKey::Correlated(id) => Some(id),
            RegistryKey::Anonymous(_) => None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the request has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<RegistryKey, Entry>>,
    next_serial: AtomicU64,
    /// Parent of every request's token.
    shutdown: CancellationToken,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RegistryKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new request. A correlation id may only be in flight once.
    pub fn register(
        &self,
        correlation_id: Option<&str>,
        kind: RequestKind,
    ) -> Result<CorrelationToken, WorkerError> {
        let key = match correlation_id {
            Some(id) => RegistryKey::Correlated(id.to_string()),
            None => RegistryKey::Anonymous(Uuid::new_v4()),
        };

        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(WorkerError::DuplicateCorrelationId(
                correlation_id.unwrap_or_default().to_string(),
            ));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        entries.insert(
            key.clone(),
            Entry {
                serial,
                kind,
                cancel: cancel.clone(),
                registered_at: Instant::now(),
            },
        );

        Ok(CorrelationToken {
            key,
            serial,
            kind,
            cancel,
        })
    }

    /// Gate a response for the token's request.
    ///
    /// Returns the response if it may be sent. A terminal response releases the
    /// entry; once released, every later response for that token is dropped.
    pub fn resolve(
        &self,
        token: &CorrelationToken,
        response: WorkerResponse,
    ) -> Option<WorkerResponse> {
        let mut entries = self.entries();
        let live = entries
            .get(&token.key)
            .is_some_and(|entry| entry.serial == token.serial);

        if !live {
            debug!(
                "[REGISTRY] Dropping {:?} for finished {} request {:?}",
                response.kind,
                token.kind,
                token.correlation_id()
            );
            return None;
        }

        if response.is_terminal() {
            if let Some(entry) = entries.remove(&token.key) {
                debug!(
                    "[REGISTRY] {} request {:?} finished after {:?}",
                    entry.kind,
                    token.correlation_id(),
                    entry.registered_at.elapsed()
                );
            }
        }
        Some(response)
    }

    /// Release a request without sending anything. Returns true the first time only.
    pub fn sweep(&self, token: &CorrelationToken) -> bool {
        let mut entries = self.entries();
        let live = entries
            .get(&token.key)
            .is_some_and(|entry| entry.serial == token.serial);
        if live {
            entries.remove(&token.key);
            debug!(
                "[REGISTRY] Swept {} request {:?}",
                token.kind,
                token.correlation_id()
            );
        }
        live
    }

    /// Signal cancellation to the request with this id, if it is in flight.
    ///
    /// Loads and unloads always run to a committed state, so they are never
    /// signalled.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let entries = self.entries();
        match entries.get(&RegistryKey::Correlated(correlation_id.to_string())) {
            Some(entry) if entry.kind.is_lifecycle() => {
                debug!("[REGISTRY] {} request {correlation_id} cannot be cancelled", entry.kind);
                false
            }
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight. Requests registered afterwards start out
    /// cancelled. Returns how many requests were in flight.
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries();
        self.shutdown.cancel();
        entries.len()
    }

    pub fn in_flight(&self) -> usize {
        self.entries().len()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries()
            .contains_key(&RegistryKey::Correlated(correlation_id.to_string()))
    }
}
