//! In-memory payment sessions for externally-signed flows.
//!
//! A session connects a prepared-but-unsigned authorization to the
//! signature a browser wallet eventually supplies. Sessions are one-shot
//! and expire with the authorization window; they are deliberately not
//! persisted, so a restart loses them and the pending ledger entry plus
//! expiry-based cleanup converge the state.

use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::proto::{PaymentRequiredDocument, PaymentRequirements, TransferRequest};
use crate::timestamp::UnixTimestamp;

/// Everything needed to resume a prepared payment once the signature arrives.
#[derive(Debug, Clone)]
pub struct PaymentSession {
    pub id: String,
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub reason: Option<String>,
    pub accepted: PaymentRequirements,
    pub document: PaymentRequiredDocument,
    pub transfer: TransferRequest,
    pub tx_record_id: String,
    /// Equal to the authorization's `validBefore`.
    pub expires_at: UnixTimestamp,
}

/// Process-local session table. Removal is atomic: of two racing
/// [`take`](SessionTable::take) calls for the same id, exactly one wins.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, PaymentSession>>,
}

impl SessionTable {
    pub fn insert(&self, session: PaymentSession) {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .insert(session.id.clone(), session);
    }

    /// Remove and return the session with the given id, if present.
    pub fn take(&self, id: &str) -> Option<PaymentSession> {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .remove(id)
    }

    /// Drain every session whose window has passed.
    pub fn take_expired(&self, now: UnixTimestamp) -> Vec<PaymentSession> {
        let mut table = self.inner.lock().expect("session table lock poisoned");
        let expired_ids: Vec<String> = table
            .values()
            .filter(|session| now > session.expires_at)
            .map(|session| session.id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("session table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
