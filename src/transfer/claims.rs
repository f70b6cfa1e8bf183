use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// What a claim holder is doing with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Copying bytes into stores; safe to abandon part way.
    Transfer,
    /// Deleting stored bytes and the record; must run to completion.
    Removal,
}

/// An active single-owner claim on a file id.
#[derive(Debug)]
pub struct Claim {
    cancel: CancellationToken,
    done: CancellationToken,
    kind: ClaimKind,
}

impl Claim {
    pub fn kind(&self) -> ClaimKind {
        self.kind
    }

    /// Wait until the holder has released the claim.
    pub async fn released(&self) {
        self.done.cancelled().await;
    }

    /// Ask the holder to stop and wait until it has released the claim.
    pub async fn cancel_and_wait(&self) {
        self.cancel.cancel();
        self.released().await;
    }
}

/// At most one claim per file id. Transfers and deletions hold a claim for
/// the whole time they touch a record's stored bytes.
#[derive(Debug)]
pub struct ClaimTable {
    claims: Mutex<HashMap<String, Arc<Claim>>>,
    root: CancellationToken,
}

/// Releases its claim when dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    claim: Arc<Claim>,
    id: String,
    table: Arc<ClaimTable>,
}

impl ClaimGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires when the claim should be abandoned.
    pub fn token(&self) -> &CancellationToken {
        &self.claim.cancel
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        {
            let mut claims = self.table.lock();
            if let Some(current) = claims.get(&self.id) {
                if Arc::ptr_eq(current, &self.claim) {
                    claims.remove(&self.id);
                }
            }
        }
        self.claim.done.cancel();
    }
}

impl ClaimTable {
    /// Claims are cancelled along with `root`.
    pub fn new(root: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            claims: Mutex::new(HashMap::new()),
            root,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Claim>>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `id` for a transfer, or return the current holder.
    pub fn try_claim(self: &Arc<Self>, id: &str) -> Result<ClaimGuard, Arc<Claim>> {
        self.try_claim_as(id, ClaimKind::Transfer)
    }

    fn try_claim_as(
        self: &Arc<Self>,
        id: &str,
        kind: ClaimKind,
    ) -> Result<ClaimGuard, Arc<Claim>> {
        let mut claims = self.lock();
        if let Some(holder) = claims.get(id) {
            return Err(Arc::clone(holder));
        }
        let claim = Arc::new(Claim {
            cancel: self.root.child_token(),
            done: CancellationToken::new(),
            kind,
        });
        claims.insert(id.to_string(), Arc::clone(&claim));
        Ok(ClaimGuard {
            claim,
            id: id.to_string(),
            table: Arc::clone(self),
        })
    }

    /// Claim `id` for a removal. A transfer in flight is cancelled and
    /// waited out; another removal is waited out without being disturbed.
    pub async fn claim_exclusive(self: &Arc<Self>, id: &str) -> ClaimGuard {
        loop {
            match self.try_claim_as(id, ClaimKind::Removal) {
                Ok(guard) => return guard,
                Err(holder) if holder.kind() == ClaimKind::Removal => holder.released().await,
                Err(holder) => holder.cancel_and_wait().await,
            }
        }
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until every claim held right now, and any taken meanwhile, is released.
    pub async fn wait_all(&self) {
        loop {
            let holders: Vec<Arc<Claim>> = self.lock().values().cloned().collect();
            if holders.is_empty() {
                return;
            }
            for holder in holders {
                holder.done.cancelled().await;
            }
        }
    }
}
