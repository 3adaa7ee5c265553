//! Subscriber Context Repository
//!
//! Multi-key store of subscriber contexts. Lookups return a shared handle and
//! release the index lock before the caller locks the context, so the index
//! lock is never taken while waiting on a subscriber. A handler holding a
//! subscriber lock may still re-key it through `update_keys`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::context::{EnbUeKey, EpsGuti, Imsi64, MmeUeS1apId, Teid, UeContext};
use crate::error::{Lookup, MmeError, MmeResult};

/// Shared subscriber context
pub type UeHandle = Arc<Mutex<UeContext>>;

/// Lock a subscriber context. The guard releases on every exit path.
pub fn lock_ue(handle: &UeHandle) -> MmeResult<MutexGuard<'_, UeContext>> {
    handle.lock().map_err(|_| MmeError::LockPoisoned)
}

/// Lookup key of a subscriber context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeKey {
    MmeUeS1apId(MmeUeS1apId),
    Enb(EnbUeKey),
    S11Teid(Teid),
    Imsi(Imsi64),
    Guti(EpsGuti),
}

impl UeKey {
    pub fn to_lookup(&self) -> Lookup {
        match self {
            UeKey::MmeUeS1apId(id) => Lookup::MmeUeS1apId(*id),
            UeKey::Enb(key) => Lookup::EnbUeS1apId {
                sctp_assoc_id: key.sctp_assoc_id,
                enb_ue_s1ap_id: key.enb_ue_s1ap_id,
            },
            UeKey::S11Teid(teid) => Lookup::S11Teid(*teid),
            UeKey::Imsi(imsi) => Lookup::Imsi(*imsi),
            UeKey::Guti(guti) => Lookup::Guti(guti.to_string()),
        }
    }
}

/// Secondary keys of one subscriber. `None` means "not indexed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeKeys {
    pub enb_key: Option<EnbUeKey>,
    pub s11_teid: Option<Teid>,
    pub imsi: Option<Imsi64>,
    pub guti: Option<EpsGuti>,
}

impl UeKeys {
    /// Keys currently recorded in the context itself
    pub fn of(ue: &UeContext) -> Self {
        Self {
            enb_key: ue.enb_key,
            s11_teid: (ue.mme_teid_s11 != 0).then_some(ue.mme_teid_s11),
            imsi: ue.imsi,
            guti: ue.emm.guti,
        }
    }
}

/// Repository contract consumed by the lifecycle manager and the coordinator
pub trait UeRepository: Send + Sync {
    fn find(&self, key: &UeKey) -> Option<UeHandle>;

    /// Subscriber id behind `key`, read from the index alone. No context
    /// lock is taken.
    fn resolve(&self, key: &UeKey) -> Option<MmeUeS1apId>;

    /// Store a new context and allocate its MME UE S1AP ID
    fn insert(&self, ue: UeContext) -> MmeResult<MmeUeS1apId>;

    /// Replace every secondary key of `ue_id` at once. Either all keys are
    /// installed or none is.
    fn update_keys(&self, ue_id: MmeUeS1apId, keys: UeKeys) -> MmeResult<()>;

    fn remove(&self, ue_id: MmeUeS1apId) -> Option<UeHandle>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `find` that turns a miss into `NotFound`
    fn get(&self, key: &UeKey) -> MmeResult<UeHandle> {
        self.find(key)
            .ok_or_else(|| MmeError::NotFound(key.to_lookup()))
    }
}

// ============================================================================
// In-memory Repository
// ============================================================================

#[derive(Debug, Default)]
struct UeIndex {
    contexts: HashMap<MmeUeS1apId, UeHandle>,
    keys: HashMap<MmeUeS1apId, UeKeys>,
    by_enb: HashMap<EnbUeKey, MmeUeS1apId>,
    by_s11_teid: HashMap<Teid, MmeUeS1apId>,
    by_imsi: HashMap<Imsi64, MmeUeS1apId>,
    by_guti: HashMap<EpsGuti, MmeUeS1apId>,
}

impl UeIndex {
    fn resolve(&self, key: &UeKey) -> Option<MmeUeS1apId> {
        match key {
            UeKey::MmeUeS1apId(id) => self.contexts.contains_key(id).then_some(*id),
            UeKey::Enb(enb) => self.by_enb.get(enb).copied(),
            UeKey::S11Teid(teid) => self.by_s11_teid.get(teid).copied(),
            UeKey::Imsi(imsi) => self.by_imsi.get(imsi).copied(),
            UeKey::Guti(guti) => self.by_guti.get(guti).copied(),
        }
    }

    fn conflict(&self, ue_id: MmeUeS1apId, keys: &UeKeys) -> Option<UeKey> {
        let taken = |owner: Option<&MmeUeS1apId>| owner.is_some_and(|o| *o != ue_id);
        if let Some(enb) = keys.enb_key {
            if taken(self.by_enb.get(&enb)) {
                return Some(UeKey::Enb(enb));
            }
        }
        if let Some(teid) = keys.s11_teid {
            if taken(self.by_s11_teid.get(&teid)) {
                return Some(UeKey::S11Teid(teid));
            }
        }
        if let Some(imsi) = keys.imsi {
            if taken(self.by_imsi.get(&imsi)) {
                return Some(UeKey::Imsi(imsi));
            }
        }
        if let Some(guti) = keys.guti {
            if taken(self.by_guti.get(&guti)) {
                return Some(UeKey::Guti(guti));
            }
        }
        None
    }

    fn unindex(&mut self, keys: &UeKeys) {
        if let Some(enb) = keys.enb_key {
            self.by_enb.remove(&enb);
        }
        if let Some(teid) = keys.s11_teid {
            self.by_s11_teid.remove(&teid);
        }
        if let Some(imsi) = keys.imsi {
            self.by_imsi.remove(&imsi);
        }
        if let Some(guti) = keys.guti {
            self.by_guti.remove(&guti);
        }
    }

    fn index(&mut self, ue_id: MmeUeS1apId, keys: &UeKeys) {
        if let Some(enb) = keys.enb_key {
            self.by_enb.insert(enb, ue_id);
        }
        if let Some(teid) = keys.s11_teid {
            self.by_s11_teid.insert(teid, ue_id);
        }
        if let Some(imsi) = keys.imsi {
            self.by_imsi.insert(imsi, ue_id);
        }
        if let Some(guti) = keys.guti {
            self.by_guti.insert(guti, ue_id);
        }
    }
}

/// Repository backed by hash maps under one `RwLock`
#[derive(Debug)]
pub struct InMemoryUeRepository {
    max_ue: usize,
    next_ue_id: AtomicU32,
    index: RwLock<UeIndex>,
}

impl InMemoryUeRepository {
    pub fn new(max_ue: usize) -> Self {
        Self {
            max_ue,
            next_ue_id: AtomicU32::new(1),
            index: RwLock::new(UeIndex::default()),
        }
    }

    /// All live subscriber ids, in no particular order
    pub fn ue_ids(&self) -> Vec<MmeUeS1apId> {
        self.read().contexts.keys().copied().collect()
    }

    /// Keys currently indexed for `ue_id`
    pub fn keys_of(&self, ue_id: MmeUeS1apId) -> Option<UeKeys> {
        self.read().keys.get(&ue_id).copied()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, UeIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, UeIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryUeRepository {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl UeRepository for InMemoryUeRepository {
    fn find(&self, key: &UeKey) -> Option<UeHandle> {
        let index = self.read();
        let ue_id = index.resolve(key)?;
        index.contexts.get(&ue_id).cloned()
    }

    fn resolve(&self, key: &UeKey) -> Option<MmeUeS1apId> {
        let index = self.read();
        let ue_id = index.resolve(key)?;
        index.contexts.contains_key(&ue_id).then_some(ue_id)
    }

    fn insert(&self, mut ue: UeContext) -> MmeResult<MmeUeS1apId> {
        let mut index = self.write();
        if index.contexts.len() >= self.max_ue {
            return Err(MmeError::ResourceExhaustion(format!(
                "no free MME UE S1AP ID, {} contexts in use",
                index.contexts.len()
            )));
        }
        let ue_id = loop {
            let candidate = self.next_ue_id.fetch_add(1, Ordering::SeqCst);
            if candidate != 0 && !index.contexts.contains_key(&candidate) {
                break candidate;
            }
        };
        let keys = UeKeys::of(&ue);
        if let Some(key) = index.conflict(ue_id, &keys) {
            return Err(MmeError::InvalidState(format!(
                "{} already indexed for another subscriber",
                key.to_lookup()
            )));
        }
        ue.mme_ue_s1ap_id = ue_id;
        index.index(ue_id, &keys);
        index.keys.insert(ue_id, keys);
        index.contexts.insert(ue_id, Arc::new(Mutex::new(ue)));
        log::debug!("[ue_id={}] context added ({} in use)", ue_id, index.contexts.len());
        Ok(ue_id)
    }

    fn update_keys(&self, ue_id: MmeUeS1apId, keys: UeKeys) -> MmeResult<()> {
        let mut index = self.write();
        if !index.contexts.contains_key(&ue_id) {
            return Err(MmeError::NotFound(Lookup::MmeUeS1apId(ue_id)));
        }
        if let Some(key) = index.conflict(ue_id, &keys) {
            return Err(MmeError::InvalidState(format!(
                "{} already indexed for another subscriber",
                key.to_lookup()
            )));
        }
        let old = index.keys.get(&ue_id).copied().unwrap_or_default();
        index.unindex(&old);
        index.index(ue_id, &keys);
        index.keys.insert(ue_id, keys);
        log::debug!("[ue_id={}] keys updated: {:?}", ue_id, keys);
        Ok(())
    }

    fn remove(&self, ue_id: MmeUeS1apId) -> Option<UeHandle> {
        let mut index = self.write();
        let handle = index.contexts.remove(&ue_id)?;
        if let Some(keys) = index.keys.remove(&ue_id) {
            index.unindex(&keys);
        }
        log::debug!("[ue_id={}] context removed", ue_id);
        Some(handle)
    }

    fn len(&self) -> usize {
        self.read().contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enb(id: u32) -> EnbUeKey {
        EnbUeKey {
            sctp_assoc_id: 1,
            enb_ue_s1ap_id: id,
        }
    }

    #[test]
    fn test_insert_allocates_ids() {
        let repo = InMemoryUeRepository::new(8);
        let a = repo.insert(UeContext::new()).unwrap();
        let b = repo.insert(UeContext::new()).unwrap();
        assert_ne!(a, b);
        let handle = repo.get(&UeKey::MmeUeS1apId(b)).unwrap();
        assert_eq!(lock_ue(&handle).unwrap().mme_ue_s1ap_id, b);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_exhaustion_leaves_nothing_behind() {
        let repo = InMemoryUeRepository::new(1);
        repo.insert(UeContext::new()).unwrap();
        let err = repo.insert(UeContext::new()).unwrap_err();
        assert!(matches!(err, MmeError::ResourceExhaustion(_)));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_update_keys_replaces_all() {
        let repo = InMemoryUeRepository::default();
        let id = repo.insert(UeContext::new()).unwrap();
        repo.update_keys(
            id,
            UeKeys {
                enb_key: Some(enb(10)),
                s11_teid: Some(0x20),
                imsi: Some(1010000000001),
                guti: None,
            },
        )
        .unwrap();
        assert!(repo.find(&UeKey::Enb(enb(10))).is_some());
        assert!(repo.find(&UeKey::S11Teid(0x20)).is_some());

        repo.update_keys(
            id,
            UeKeys {
                enb_key: Some(enb(11)),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(repo.find(&UeKey::Enb(enb(10))).is_none());
        assert!(repo.find(&UeKey::S11Teid(0x20)).is_none());
        assert!(repo.find(&UeKey::Enb(enb(11))).is_some());
    }

    #[test]
    fn test_update_keys_all_or_nothing() {
        let repo = InMemoryUeRepository::default();
        let a = repo.insert(UeContext::new()).unwrap();
        let b = repo.insert(UeContext::new()).unwrap();
        repo.update_keys(
            a,
            UeKeys {
                imsi: Some(42),
                ..Default::default()
            },
        )
        .unwrap();

        let err = repo
            .update_keys(
                b,
                UeKeys {
                    enb_key: Some(enb(3)),
                    imsi: Some(42),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, MmeError::InvalidState(_)));
        assert!(repo.find(&UeKey::Enb(enb(3))).is_none());
        let owner = repo.get(&UeKey::Imsi(42)).unwrap();
        assert_eq!(lock_ue(&owner).unwrap().mme_ue_s1ap_id, a);
    }

    #[test]
    fn test_remove_drops_keys() {
        let repo = InMemoryUeRepository::default();
        let mut ue = UeContext::new();
        ue.mme_teid_s11 = 0x99;
        let id = repo.insert(ue).unwrap();
        assert!(repo.find(&UeKey::S11Teid(0x99)).is_some());
        assert!(repo.remove(id).is_some());
        assert!(repo.find(&UeKey::S11Teid(0x99)).is_none());
        let err = repo.get(&UeKey::MmeUeS1apId(id)).unwrap_err();
        assert!(err.is_lookup_miss());
        assert!(repo.update_keys(id, UeKeys::default()).is_err());
    }

    #[test]
    fn test_resolve_while_context_locked() {
        let repo = InMemoryUeRepository::default();
        let mut ue = UeContext::new();
        ue.imsi = Some(7);
        ue.enb_key = Some(enb(3));
        let id = repo.insert(ue).unwrap();

        let handle = repo.get(&UeKey::MmeUeS1apId(id)).unwrap();
        let _held = lock_ue(&handle).unwrap();
        assert_eq!(repo.resolve(&UeKey::Imsi(7)), Some(id));
        assert_eq!(repo.resolve(&UeKey::Enb(enb(3))), Some(id));
        assert_eq!(repo.resolve(&UeKey::Enb(enb(4))), None);

        repo.remove(id);
        assert_eq!(repo.resolve(&UeKey::MmeUeS1apId(id)), None);
        assert_eq!(repo.resolve(&UeKey::Imsi(7)), None);
    }
}
