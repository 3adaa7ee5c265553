//! Shared fixtures for the session core scenarios

#![allow(dead_code)]

use std::sync::Arc;

use nextgcore_mme_sessiond::context::{
    EnbUeKey, Fteid, IpAddr, MmeUeS1apId, PdnCid, PdnContext, Qos, Teid,
};
use nextgcore_mme_sessiond::esm_build::PdnType;
use nextgcore_mme_sessiond::{
    lock_ue, BearerManager, DispatchQueue, EmmCnCoordinator, Ebi, InMemoryUeRepository, MmeConfig,
    MmeSm, TimerManager, UeContext, UeKey, UeRepository,
};

pub const IMSI: u64 = 1010000000001;
pub const MME_TEID: Teid = 0x1001;
pub const SGW_TEID: Teid = 0x2002;

/// State machine wired to recording fakes
pub struct Harness {
    pub sm: MmeSm,
    pub repo: Arc<InMemoryUeRepository>,
    pub dispatch: Arc<DispatchQueue>,
    pub timers: Arc<TimerManager>,
}

impl Harness {
    pub fn new(config: MmeConfig) -> Self {
        let _ = env_logger::try_init();

        let repo = Arc::new(InMemoryUeRepository::default());
        let dispatch = Arc::new(DispatchQueue::new());
        let timers = Arc::new(TimerManager::new());
        let manager = BearerManager::new(
            repo.clone(),
            dispatch.clone(),
            timers.clone(),
            config.clone(),
        );
        let emm_cn = EmmCnCoordinator::new(repo.clone(), dispatch.clone(), config);
        Self {
            sm: MmeSm::new(manager, emm_cn),
            repo,
            dispatch,
            timers,
        }
    }

    pub fn with_ue<R>(&self, ue_id: MmeUeS1apId, f: impl FnOnce(&mut UeContext) -> R) -> R {
        let handle = self.repo.get(&UeKey::MmeUeS1apId(ue_id)).unwrap();
        let mut ue = lock_ue(&handle).unwrap();
        f(&mut ue)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(MmeConfig::default())
    }
}

pub fn ebi(v: u8) -> Ebi {
    Ebi::new(v).unwrap()
}

pub fn cid0() -> PdnCid {
    PdnCid::new(0).unwrap()
}

pub fn sgw_s1u() -> Fteid {
    Fteid::new(0x300, IpAddr::v4([10, 0, 0, 3]))
}

pub fn enb_s1u(teid: Teid) -> Fteid {
    Fteid::new(teid, IpAddr::v4([192, 168, 0, 10]))
}

pub fn enb_key(enb_ue_s1ap_id: u32) -> EnbUeKey {
    EnbUeKey {
        sctp_assoc_id: 1,
        enb_ue_s1ap_id,
    }
}

/// Subscriber with one PDN whose default bearer (ebi 5, pti 3) was sent to the gateway
pub fn pending_session(h: &Harness) -> MmeUeS1apId {
    let mut ue = UeContext::new();
    ue.imsi = Some(IMSI);
    ue.mme_teid_s11 = MME_TEID;
    ue.insert_pdn(cid0(), PdnContext::new(1, "internet", PdnType::Ipv4))
        .unwrap();
    let bearer = ue.add_bearer(cid0(), ebi(5), Qos::default()).unwrap();
    bearer.transaction_id = 3;
    bearer.mark_mme_created().unwrap();
    h.repo.insert(ue).unwrap()
}

/// Subscriber whose default bearer is established up to the gateway
pub fn established_session(h: &Harness, enb: Option<EnbUeKey>) -> MmeUeS1apId {
    let mut ue = UeContext::new();
    ue.imsi = Some(IMSI);
    ue.mme_teid_s11 = MME_TEID;
    ue.enb_key = enb;
    let mut pdn = PdnContext::new(1, "internet", PdnType::Ipv4);
    pdn.s_gw_teid_s11_s4 = SGW_TEID;
    pdn.s_gw_address_s11_s4 = IpAddr::v4([10, 0, 0, 2]);
    ue.insert_pdn(cid0(), pdn).unwrap();
    let bearer = ue.add_bearer(cid0(), ebi(5), Qos::default()).unwrap();
    bearer.mark_mme_created().unwrap();
    bearer.mark_sgw_created(sgw_s1u(), None).unwrap();
    h.repo.insert(ue).unwrap()
}
