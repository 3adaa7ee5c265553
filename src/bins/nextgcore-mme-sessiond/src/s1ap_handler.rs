//! S1AP Message Handling
//!
//! Lifecycle-manager reactions to the eNB: initial UE messages, initial
//! context setup results, E-RAB results, path switch, release requests and
//! UE context modification results.

use std::sync::Arc;

use crate::bearer_manager::BearerManager;
use crate::context::{CsfbServiceType, Ebi, MmeUeS1apId, PendingPathSwitch, UeContext};
use crate::emm_build::{EmmProcRequest, FailedProcedure};
use crate::error::{MmeError, MmeResult};
use crate::event::{EmmCnPrimitive, ERabSetupItem, InitialUeMessageData, PathSwitchRequestData};
use crate::repository::{lock_ue, UeHandle, UeKey, UeRepository};
use crate::s11_build::{BearerToModify, ModifyBearerRequest, RatType, S11Message};
use crate::s1ap_build::{S1apMessage, S1apReleaseCause};
use crate::timer::MmeTimerId;

impl BearerManager {
    // ========================================================================
    // Initial UE Message
    // ========================================================================

    /// First message of a new radio connection. Resolves the subscriber by
    /// S-TMSI when the eNB supplied one, otherwise creates a fresh context.
    pub fn handle_initial_ue_message(&self, msg: InitialUeMessageData) -> MmeResult<()> {
        let known = msg
            .s_tmsi
            .and_then(|s_tmsi| self.guti_of(&s_tmsi))
            .and_then(|guti| self.repository().find(&UeKey::Guti(guti)));

        self.evict_enb_key(&msg, known.as_ref())?;

        let handle = match known {
            Some(handle) => {
                let mut ue = lock_ue(&handle)?;
                if let Some(old) = ue.enb_key.filter(|old| *old != msg.enb_key) {
                    log::info!(
                        "[ue_id={}] stale eNB association {:?} released",
                        ue.mme_ue_s1ap_id,
                        old
                    );
                    self.ue_context_release(&ue, S1apReleaseCause::InvalidEnbId)?;
                }
                ue.enb_key = Some(msg.enb_key);
                self.update_keys(&ue)?;
                self.stop_timer(&mut ue, MmeTimerId::Paging);
                drop(ue);
                handle
            }
            None => {
                let mut ue = UeContext::new();
                ue.enb_key = Some(msg.enb_key);
                let ue_id = self.repository().insert(ue)?;
                log::info!("[ue_id={}] new subscriber context", ue_id);
                self.find_ue(&UeKey::MmeUeS1apId(ue_id))?
            }
        };

        let mut ue = lock_ue(&handle)?;
        ue.tai = msg.tai;
        ue.ecgi = msg.ecgi;
        let ue_id = ue.mme_ue_s1ap_id;

        self.send_s1ap(S1apMessage::MmeUeS1apIdAssociation {
            mme_ue_s1ap_id: ue_id,
            enb_ue_s1ap_id: msg.enb_key.enb_ue_s1ap_id,
            sctp_assoc_id: msg.enb_key.sctp_assoc_id,
        })?;
        self.send_emm(EmmProcRequest::EstablishIndication {
            ue_id,
            nas_pdu: msg.nas_pdu,
            tai: msg.tai,
            ecgi: msg.ecgi,
            s_tmsi: msg.s_tmsi,
        })
    }

    /// A context other than `keep` still owning the eNB key of `msg` loses it
    fn evict_enb_key(&self, msg: &InitialUeMessageData, keep: Option<&UeHandle>) -> MmeResult<()> {
        let Some(holder) = self.repository().find(&UeKey::Enb(msg.enb_key)) else {
            return Ok(());
        };
        if keep.is_some_and(|keep| Arc::ptr_eq(keep, &holder)) {
            return Ok(());
        }
        let mut ue = lock_ue(&holder)?;
        log::warn!(
            "[ue_id={}] eNB key {:?} reused by a new connection",
            ue.mme_ue_s1ap_id,
            msg.enb_key
        );
        ue.enb_key = None;
        self.update_keys(&ue)
    }

    // ========================================================================
    // Initial Context Setup
    // ========================================================================

    pub fn handle_initial_context_setup_response(
        &self,
        ue_id: MmeUeS1apId,
        e_rabs: Vec<ERabSetupItem>,
        e_rabs_failed: Vec<u8>,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        self.stop_timer(&mut ue, MmeTimerId::InitialContextSetupRsp);

        for raw in &e_rabs_failed {
            log::warn!("[ue_id={}] eNB failed to set up ebi={}", ue_id, raw);
        }

        let Some(first) = e_rabs.first() else {
            log::warn!("[ue_id={}] initial context setup response without E-RAB", ue_id);
            return Ok(());
        };
        let (_, pdn) = ue.pdn_of(first_ebi(ue_id, first)?)?;
        let (teid, peer_addr) = (pdn.s_gw_teid_s11_s4, pdn.s_gw_address_s11_s4);

        let bearers_to_modify = self.apply_enb_tunnels(&mut ue, &e_rabs)?;
        self.send_s11(S11Message::ModifyBearerRequest(ModifyBearerRequest {
            teid,
            peer_addr,
            bearers_to_modify,
            bearers_to_remove: Vec::new(),
            rat_type: RatType::Eutran,
        }))?;

        if ue.location_info_confirmed_in_hss {
            self.update_location(&mut ue)?;
        }
        if let Some(sgs) = ue.sgs.as_mut() {
            sgs.csfb_service_type = CsfbServiceType::None;
            sgs.mt_call_in_progress = false;
        }
        Ok(())
    }

    /// Record the eNB S1-U endpoints of `items`
    fn apply_enb_tunnels(
        &self,
        ue: &mut UeContext,
        items: &[ERabSetupItem],
    ) -> MmeResult<Vec<BearerToModify>> {
        let ue_id = ue.mme_ue_s1ap_id;
        let mut modified = Vec::with_capacity(items.len());
        for item in items {
            let ebi = first_ebi(ue_id, item)?;
            ue.bearer_mut(ebi)?.mark_enb_created(item.enb_s1u)?;
            modified.push(BearerToModify {
                ebi,
                enb_s1u: item.enb_s1u,
            });
        }
        Ok(modified)
    }

    pub fn handle_initial_context_setup_failure(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        self.stop_timer(&mut ue, MmeTimerId::InitialContextSetupRsp);
        log::warn!("[ue_id={}] initial context setup failed", ue_id);
        self.abort_initial_context_setup(&mut ue, S1apReleaseCause::InitialContextSetupFailed)
    }

    /// Shared by the setup failure and the guard timer. An unregistered
    /// subscriber is detached, a registered one loses its radio bearers.
    pub(crate) fn abort_initial_context_setup(
        &self,
        ue: &mut UeContext,
        cause: S1apReleaseCause,
    ) -> MmeResult<()> {
        let ue_id = ue.mme_ue_s1ap_id;
        ue.release_cause = Some(cause);

        if !ue.is_registered() {
            log::info!("[ue_id={}] attach aborted, implicit detach", ue_id);
            return self.send_emm_cn(EmmCnPrimitive::ImplicitDetachUe { ue_id });
        }

        if self.release_access_bearers(ue)? == 0 {
            self.ue_context_release(ue, cause)?;
            if cause.moves_to_idle() {
                self.enter_idle(ue)?;
                ue.release_cause = None;
            }
        }

        let csfb_pending = ue
            .sgs
            .as_ref()
            .is_some_and(|sgs| sgs.csfb_service_type != CsfbServiceType::None);
        if csfb_pending {
            self.csfb_procedure_failure(ue, FailedProcedure::InitialContextSetup)?;
        }
        Ok(())
    }

    // ========================================================================
    // E-RAB Results
    // ========================================================================

    pub fn handle_e_rab_setup_response(
        &self,
        ue_id: MmeUeS1apId,
        succeeded: Vec<ERabSetupItem>,
        failed: Vec<u8>,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        self.apply_enb_tunnels(&mut ue, &succeeded)?;
        for raw in failed {
            log::warn!("[ue_id={}] E-RAB setup failed for ebi={}", ue_id, raw);
        }
        Ok(())
    }

    pub fn handle_e_rab_release_response(
        &self,
        ue_id: MmeUeS1apId,
        released: Vec<u8>,
    ) -> MmeResult<()> {
        log::debug!("[ue_id={}] E-RAB release response for {:?}", ue_id, released);
        Ok(())
    }

    // ========================================================================
    // Path Switch
    // ========================================================================

    /// X2 handover completion. The new association replaces the old one in
    /// one key update; the gateway is told which bearers stay.
    pub fn handle_path_switch_request(&self, req: PathSwitchRequestData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(req.mme_ue_s1ap_id))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        ue.enb_key = Some(req.enb_key);
        ue.tai = req.tai;
        ue.ecgi = req.ecgi;
        ue.security.capabilities = req.security_capabilities;
        self.update_keys(&ue)?;

        let mut kept = Vec::with_capacity(req.e_rabs.len());
        for item in &req.e_rabs {
            match Ebi::new(item.ebi).filter(|ebi| ue.bearer(*ebi).is_ok()) {
                Some(ebi) => kept.push(ebi),
                None => log::warn!("[ue_id={}] unknown ebi={} in path switch", ue_id, item.ebi),
            }
        }
        let ebis_to_remove: Vec<Ebi> = ue
            .bearers
            .iter()
            .map(|bearer| bearer.ebi)
            .filter(|ebi| !kept.contains(ebi))
            .collect();

        let Some(first) = kept.first().copied() else {
            log::warn!("[ue_id={}] no known bearer in path switch", ue_id);
            return self.send_s1ap(S1apMessage::PathSwitchRequestFailure {
                mme_ue_s1ap_id: ue_id,
                enb_ue_s1ap_id: req.enb_key.enb_ue_s1ap_id,
                sctp_assoc_id: req.enb_key.sctp_assoc_id,
            });
        };
        let (_, pdn) = ue.pdn_of(first)?;
        let (teid, peer_addr) = (pdn.s_gw_teid_s11_s4, pdn.s_gw_address_s11_s4);

        let known: Vec<ERabSetupItem> = req
            .e_rabs
            .iter()
            .filter(|item| Ebi::new(item.ebi).is_some_and(|ebi| kept.contains(&ebi)))
            .copied()
            .collect();
        let bearers_to_modify = self.apply_enb_tunnels(&mut ue, &known)?;

        log::info!(
            "[ue_id={}] path switch: {} kept, {} removed",
            ue_id,
            bearers_to_modify.len(),
            ebis_to_remove.len()
        );
        self.send_s11(S11Message::ModifyBearerRequest(ModifyBearerRequest {
            teid,
            peer_addr,
            bearers_to_modify,
            bearers_to_remove: ebis_to_remove.clone(),
            rat_type: RatType::Eutran,
        }))?;
        ue.path_switch = Some(PendingPathSwitch { ebis_to_remove });
        Ok(())
    }

    // ========================================================================
    // UE Context Release Request
    // ========================================================================

    pub fn handle_ue_context_release_request(
        &self,
        ue_id: MmeUeS1apId,
        cause: S1apReleaseCause,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        log::info!("[ue_id={}] eNB requests release ({})", ue_id, cause.name());
        ue.release_cause = Some(cause);

        if cause == S1apReleaseCause::CsfbTriggered {
            let tunnels: Vec<_> = ue
                .pdns
                .iter()
                .filter(|(_, pdn)| pdn.has_gateway_tunnel())
                .map(|(cid, _)| cid)
                .collect();
            for cid in &tunnels {
                self.suspend_notification(&ue, *cid)?;
            }
            if !tunnels.is_empty() {
                return Ok(());
            }
        } else if self.release_access_bearers(&ue)? > 0 {
            return Ok(());
        }

        self.ue_context_release(&ue, cause)?;
        if cause.moves_to_idle() {
            self.enter_idle(&mut ue)?;
            ue.release_cause = None;
        }
        Ok(())
    }

    /// Radio connection gone. A subscriber without a session left is removed.
    pub fn handle_ue_context_release_complete(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        ue.release_cause = None;

        if !ue.is_registered() && ue.mme_teid_s11 == 0 {
            self.stop_all_timers(&mut ue);
            drop(ue);
            self.repository().remove(ue_id);
            log::info!("[ue_id={}] context removed after release", ue_id);
            return Ok(());
        }
        if ue.is_connected() || ue.enb_key.is_some() {
            self.enter_idle(&mut ue)?;
        }
        Ok(())
    }

    // ========================================================================
    // UE Context Modification
    // ========================================================================

    pub fn handle_ue_context_modification_response(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        self.stop_timer(&mut ue, MmeTimerId::UeContextModification);
        Ok(())
    }

    pub fn handle_ue_context_modification_failure(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        self.stop_timer(&mut ue, MmeTimerId::UeContextModification);
        log::warn!("[ue_id={}] UE context modification failed", ue_id);
        if ue.sgs.is_some() {
            self.csfb_procedure_failure(&mut ue, FailedProcedure::UeContextModification)?;
        }
        Ok(())
    }
}

fn first_ebi(ue_id: MmeUeS1apId, item: &ERabSetupItem) -> MmeResult<Ebi> {
    Ebi::new(item.ebi).ok_or_else(|| {
        MmeError::ProtocolViolation(format!("ue_id={} invalid ebi={} from eNB", ue_id, item.ebi))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::config::MmeConfig;
    use crate::context::{
        EcmState, ECgi, EnbUeKey, EpsGuti, EpsTai, Fteid, IpAddr, MmState, PdnCid, PdnContext,
        Qos, STmsi, SgsContext,
    };
    use crate::dispatch::{DispatchQueue, S6aMessage};
    use crate::esm_build::PdnType;
    use crate::repository::InMemoryUeRepository;
    use crate::timer::TimerManager;

    fn setup() -> (
        BearerManager,
        Arc<InMemoryUeRepository>,
        Arc<DispatchQueue>,
        Arc<TimerManager>,
    ) {
        let repo = Arc::new(InMemoryUeRepository::default());
        let dispatch = Arc::new(DispatchQueue::new());
        let timers = Arc::new(TimerManager::new());
        let manager = BearerManager::new(
            repo.clone(),
            dispatch.clone(),
            timers.clone(),
            MmeConfig::default(),
        );
        (manager, repo, dispatch, timers)
    }

    fn enb(id: u32) -> EnbUeKey {
        EnbUeKey {
            sctp_assoc_id: 1,
            enb_ue_s1ap_id: id,
        }
    }

    fn initial_ue_message(enb_ue_s1ap_id: u32, s_tmsi: Option<STmsi>) -> InitialUeMessageData {
        InitialUeMessageData {
            enb_key: enb(enb_ue_s1ap_id),
            s_tmsi,
            tai: EpsTai::default(),
            ecgi: ECgi::default(),
            nas_pdu: Bytes::from_static(&[0x07, 0x41]),
        }
    }

    fn ebi(v: u8) -> Ebi {
        Ebi::new(v).unwrap()
    }

    fn fteid(teid: u32) -> Fteid {
        Fteid::new(teid, IpAddr::v4([10, 0, 0, 1]))
    }

    /// Connected subscriber with default bearer 5 and dedicated bearer 6,
    /// both established on the radio side
    fn connected_ue(repo: &InMemoryUeRepository) -> MmeUeS1apId {
        let mut ue = UeContext::new();
        ue.enb_key = Some(enb(10));
        ue.ecm_state = EcmState::Connected;
        ue.mm_state = MmState::Registered;
        ue.mme_teid_s11 = 0x1001;
        let cid = PdnCid::new(0).unwrap();
        let mut pdn = PdnContext::new(1, "internet", PdnType::Ipv4);
        pdn.s_gw_teid_s11_s4 = 0x2002;
        ue.insert_pdn(cid, pdn).unwrap();
        for v in [5, 6] {
            let bearer = ue.add_bearer(cid, ebi(v), Qos::default()).unwrap();
            bearer.mark_sgw_created(fteid(0x300 + v as u32), None).unwrap();
            bearer.mark_enb_created(fteid(0x400 + v as u32)).unwrap();
        }
        repo.insert(ue).unwrap()
    }

    fn lock(repo: &InMemoryUeRepository, ue_id: MmeUeS1apId) -> crate::repository::UeHandle {
        repo.get(&UeKey::MmeUeS1apId(ue_id)).unwrap()
    }

    #[test]
    fn test_initial_ue_message_creates_context() {
        let (manager, repo, dispatch, _) = setup();
        manager
            .handle_initial_ue_message(initial_ue_message(77, None))
            .unwrap();

        assert_eq!(repo.len(), 1);
        let handle = repo.get(&UeKey::Enb(enb(77))).unwrap();
        let ue_id = lock_ue(&handle).unwrap().mme_ue_s1ap_id;
        assert!(matches!(
            dispatch.s1ap()[0],
            S1apMessage::MmeUeS1apIdAssociation {
                mme_ue_s1ap_id: id,
                enb_ue_s1ap_id: 77,
                ..
            } if id == ue_id
        ));
        assert!(matches!(
            dispatch.emm()[0],
            EmmProcRequest::EstablishIndication { ue_id: id, .. } if id == ue_id
        ));
    }

    #[test]
    fn test_initial_ue_message_resolves_guti() {
        let (manager, repo, dispatch, timers) = setup();
        let ue_id = connected_ue(&repo);
        let s_tmsi = STmsi {
            mme_code: manager.gummei().mme_code,
            m_tmsi: 0xc0ffee,
        };
        {
            let handle = lock(&repo, ue_id);
            let mut ue = lock_ue(&handle).unwrap();
            ue.emm.guti = Some(EpsGuti::from_s_tmsi(manager.gummei(), &s_tmsi));
            manager.update_keys(&ue).unwrap();
            manager.start_timer(&mut ue, MmeTimerId::Paging);
        }

        manager
            .handle_initial_ue_message(initial_ue_message(88, Some(s_tmsi)))
            .unwrap();

        assert_eq!(repo.len(), 1);
        assert!(matches!(
            dispatch.s1ap()[0],
            S1apMessage::UeContextReleaseCommand {
                enb_ue_s1ap_id: 10,
                cause: S1apReleaseCause::InvalidEnbId,
                ..
            }
        ));
        assert!(repo.find(&UeKey::Enb(enb(10))).is_none());
        assert!(repo.find(&UeKey::Enb(enb(88))).is_some());
        assert!(!timers.is_armed(ue_id, MmeTimerId::Paging));
    }

    #[test]
    fn test_initial_ue_message_foreign_mme_code() {
        let (manager, repo, _, _) = setup();
        let ue_id = connected_ue(&repo);
        let s_tmsi = STmsi {
            mme_code: manager.gummei().mme_code.wrapping_add(1),
            m_tmsi: 0xc0ffee,
        };
        {
            let handle = lock(&repo, ue_id);
            let mut ue = lock_ue(&handle).unwrap();
            ue.emm.guti = Some(EpsGuti::from_s_tmsi(manager.gummei(), &s_tmsi));
        }
        manager
            .handle_initial_ue_message(initial_ue_message(99, Some(s_tmsi)))
            .unwrap();
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_initial_context_setup_response_modifies_bearers() {
        let (manager, repo, dispatch, timers) = setup();
        let ue_id = connected_ue(&repo);
        {
            let handle = lock(&repo, ue_id);
            let mut ue = lock_ue(&handle).unwrap();
            ue.location_info_confirmed_in_hss = true;
            ue.sgs = Some(SgsContext {
                csfb_service_type: CsfbServiceType::MtCall,
                mt_call_in_progress: true,
                ..Default::default()
            });
            manager.start_timer(&mut ue, MmeTimerId::InitialContextSetupRsp);
        }

        manager
            .handle_initial_context_setup_response(
                ue_id,
                vec![ERabSetupItem {
                    ebi: 5,
                    enb_s1u: fteid(0x555),
                }],
                vec![6],
            )
            .unwrap();

        assert!(!timers.is_armed(ue_id, MmeTimerId::InitialContextSetupRsp));
        match &dispatch.s11()[0] {
            S11Message::ModifyBearerRequest(req) => {
                assert_eq!(req.teid, 0x2002);
                assert_eq!(req.bearers_to_modify.len(), 1);
                assert_eq!(req.bearers_to_modify[0].enb_s1u, fteid(0x555));
                assert!(req.bearers_to_remove.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(dispatch.snapshot().iter().any(|m| matches!(
            m,
            crate::dispatch::OutboundMessage::S6a(S6aMessage::UpdateLocationRequest { .. })
        )));
        let handle = lock(&repo, ue_id);
        let ue = lock_ue(&handle).unwrap();
        let sgs = ue.sgs.as_ref().unwrap();
        assert_eq!(sgs.csfb_service_type, CsfbServiceType::None);
        assert!(!sgs.mt_call_in_progress);
        assert_eq!(
            ue.bearer(ebi(5)).unwrap().state().enb_s1u(),
            Some(&fteid(0x555))
        );
    }

    #[test]
    fn test_initial_context_setup_failure_unregistered_detaches() {
        let (manager, repo, dispatch, _) = setup();
        let ue_id = connected_ue(&repo);
        {
            let handle = lock(&repo, ue_id);
            lock_ue(&handle).unwrap().mm_state = MmState::Unregistered;
        }
        manager.handle_initial_context_setup_failure(ue_id).unwrap();
        assert_eq!(
            dispatch.emm_cn(),
            vec![EmmCnPrimitive::ImplicitDetachUe { ue_id }]
        );
        assert!(dispatch.s11().is_empty());
    }

    #[test]
    fn test_initial_context_setup_failure_registered_releases() {
        let (manager, repo, dispatch, _) = setup();
        let ue_id = connected_ue(&repo);
        manager.handle_initial_context_setup_failure(ue_id).unwrap();
        assert!(matches!(
            dispatch.s11()[0],
            S11Message::ReleaseAccessBearersRequest { teid: 0x2002, .. }
        ));
        assert!(dispatch.emm_cn().is_empty());
    }

    #[test]
    fn test_path_switch_computes_removed_bearers() {
        let (manager, repo, dispatch, _) = setup();
        let ue_id = connected_ue(&repo);

        manager
            .handle_path_switch_request(PathSwitchRequestData {
                mme_ue_s1ap_id: ue_id,
                enb_key: EnbUeKey {
                    sctp_assoc_id: 2,
                    enb_ue_s1ap_id: 20,
                },
                e_rabs: vec![ERabSetupItem {
                    ebi: 5,
                    enb_s1u: fteid(0x777),
                }],
                security_capabilities: Default::default(),
                tai: EpsTai::default(),
                ecgi: ECgi::default(),
            })
            .unwrap();

        match &dispatch.s11()[0] {
            S11Message::ModifyBearerRequest(req) => {
                assert_eq!(req.bearers_to_modify.len(), 1);
                assert_eq!(req.bearers_to_remove, vec![ebi(6)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(repo.find(&UeKey::Enb(enb(10))).is_none());
        let handle = repo
            .get(&UeKey::Enb(EnbUeKey {
                sctp_assoc_id: 2,
                enb_ue_s1ap_id: 20,
            }))
            .unwrap();
        let ue = lock_ue(&handle).unwrap();
        assert_eq!(ue.path_switch.as_ref().unwrap().ebis_to_remove, vec![ebi(6)]);
    }

    #[test]
    fn test_release_request_asks_gateway_first() {
        let (manager, repo, dispatch, _) = setup();
        let ue_id = connected_ue(&repo);
        manager
            .handle_ue_context_release_request(ue_id, S1apReleaseCause::UserInactivity)
            .unwrap();
        assert_eq!(dispatch.s11().len(), 1);
        assert!(dispatch.s1ap().is_empty());
    }

    #[test]
    fn test_release_complete_enters_idle() {
        let (manager, repo, _, timers) = setup();
        let ue_id = connected_ue(&repo);
        manager.handle_ue_context_release_complete(ue_id).unwrap();

        let handle = lock(&repo, ue_id);
        let ue = lock_ue(&handle).unwrap();
        assert_eq!(ue.ecm_state, EcmState::Idle);
        assert!(!ue.bearer(ebi(6)).unwrap().state().is_enb_created());
        assert!(repo.find(&UeKey::Enb(enb(10))).is_none());
        assert!(timers.is_armed(ue_id, MmeTimerId::MobileReachability));
    }

    #[test]
    fn test_release_complete_removes_sessionless_context() {
        let (manager, repo, _, _) = setup();
        manager
            .handle_initial_ue_message(initial_ue_message(5, None))
            .unwrap();
        let ue_id = repo.ue_ids()[0];
        manager.handle_ue_context_release_complete(ue_id).unwrap();
        assert!(repo.is_empty());
    }

    #[test]
    fn test_release_request_for_csfb_suspends() {
        let (manager, repo, dispatch, _) = setup();
        let ue_id = connected_ue(&repo);
        manager
            .handle_ue_context_release_request(ue_id, S1apReleaseCause::CsfbTriggered)
            .unwrap();
        assert!(matches!(
            dispatch.s11()[0],
            S11Message::SuspendNotification {
                teid: 0x2002,
                linked_ebi,
                ..
            } if linked_ebi == ebi(5)
        ));
    }
}
