//! S11 Message Handling
//!
//! Lifecycle-manager reactions to the serving gateway: session creation and
//! deletion, bearer modification (including the path switch leg), access
//! bearer release, gateway-initiated bearer creation/deletion, suspend and
//! downlink data notification.

use crate::bearer_manager::{BearerManager, PagingTarget};
use crate::context::{Bitrate, Ebi, EcmState, PdnCid, Teid, UeContext};
use crate::dispatch::S6aMessage;
use crate::emm_build::DetachType;
use crate::error::{MmeError, MmeResult};
use crate::event::{
    BearerToCreate, CreateBearerRequestData, CreateSessionResponseData, DeleteBearerRequestData,
    EmmCnPrimitive, ModifyBearerResponseData, NwActivateBearerData, PdnConnectivityResData,
};
use crate::nas_security::advance_next_hop;
use crate::procedure::{CreateBearerProcedure, GatewayTransaction, PendingDeleteBearer};
use crate::repository::{lock_ue, UeKey};
use crate::s11_build::{CreateBearerResponse, DeleteBearerResponse, GtpCause, S11Message};
use crate::s1ap_build::{PagingDomain, S1apMessage, S1apReleaseCause};
use crate::timer::MmeTimerId;
use crate::timer_handler::pending_pti;

impl BearerManager {
    // ========================================================================
    // Session Creation / Deletion
    // ========================================================================

    /// Gateway answered the create session request of a default bearer. The
    /// mobility layer always hears back, whatever the response carries.
    pub fn handle_create_session_response(&self, rsp: CreateSessionResponseData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(rsp.teid))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        let default_ebi = rsp
            .bearers
            .first()
            .and_then(|first| Ebi::new(first.ebi))
            .filter(|ebi| ue.bearers.get(*ebi).is_some());

        if !rsp.cause.is_accepted() {
            let pti = default_ebi
                .and_then(|ebi| ue.bearers.get(ebi))
                .map(|bearer| bearer.transaction_id)
                .or_else(|| pending_pti(&ue))
                .unwrap_or(0);
            log::warn!(
                "[ue_id={}] create session rejected by gateway, cause {:?}",
                ue_id,
                rsp.cause
            );
            return self.send_emm_cn(EmmCnPrimitive::PdnConnectivityFail {
                ue_id,
                pti,
                cause: rsp.cause,
            });
        }

        let Some(default_ebi) = default_ebi else {
            log::error!(
                "[ue_id={}] create session response without a known default bearer",
                ue_id
            );
            return self.send_emm_cn(EmmCnPrimitive::PdnConnectivityFail {
                ue_id,
                pti: pending_pti(&ue).unwrap_or(0),
                cause: GtpCause::MandatoryIeMissing,
            });
        };
        let pti = ue.bearer(default_ebi)?.transaction_id;

        for created in &rsp.bearers {
            let Some(ebi) = Ebi::new(created.ebi) else {
                log::warn!("[ue_id={}] skipping invalid ebi={}", ue_id, created.ebi);
                continue;
            };
            if !created.cause.is_accepted() {
                log::warn!(
                    "[ue_id={}] bearer ebi={} not created, cause {:?}",
                    ue_id,
                    ebi,
                    created.cause
                );
                continue;
            }
            let Some(sgw_s1u) = created.sgw_s1u else {
                log::error!("[ue_id={}] ebi={} accepted without S1-U F-TEID", ue_id, ebi);
                continue;
            };
            let Ok(bearer) = ue.bearer_mut(ebi) else {
                log::warn!("[ue_id={}] gateway created unknown ebi={}", ue_id, ebi);
                continue;
            };
            bearer.mark_sgw_created(sgw_s1u, created.pgw_s5u)?;
            if let Some(qos) = created.qos {
                bearer.qos = qos;
            }
        }

        if !ue.bearer(default_ebi)?.state().is_sgw_created() {
            log::error!("[ue_id={}] default bearer ebi={} not created", ue_id, default_ebi);
            return self.send_emm_cn(EmmCnPrimitive::PdnConnectivityFail {
                ue_id,
                pti,
                cause: GtpCause::MandatoryIeMissing,
            });
        }

        let pdn_cid = ue.bearer(default_ebi)?.pdn_cid;
        let pdn = ue.pdn_mut(pdn_cid)?;
        if let Some(sgw_s11) = rsp.sgw_s11 {
            pdn.s_gw_teid_s11_s4 = sgw_s11.teid;
            pdn.s_gw_address_s11_s4 = sgw_s11.addr;
        }
        if rsp.paa.is_some() {
            pdn.paa = rsp.paa;
        }
        if let Some(ambr) = rsp.apn_ambr {
            pdn.subscribed_apn_ambr = ambr;
        }
        if rsp.pco.is_some() {
            pdn.pco = rsp.pco.clone();
        }
        let (paa, apn_ambr, pco) = (pdn.paa, pdn.subscribed_apn_ambr, pdn.pco.clone());
        let qos = ue.bearer(default_ebi)?.qos;

        log::info!(
            "[ue_id={}] session created for pdn {} (default ebi={})",
            ue_id,
            pdn_cid,
            default_ebi
        );
        self.send_emm_cn(EmmCnPrimitive::PdnConnectivityRes(PdnConnectivityResData {
            ue_id,
            pdn_cid,
            pti,
            ebi: default_ebi.value(),
            qos,
            paa,
            apn_ambr,
            pco,
        }))
    }

    pub fn handle_delete_session_response(&self, teid: Teid, cause: GtpCause) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(teid))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        if !cause.is_accepted() {
            log::warn!("[ue_id={}] delete session response cause {:?}", ue_id, cause);
        }
        ue.mme_teid_s11 = 0;
        self.update_keys(&ue)?;

        if !ue.is_connected() {
            self.ue_context_release(&ue, S1apReleaseCause::ImplicitContextRelease)?;
            if ue.send_purge_to_hss {
                self.send_s6a(S6aMessage::PurgeUeRequest { imsi: ue.imsi })?;
            }
            self.stop_all_timers(&mut ue);
            drop(ue);
            self.repository().remove(ue_id);
            log::info!("[ue_id={}] context removed after session deletion", ue_id);
            return Ok(());
        }

        if ue.sgs.as_ref().is_some_and(|sgs| sgs.ts9_running) {
            log::info!(
                "[ue_id={}] EPS detach indication pending, release deferred",
                ue_id
            );
            return Ok(());
        }
        let cause = ue.release_cause.unwrap_or(S1apReleaseCause::NasDetach);
        self.ue_context_release(&ue, cause)
    }

    // ========================================================================
    // Modify Bearer
    // ========================================================================

    pub fn handle_modify_bearer_response(&self, rsp: ModifyBearerResponseData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(rsp.teid))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        if let Some(path_switch) = ue.path_switch.take() {
            let enb_key = ue.enb_key.ok_or_else(|| {
                MmeError::InvalidState(format!("ue_id={} path switch without eNB", ue_id))
            })?;
            if rsp.bearers_modified.is_empty() || !rsp.cause.is_accepted() {
                log::warn!(
                    "[ue_id={}] gateway modified no bearer, path switch failed",
                    ue_id
                );
                return self.send_s1ap(S1apMessage::PathSwitchRequestFailure {
                    mme_ue_s1ap_id: ue_id,
                    enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
                    sctp_assoc_id: enb_key.sctp_assoc_id,
                });
            }
            let (nh, ncc) = advance_next_hop(&mut ue.security)?;
            for ebi in &path_switch.ebis_to_remove {
                ue.remove_bearer(*ebi);
            }
            log::info!("[ue_id={}] path switch acknowledged (ncc={})", ue_id, ncc);
            return self.send_s1ap(S1apMessage::PathSwitchRequestAcknowledge {
                mme_ue_s1ap_id: ue_id,
                enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
                sctp_assoc_id: enb_key.sctp_assoc_id,
                nh,
                ncc,
                e_rabs_to_release: path_switch.ebis_to_remove,
            });
        }

        if !rsp.cause.is_accepted() {
            log::warn!("[ue_id={}] modify bearer response cause {:?}", ue_id, rsp.cause);
        }
        for raw in &rsp.bearers_removed {
            if let Some(ebi) = Ebi::new(*raw) {
                if ue.remove_bearer(ebi).is_some() {
                    log::debug!("[ue_id={}] bearer ebi={} removed by gateway", ue_id, ebi);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Access Bearer Release
    // ========================================================================

    /// Ask the gateway to drop the S1-U side of every PDN with a tunnel.
    /// Returns how many requests were sent.
    pub(crate) fn release_access_bearers(&self, ue: &UeContext) -> MmeResult<usize> {
        let requests: Vec<S11Message> = ue
            .pdns
            .iter()
            .filter(|(_, pdn)| pdn.has_gateway_tunnel())
            .map(|(_, pdn)| S11Message::ReleaseAccessBearersRequest {
                teid: pdn.s_gw_teid_s11_s4,
                peer_addr: pdn.s_gw_address_s11_s4,
            })
            .collect();
        let sent = requests.len();
        for msg in requests {
            self.send_s11(msg)?;
        }
        Ok(sent)
    }

    pub fn handle_release_access_bearers_response(
        &self,
        teid: Teid,
        cause: GtpCause,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(teid))?;
        let mut ue = lock_ue(&handle)?;
        if !cause.is_accepted() {
            log::warn!(
                "[ue_id={}] release access bearers response cause {:?}",
                ue.mme_ue_s1ap_id,
                cause
            );
        }
        let release_cause = ue.release_cause.unwrap_or(S1apReleaseCause::NasNormalRelease);
        self.ue_context_release(&ue, release_cause)?;
        if release_cause.moves_to_idle() {
            self.enter_idle(&mut ue)?;
            ue.release_cause = None;
        }
        Ok(())
    }

    /// Drop the radio association and fall back to ECM-IDLE
    pub(crate) fn enter_idle(&self, ue: &mut UeContext) -> MmeResult<()> {
        for bearer in ue.bearers_mut() {
            bearer.release_enb();
        }
        ue.ecm_state = EcmState::Idle;
        ue.enb_key = None;
        self.update_keys(ue)?;
        if ue.is_registered() {
            self.start_timer(ue, MmeTimerId::MobileReachability);
        }
        log::info!("[ue_id={}] now ECM-IDLE", ue.mme_ue_s1ap_id);
        Ok(())
    }

    // ========================================================================
    // Gateway-initiated Bearer Creation
    // ========================================================================

    /// Create one dedicated bearer per requested bearer context. The gateway
    /// is answered once every bearer has been accepted or rejected.
    pub fn handle_create_bearer_request(&self, req: CreateBearerRequestData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(req.teid))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;
        let transaction = GatewayTransaction {
            sgw_teid: req.sgw_teid,
            sequence: req.sequence,
        };

        let linked = Ebi::new(req.linked_ebi)
            .and_then(|ebi| ue.bearer(ebi).ok().map(|bearer| (ebi, bearer.pdn_cid)));
        let Some((linked_ebi, pdn_cid)) = linked else {
            log::error!("[ue_id={}] linked bearer ebi={} unknown", ue_id, req.linked_ebi);
            return self.reject_create_bearer(transaction, GtpCause::ContextNotFound);
        };
        if req.bearers.is_empty() {
            return self.reject_create_bearer(transaction, GtpCause::MandatoryIeMissing);
        }
        if ue.create_bearer_proc.is_some() {
            log::warn!("[ue_id={}] create bearer procedure already running", ue_id);
            return self.reject_create_bearer(transaction, GtpCause::RequestRejected);
        }

        let ebis = match allocate_dedicated_bearers(&mut ue, pdn_cid, &req.bearers) {
            Ok(ebis) => ebis,
            Err(cause) => return self.reject_create_bearer(transaction, cause),
        };
        ue.create_bearer_proc = Some(CreateBearerProcedure::new(
            transaction,
            pdn_cid,
            linked_ebi,
            &ebis,
        ));
        log::info!(
            "[ue_id={}] create bearer procedure opened for {} bearer(s)",
            ue_id,
            ebis.len()
        );

        for (item, ebi) in req.bearers.iter().zip(ebis.iter()) {
            let sent = self.send_emm_cn(EmmCnPrimitive::ActivateDedicatedBearerReq {
                ue_id,
                pdn_cid,
                ebi: ebi.value(),
                linked_ebi: linked_ebi.value(),
                qos: item.qos,
                sgw_s1u: item.sgw_s1u,
                tft: item.tft.clone(),
                pco: item.pco.clone(),
            });
            if let Err(e) = sent {
                log::error!("[ue_id={}] create bearer fan-out failed: {}", ue_id, e);
                ue.create_bearer_proc = None;
                for ebi in &ebis {
                    ue.remove_bearer(*ebi);
                }
                return self.reject_create_bearer(transaction, GtpCause::SystemFailure);
            }
        }
        Ok(())
    }

    fn reject_create_bearer(
        &self,
        transaction: GatewayTransaction,
        cause: GtpCause,
    ) -> MmeResult<()> {
        self.send_s11(S11Message::CreateBearerResponse(CreateBearerResponse {
            teid: transaction.sgw_teid,
            sequence: transaction.sequence,
            cause,
            bearers: Vec::new(),
        }))
    }

    /// Dedicated bearer activation where the mobility layer picks the EBI
    pub fn handle_nw_initiated_activate_bearer_request(
        &self,
        req: NwActivateBearerData,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(req.teid))?;
        let ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        let pdn_cid = ue.bearer_by_raw(req.linked_ebi)?.pdn_cid;
        let default_ebi = ue.pdn(pdn_cid)?.default_ebi().ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} pdn {} has no default bearer", ue_id, pdn_cid))
        })?;
        self.send_emm_cn(EmmCnPrimitive::ActivateDedicatedBearerReq {
            ue_id,
            pdn_cid,
            ebi: 0,
            linked_ebi: default_ebi.value(),
            qos: req.qos,
            sgw_s1u: req.sgw_s1u,
            tft: req.tft,
            pco: req.pco,
        })
    }

    // ========================================================================
    // Gateway-initiated Bearer Deletion
    // ========================================================================

    pub fn handle_delete_bearer_request(&self, req: DeleteBearerRequestData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(req.teid))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        let first = req.ebis.first().copied().ok_or_else(|| {
            MmeError::ProtocolViolation(format!(
                "ue_id={} delete bearer request without ebi",
                ue_id
            ))
        })?;
        let pdn_cid = ue.bearer_by_raw(first)?.pdn_cid;
        let sgw_teid = ue.pdn(pdn_cid)?.s_gw_teid_s11_s4;

        if req.delete_default_bearer && ue.pdns.len() == 1 {
            if ue.is_connected() {
                log::info!("[ue_id={}] last default bearer deleted, detaching", ue_id);
                return self.send_emm_cn(EmmCnPrimitive::NwInitiatedDetachUe {
                    ue_id,
                    detach_type: DetachType::Eps,
                });
            }
            log::info!("[ue_id={}] last default bearer deleted, paging before detach", ue_id);
            self.paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)?;
            ue.pending_detach = true;
            return Ok(());
        }

        let transaction = GatewayTransaction {
            sgw_teid,
            sequence: req.sequence,
        };
        if ue.is_connected() {
            let ebis: Vec<Ebi> = req.ebis.iter().filter_map(|raw| Ebi::new(*raw)).collect();
            let queued = ue.delete_bearers.push(PendingDeleteBearer {
                transaction,
                delete_default_bearer: req.delete_default_bearer,
                ebis,
            });
            if let Err(e) = queued {
                log::warn!("[ue_id={}] delete bearer request refused: {}", ue_id, e);
                return self.send_delete_bearer_response(
                    transaction,
                    req.delete_default_bearer,
                    &[],
                    GtpCause::RequestRejected,
                );
            }
            return self.send_emm_cn(EmmCnPrimitive::DeactivateDedicatedBearerReq {
                ue_id,
                ebis: req.ebis,
                delete_default_bearer: req.delete_default_bearer,
            });
        }

        let mut deleted = Vec::new();
        for raw in &req.ebis {
            match Ebi::new(*raw).and_then(|ebi| ue.remove_bearer(ebi)) {
                Some(bearer) => deleted.push(bearer.ebi),
                None => log::error!("[ue_id={}] bearer ebi={} does not exist", ue_id, raw),
            }
        }
        self.send_delete_bearer_response(
            transaction,
            req.delete_default_bearer,
            &deleted,
            GtpCause::RequestAccepted,
        )
    }

    pub(crate) fn send_delete_bearer_response(
        &self,
        transaction: GatewayTransaction,
        delete_default_bearer: bool,
        ebis: &[Ebi],
        cause: GtpCause,
    ) -> MmeResult<()> {
        let linked_ebi = if delete_default_bearer {
            ebis.first().copied()
        } else {
            None
        };
        self.send_s11(S11Message::DeleteBearerResponse(DeleteBearerResponse {
            teid: transaction.sgw_teid,
            sequence: transaction.sequence,
            cause,
            linked_ebi,
            bearers: ebis.iter().map(|ebi| (*ebi, cause)).collect(),
        }))
    }

    // ========================================================================
    // Suspend
    // ========================================================================

    /// Suspend the PDN of `pdn_cid` at the gateway during CS fallback
    pub fn suspend_notification(&self, ue: &UeContext, pdn_cid: PdnCid) -> MmeResult<()> {
        let pdn = ue.pdn(pdn_cid)?;
        let linked_ebi = pdn.default_ebi().ok_or_else(|| {
            MmeError::InvalidState(format!(
                "ue_id={} pdn {} has no default bearer",
                ue.mme_ue_s1ap_id, pdn_cid
            ))
        })?;
        self.send_s11(S11Message::SuspendNotification {
            teid: pdn.s_gw_teid_s11_s4,
            linked_ebi,
            imsi: ue.imsi,
        })
    }

    pub fn handle_suspend_acknowledge(&self, teid: Teid, cause: GtpCause) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(teid))?;
        let ue = lock_ue(&handle)?;
        log::info!(
            "[ue_id={}] suspend acknowledge, cause {:?}",
            ue.mme_ue_s1ap_id,
            cause
        );
        let release_cause = ue.release_cause.unwrap_or(S1apReleaseCause::CsfbTriggered);
        self.ue_context_release(&ue, release_cause)
    }

    // ========================================================================
    // UE-AMBR and Downlink Data
    // ========================================================================

    pub fn handle_modify_ue_ambr_request(&self, teid: Teid, ue_ambr: Bitrate) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(teid))?;
        let mut ue = lock_ue(&handle)?;
        ue.ue_ambr = ue_ambr;
        let Some(enb_key) = ue.enb_key else {
            log::debug!(
                "[ue_id={}] UE-AMBR stored, no eNB to notify",
                ue.mme_ue_s1ap_id
            );
            return Ok(());
        };
        self.send_s1ap(S1apMessage::UeContextModificationRequest {
            mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
            enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
            csfb_indicator: None,
            ue_ambr: Some(ue_ambr),
        })
    }

    pub fn handle_downlink_data_notification(&self, teid: Teid) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::S11Teid(teid))?;
        let mut ue = lock_ue(&handle)?;
        if ue.is_connected() {
            log::debug!(
                "[ue_id={}] downlink data for a connected UE, nothing to page",
                ue.mme_ue_s1ap_id
            );
            return Ok(());
        }
        self.paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)
    }
}

/// Allocate one dedicated bearer per requested context. On failure nothing
/// allocated here is left behind and the cause for the gateway is returned.
fn allocate_dedicated_bearers(
    ue: &mut UeContext,
    pdn_cid: PdnCid,
    bearers: &[BearerToCreate],
) -> Result<Vec<Ebi>, GtpCause> {
    let ue_id = ue.mme_ue_s1ap_id;
    let mut ebis = Vec::with_capacity(bearers.len());
    for item in bearers {
        let added = match ue.allocate_ebi(item.ebi) {
            Some(ebi) => add_dedicated_bearer(ue, pdn_cid, ebi, item).map_err(|e| {
                log::error!("[ue_id={}] ebi={} not created: {}", ue_id, ebi, e);
                ue.remove_bearer(ebi);
                GtpCause::SystemFailure
            }),
            None => {
                log::error!("[ue_id={}] no free bearer id", ue_id);
                Err(GtpCause::NoResourcesAvailable)
            }
        };
        match added {
            Ok(ebi) => ebis.push(ebi),
            Err(cause) => {
                for ebi in &ebis {
                    ue.remove_bearer(*ebi);
                }
                return Err(cause);
            }
        }
    }
    Ok(ebis)
}

fn add_dedicated_bearer(
    ue: &mut UeContext,
    pdn_cid: PdnCid,
    ebi: Ebi,
    item: &BearerToCreate,
) -> MmeResult<Ebi> {
    let bearer = ue.add_bearer(pdn_cid, ebi, item.qos)?;
    bearer.tft = item.tft.clone();
    bearer.pco = item.pco.clone();
    bearer.mark_mme_created()?;
    bearer.mark_sgw_created(item.sgw_s1u, item.pgw_s5u)?;
    Ok(ebi)
}
