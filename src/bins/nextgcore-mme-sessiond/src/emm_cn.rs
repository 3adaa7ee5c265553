//! EMM-CN Coordinator
//!
//! Bridges mobility-management outcomes into session establishment:
//! attach and tracking area update requests, authentication results, APN
//! resolution, PDN connectivity results, detach triggers and circuit-domain
//! registration. Attach and TAU accepts are gated on a one-shot barrier so
//! that a combined registration answers the UE only after both the PDN and
//! the circuit domain have completed.

use std::sync::Arc;

use bytes::Bytes;

use crate::barrier::BarrierOutcome;
use crate::config::MmeConfig;
use crate::context::{
    AcceptPrecondition, ApnConfigProfile, AttachProcedure, AttachType, AuthInfoNotify,
    AuthInfoProcedure, AuthVector, CsfbParams, Ebi, EmmContext, EmmFsmState, EpsUpdateType,
    EsmProcData, Imsi64, Lai, LocationUpdateStatus, MmState, MmeUeS1apId, MobileIdentity,
    NetworkAccessMode, PdnContext, Pti, Qos, SgsContext, SgsState, TauProcedure, UeContext,
};
use crate::dispatch::{Dispatch, OutboundMessage, S6aMessage};
use crate::emm_build::{CsDomainResult, DetachRequest, DetachType, EmmCause, EmmProcRequest};
use crate::error::MmeResult;
use crate::esm_build::{
    build_activate_default_bearer_context_request, build_pdn_connectivity_reject,
    DefaultBearerActivation, EsmCause,
};
use crate::event::{
    AttachRequestData, CsDomainLocationUpdateAccData, EmmCnPrimitive, NasEvent,
    PdnConnectivityResData,
};
use crate::repository::{lock_ue, UeHandle, UeKey, UeKeys, UeRepository};
use crate::s11_build::GtpCause;
use crate::sgsap_build::{EpsLocationUpdateType, SgsDetachType, SgsMessage};

// ============================================================================
// Authentication Callbacks
// ============================================================================

/// Authentication-info callbacks of an attach: challenge the UE with the
/// first vector, or reject the attach.
#[derive(Debug, Clone, Copy)]
pub struct DefaultAuthInfoNotify {
    pub ue_id: MmeUeS1apId,
}

impl AuthInfoNotify for DefaultAuthInfoNotify {
    fn success(
        &mut self,
        emm: &mut EmmContext,
        vectors: Vec<AuthVector>,
    ) -> MmeResult<Option<EmmProcRequest>> {
        let Some(first) = vectors.first() else {
            log::warn!("[ue_id={}] HSS returned no authentication vector", self.ue_id);
            return self.failure(emm, EmmCause::NetworkFailure);
        };
        let req = EmmProcRequest::AuthenticationRequest {
            ue_id: self.ue_id,
            rand: first.rand,
            autn: first.autn,
        };
        emm.auth_vectors = vectors;
        Ok(Some(req))
    }

    fn failure(
        &mut self,
        emm: &mut EmmContext,
        cause: EmmCause,
    ) -> MmeResult<Option<EmmProcRequest>> {
        emm.emm_cause = Some(cause);
        emm.attach_proc = None;
        Ok(Some(EmmProcRequest::AttachReject {
            ue_id: self.ue_id,
            emm_cause: cause,
            esm_msg: None,
        }))
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Which accept a circuit-domain outcome resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAccept {
    Attach,
    Tau,
}

pub struct EmmCnCoordinator {
    repo: Arc<dyn UeRepository>,
    dispatch: Arc<dyn Dispatch>,
    config: MmeConfig,
}

impl EmmCnCoordinator {
    pub fn new(
        repo: Arc<dyn UeRepository>,
        dispatch: Arc<dyn Dispatch>,
        config: MmeConfig,
    ) -> Self {
        Self {
            repo,
            dispatch,
            config,
        }
    }

    pub fn handle_primitive(&self, primitive: EmmCnPrimitive) -> MmeResult<()> {
        log::debug!("EMM-CN primitive {}", primitive.name());
        match primitive {
            EmmCnPrimitive::AuthRes { ue_id, vectors } => self.handle_auth_res(ue_id, vectors),
            EmmCnPrimitive::AuthFail { ue_id, cause } => self.handle_auth_fail(ue_id, cause),
            EmmCnPrimitive::SmcFail { ue_id, emm_cause } => self.handle_smc_fail(ue_id, emm_cause),
            EmmCnPrimitive::Deregister { ue_id } => self.handle_deregister(ue_id),
            EmmCnPrimitive::PdnConfigRes {
                ue_id,
                apn_profile,
                network_access_mode,
            } => self.handle_pdn_config_res(ue_id, apn_profile, network_access_mode),
            EmmCnPrimitive::PdnConnectivityRes(res) => self.handle_pdn_connectivity_res(res),
            EmmCnPrimitive::PdnConnectivityFail { ue_id, pti, cause } => {
                self.handle_pdn_connectivity_fail(ue_id, pti, cause)
            }
            EmmCnPrimitive::ImplicitDetachUe { ue_id } => self.handle_implicit_detach(ue_id),
            EmmCnPrimitive::NwInitiatedDetachUe { ue_id, detach_type } => {
                self.handle_nw_initiated_detach(ue_id, detach_type)
            }
            EmmCnPrimitive::ActivateDedicatedBearerReq {
                ue_id,
                pdn_cid: _,
                ebi,
                linked_ebi,
                qos,
                sgw_s1u,
                tft,
                pco,
            } => {
                self.find_ue(ue_id)?;
                self.send_emm(EmmProcRequest::ActivateDedicatedBearer {
                    ue_id,
                    ebi,
                    linked_ebi,
                    qos,
                    sgw_s1u,
                    tft,
                    pco,
                })
            }
            EmmCnPrimitive::DeactivateDedicatedBearerReq {
                ue_id,
                ebis,
                delete_default_bearer,
            } => {
                self.find_ue(ue_id)?;
                self.send_emm(EmmProcRequest::DeactivateDedicatedBearer {
                    ue_id,
                    ebis,
                    pcrf_initiated: true,
                    delete_default_bearer,
                })
            }
            EmmCnPrimitive::CsDomainLocationUpdateAcc(acc) => {
                self.handle_cs_domain_location_update_acc(acc)
            }
            EmmCnPrimitive::CsDomainLocationUpdateFail { ue_id, lai, cause } => {
                self.handle_cs_domain_location_update_fail(ue_id, lai, cause)
            }
            EmmCnPrimitive::CsDomainMmInformationReq { imsi, information } => {
                self.handle_cs_domain_mm_information_req(imsi, information)
            }
        }
    }

    fn find_ue(&self, ue_id: MmeUeS1apId) -> MmeResult<UeHandle> {
        self.repo.get(&UeKey::MmeUeS1apId(ue_id)).map_err(|e| {
            log::warn!("{}", e);
            e
        })
    }

    fn send(&self, msg: OutboundMessage) -> MmeResult<()> {
        log::debug!("Sending {}", msg.name());
        self.dispatch.send(msg)
    }

    fn send_emm(&self, req: EmmProcRequest) -> MmeResult<()> {
        self.send(OutboundMessage::Emm(req))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Open the attach procedure and ask the HSS for authentication vectors
    pub fn handle_attach_request(&self, req: AttachRequestData) -> MmeResult<()> {
        let handle = self.find_ue(req.ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        let Some(imsi) = req.imsi.or(ue.imsi) else {
            log::warn!("[ue_id={}] attach without a usable identity", ue_id);
            return self.send_emm(EmmProcRequest::AttachReject {
                ue_id,
                emm_cause: EmmCause::UeIdentityCannotBeDerived,
                esm_msg: None,
            });
        };
        if let Some(stale) = self.repo.resolve(&UeKey::Imsi(imsi)).filter(|id| *id != ue_id) {
            log::warn!(
                "[ue_id={}] IMSI {} re-attached, stale context {} removed",
                ue_id,
                imsi,
                stale
            );
            self.repo.remove(stale);
        }
        if ue.emm.attach_proc.is_some() {
            log::warn!("[ue_id={}] attach restarted", ue_id);
        }

        ue.imsi = Some(imsi);
        ue.mm_state = MmState::Unregistered;
        let emm = &mut ue.emm;
        emm.fsm_state = EmmFsmState::CommonProcedureInitiated;
        emm.attach_type = req.attach_type;
        emm.old_guti = req.old_guti;
        emm.emm_cause = None;
        emm.csfb = CsfbParams::default();
        emm.tau_proc = None;
        emm.attach_proc = Some(AttachProcedure::new(req.attach_type));
        emm.esm_proc_data = Some(EsmProcData {
            pti: req.pti,
            apn: req.apn,
            pdn_type: req.pdn_type,
            pco: req.pco,
            ..Default::default()
        });
        self.repo.update_keys(ue_id, UeKeys::of(&ue))?;
        log::info!("[ue_id={}] {:?} attach for IMSI {}", ue_id, req.attach_type, imsi);

        ue.emm.auth_info_proc = Some(AuthInfoProcedure {
            notify: Box::new(DefaultAuthInfoNotify { ue_id }),
        });
        self.send(OutboundMessage::S6a(S6aMessage::AuthenticationInformationRequest {
            ue_id,
            imsi,
        }))
    }

    /// Tracking area update of a registered UE. A combined update holds the
    /// accept until the circuit domain answers.
    pub fn handle_tau_request(
        &self,
        ue_id: MmeUeS1apId,
        update_type: EpsUpdateType,
    ) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        if !ue.is_registered() {
            log::warn!("[ue_id={}] TAU from an unregistered UE", ue_id);
            return self.send_emm(EmmProcRequest::TauReject {
                ue_id,
                emm_cause: EmmCause::ImplicitlyDetached,
            });
        }

        ue.emm.tau_update_type = update_type;
        ue.emm.emm_cause = None;
        ue.emm.csfb.sgs_loc_updt_status = None;
        let combined = matches!(
            update_type,
            EpsUpdateType::CombinedTaLaUpdating | EpsUpdateType::CombinedTaLaUpdatingWithImsiAttach
        );
        if !self.uses_cs_domain(&mut ue, combined) {
            ue.emm.tau_proc = None;
            log::info!("[ue_id={}] {:?} TAU accepted", ue_id, update_type);
            return self.send_tau_accept(&mut ue);
        }

        ue.emm.tau_proc = Some(TauProcedure::new(update_type, true));
        let sgs = ue.sgs.get_or_insert_with(SgsContext::default);
        let location_update = if update_type == EpsUpdateType::CombinedTaLaUpdatingWithImsiAttach
            || sgs.state != SgsState::Associated
        {
            EpsLocationUpdateType::ImsiAttach
        } else {
            EpsLocationUpdateType::NormalLocationUpdate
        };
        sgs.state = SgsState::LaUpdateRequested;
        log::info!("[ue_id={}] TAU accept waits for the circuit domain", ue_id);
        self.send(OutboundMessage::Sgs(SgsMessage::LocationUpdateRequest {
            mme_ue_s1ap_id: ue_id,
            imsi: ue.imsi,
            update_type: location_update,
        }))
    }

    /// Attach complete or TAU complete: the UE now holds its GUTI
    pub fn handle_registration_complete(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let accepted = ue
            .emm
            .attach_proc
            .as_ref()
            .map(|p| p.accept.has_fired())
            .or_else(|| ue.emm.tau_proc.as_ref().map(|p| p.accept.has_fired()));
        match accepted {
            None => {
                log::warn!("[ue_id={}] registration complete without a procedure", ue_id);
                return Ok(());
            }
            Some(false) => {
                log::warn!("[ue_id={}] registration complete before the accept", ue_id);
                return Ok(());
            }
            Some(true) => {}
        }
        ue.emm.attach_proc = None;
        ue.emm.tau_proc = None;
        ue.emm.old_guti = None;
        ue.emm.fsm_state = EmmFsmState::Registered;
        ue.mm_state = MmState::Registered;
        log::info!("[ue_id={}] registered", ue_id);
        Ok(())
    }

    /// The EMM procedures finished a detach; forget the registration
    pub fn handle_deregistered(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        ue.mm_state = MmState::Unregistered;
        let emm = &mut ue.emm;
        emm.fsm_state = EmmFsmState::Deregistered;
        emm.attach_proc = None;
        emm.tau_proc = None;
        emm.auth_info_proc = None;
        emm.esm_proc_data = None;
        emm.auth_vectors.clear();
        if let Some(sgs) = ue.sgs.as_mut() {
            sgs.state = SgsState::Null;
        }
        log::info!("[ue_id={}] deregistered", ue_id);
        Ok(())
    }

    // ========================================================================
    // Authentication and Security
    // ========================================================================

    fn handle_auth_res(&self, ue_id: MmeUeS1apId, vectors: Vec<AuthVector>) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let Some(mut procedure) = ue.emm.auth_info_proc.take() else {
            log::error!("[ue_id={}] authentication vectors without a pending procedure", ue_id);
            return Ok(());
        };
        if let Some(req) = procedure.notify.success(&mut ue.emm, vectors)? {
            self.send_emm(req)?;
        }
        Ok(())
    }

    fn handle_auth_fail(&self, ue_id: MmeUeS1apId, cause: EmmCause) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let Some(mut procedure) = ue.emm.auth_info_proc.take() else {
            log::error!("[ue_id={}] authentication failure without a pending procedure", ue_id);
            return Ok(());
        };
        if let Some(req) = procedure.notify.failure(&mut ue.emm, cause)? {
            self.send_emm(req)?;
        }
        Ok(())
    }

    fn handle_smc_fail(&self, ue_id: MmeUeS1apId, emm_cause: EmmCause) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        log::warn!("[ue_id={}] security mode failed ({:?})", ue_id, emm_cause);
        ue.emm.emm_cause = Some(emm_cause);
        ue.emm.attach_proc = None;
        self.send_emm(EmmProcRequest::AttachReject {
            ue_id,
            emm_cause,
            esm_msg: None,
        })
    }

    // ========================================================================
    // PDN Configuration and Connectivity
    // ========================================================================

    fn handle_pdn_config_res(
        &self,
        ue_id: MmeUeS1apId,
        apn_profile: ApnConfigProfile,
        network_access_mode: NetworkAccessMode,
    ) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        ue.emm.apn_profile = apn_profile;
        ue.emm.network_access_mode = network_access_mode;

        let esm = ue.emm.esm_proc_data.clone().unwrap_or_default();
        let Some(apn_config) = ue.emm.apn_profile.select(esm.apn.as_deref()).cloned() else {
            log::warn!("[ue_id={}] no APN configuration for {:?}", ue_id, esm.apn);
            return self.reject_unsupported_apn(&mut ue, esm.pti);
        };

        if let Some(cid) = ue.find_pdn_by_context_identifier(apn_config.context_identifier) {
            let pdn = ue.pdn(cid)?;
            let established = pdn.has_gateway_tunnel();
            log::info!(
                "[ue_id={}] reusing pdn {} for apn '{}'",
                ue_id,
                cid,
                apn_config.service_selection
            );
            if let Some(esm) = ue.emm.esm_proc_data.as_mut() {
                esm.pdn_cid = Some(cid);
            }
            if established {
                return Ok(());
            }
            return self.send(OutboundMessage::MmeApp(NasEvent::PdnConnectivityReq {
                ue_id,
                pdn_cid: cid,
            }));
        }

        let (Some(cid), Some(ebi)) = (ue.pdns.first_free(), ue.allocate_ebi(0)) else {
            log::warn!("[ue_id={}] no free PDN or bearer slot", ue_id);
            return self.reject_unsupported_apn(&mut ue, esm.pti);
        };
        let mut pdn = PdnContext::new(
            apn_config.context_identifier,
            apn_config.service_selection.clone(),
            apn_config.pdn_type,
        );
        pdn.subscribed_apn_ambr = apn_config.ambr;
        pdn.paa = esm.pdn_addr;
        pdn.pco = esm.pco.clone();
        ue.insert_pdn(cid, pdn)?;
        let qos = Qos {
            qci: apn_config.qci,
            arp: apn_config.arp,
            ..Default::default()
        };
        let bearer = ue.add_bearer(cid, ebi, qos)?;
        bearer.transaction_id = esm.pti;
        if let Some(esm) = ue.emm.esm_proc_data.as_mut() {
            esm.pdn_cid = Some(cid);
        }
        log::info!(
            "[ue_id={}] pdn {} allocated for apn '{}' (ebi={})",
            ue_id,
            cid,
            apn_config.service_selection,
            ebi
        );
        self.send(OutboundMessage::MmeApp(NasEvent::PdnConnectivityReq {
            ue_id,
            pdn_cid: cid,
        }))
    }

    fn reject_unsupported_apn(&self, ue: &mut UeContext, pti: Pti) -> MmeResult<()> {
        ue.emm.attach_proc = None;
        ue.emm.esm_proc_data = None;
        self.send_emm(EmmProcRequest::AttachReject {
            ue_id: ue.mme_ue_s1ap_id,
            emm_cause: EmmCause::EsmFailure,
            esm_msg: Some(build_pdn_connectivity_reject(pti, EsmCause::MissingOrUnknownApn)),
        })
    }

    fn handle_pdn_connectivity_res(&self, res: PdnConnectivityResData) -> MmeResult<()> {
        let handle = self.find_ue(res.ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        let pdn = ue.pdn(res.pdn_cid)?;
        let requested_pdn_type = ue
            .emm
            .esm_proc_data
            .as_ref()
            .map(|esm| esm.pdn_type)
            .unwrap_or(pdn.pdn_type);
        let esm_msg = build_activate_default_bearer_context_request(&DefaultBearerActivation {
            pti: res.pti,
            ebi: Ebi::new(res.ebi),
            qos: res.qos,
            apn: pdn.apn_in_use.clone(),
            paa: res.paa.unwrap_or_default(),
            requested_pdn_type,
            apn_ambr: res.apn_ambr,
            pco: res.pco,
        });
        ue.emm.esm_proc_data = None;

        let Some(attach_type) = ue.emm.attach_proc.as_ref().map(|p| p.attach_type) else {
            log::info!("[ue_id={}] PDN connectivity without a pending attach", ue_id);
            return Ok(());
        };

        if self.uses_cs_domain(&mut ue, attach_type == AttachType::CombinedEpsImsi) {
            if let Some(attach) = ue.emm.attach_proc.as_mut() {
                attach.accept.require(AcceptPrecondition::CsDomainLocationUpdate);
            }
            ue.emm.csfb.esm_data = Some(esm_msg);
            ue.sgs.get_or_insert_with(SgsContext::default).state = SgsState::LaUpdateRequested;
            log::info!("[ue_id={}] attach accept waits for the circuit domain", ue_id);
            self.send(OutboundMessage::Sgs(SgsMessage::LocationUpdateRequest {
                mme_ue_s1ap_id: ue_id,
                imsi: ue.imsi,
                update_type: EpsLocationUpdateType::ImsiAttach,
            }))?;
        } else if let Some(attach) = ue.emm.attach_proc.as_mut() {
            attach.esm_msg_out = Some(esm_msg);
        }

        self.satisfy(&mut ue, PendingAccept::Attach, AcceptPrecondition::PdnConnectivity)
    }

    /// Combined registration with SGs enabled and a subscription that allows CS
    fn uses_cs_domain(&self, ue: &mut UeContext, combined: bool) -> bool {
        if !combined {
            return false;
        }
        if !self.config.non_eps_service_control.uses_sgs() {
            return false;
        }
        if ue.emm.network_access_mode == NetworkAccessMode::PacketOnly {
            log::info!(
                "[ue_id={}] packet-only subscription, CS domain skipped",
                ue.mme_ue_s1ap_id
            );
            ue.emm.emm_cause = Some(EmmCause::CsDomainNotAvailable);
            return false;
        }
        true
    }

    fn handle_pdn_connectivity_fail(
        &self,
        ue_id: MmeUeS1apId,
        pti: Pti,
        cause: GtpCause,
    ) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let esm_cause = EsmCause::from_gtp_cause(cause);
        log::warn!(
            "[ue_id={}] PDN connectivity failed ({:?} -> {:?})",
            ue_id,
            cause,
            esm_cause
        );
        ue.emm.esm_proc_data = None;
        ue.emm.attach_proc = None;
        ue.emm.emm_cause = Some(EmmCause::EsmFailure);
        self.send_emm(EmmProcRequest::AttachReject {
            ue_id,
            emm_cause: EmmCause::EsmFailure,
            esm_msg: Some(build_pdn_connectivity_reject(pti, esm_cause)),
        })
    }

    // ========================================================================
    // Accept Barrier
    // ========================================================================

    fn satisfy(
        &self,
        ue: &mut UeContext,
        pending: PendingAccept,
        precondition: AcceptPrecondition,
    ) -> MmeResult<()> {
        let ue_id = ue.mme_ue_s1ap_id;
        let barrier = match pending {
            PendingAccept::Attach => ue.emm.attach_proc.as_mut().map(|p| &mut p.accept),
            PendingAccept::Tau => ue.emm.tau_proc.as_mut().map(|p| &mut p.accept),
        };
        let Some(barrier) = barrier else {
            log::warn!("[ue_id={}] no {:?} accept pending for {:?}", ue_id, pending, precondition);
            return Ok(());
        };
        let outcome = barrier.satisfy(precondition);
        log::debug!("[ue_id={}] {:?} accept {:?}: {}", ue_id, pending, precondition, outcome);
        match (outcome, pending) {
            (BarrierOutcome::Fired, PendingAccept::Attach) => self.send_attach_accept(ue),
            (BarrierOutcome::Fired, PendingAccept::Tau) => self.send_tau_accept(ue),
            _ => Ok(()),
        }
    }

    fn send_attach_accept(&self, ue: &mut UeContext) -> MmeResult<()> {
        let ue_id = ue.mme_ue_s1ap_id;
        let esm_msg = ue
            .emm
            .attach_proc
            .as_mut()
            .and_then(|p| p.esm_msg_out.take())
            .or_else(|| ue.emm.csfb.esm_data.take());
        self.send_emm(EmmProcRequest::AttachAccept {
            ue_id,
            esm_msg,
            cs_domain: cs_domain_result(&ue.emm),
        })?;

        if let (Some(old), Some(current)) = (ue.emm.old_guti, ue.emm.guti) {
            if old != current {
                log::debug!("[ue_id={}] implicit GUTI reallocation {} -> {}", ue_id, old, current);
                self.send_emm(EmmProcRequest::CommonProcedureInitiated { ue_id })?;
            }
        }
        Ok(())
    }

    fn send_tau_accept(&self, ue: &mut UeContext) -> MmeResult<()> {
        self.send_emm(EmmProcRequest::TauAccept {
            ue_id: ue.mme_ue_s1ap_id,
            cs_domain: cs_domain_result(&ue.emm),
        })
    }

    fn pending_accept(ue: &UeContext) -> PendingAccept {
        if ue.is_registered() {
            PendingAccept::Tau
        } else {
            PendingAccept::Attach
        }
    }

    // ========================================================================
    // Detach
    // ========================================================================

    fn handle_implicit_detach(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        if ue.sgs.is_some() {
            let detach_type = if ue.emm.attach_type == AttachType::CombinedEpsImsi {
                SgsDetachType::ImplicitNonEps
            } else {
                SgsDetachType::Eps
            };
            self.send(OutboundMessage::Sgs(SgsMessage::DetachIndication {
                mme_ue_s1ap_id: ue_id,
                imsi: ue.imsi,
                detach_type,
            }))?;
        }
        self.detach(
            &mut ue,
            DetachRequest {
                detach_type: DetachType::Eps,
                switch_off: true,
                native_sc: true,
                ksi: 0,
                cause: EmmCause::ImplicitlyDetached,
            },
        )
    }

    fn handle_deregister(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let cause = ue.emm.emm_cause.unwrap_or_default();
        self.detach(
            &mut ue,
            DetachRequest {
                detach_type: DetachType::Eps,
                switch_off: false,
                native_sc: false,
                ksi: 0,
                cause,
            },
        )
    }

    fn handle_nw_initiated_detach(
        &self,
        ue_id: MmeUeS1apId,
        detach_type: DetachType,
    ) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let cause = ue.emm.emm_cause.unwrap_or_default();
        self.detach(
            &mut ue,
            DetachRequest {
                detach_type,
                switch_off: false,
                native_sc: true,
                ksi: 0,
                cause,
            },
        )
    }

    fn detach(&self, ue: &mut UeContext, request: DetachRequest) -> MmeResult<()> {
        log::info!(
            "[ue_id={}] detach {:?} (switch_off={}, cause={:?})",
            ue.mme_ue_s1ap_id,
            request.detach_type,
            request.switch_off,
            request.cause
        );
        ue.emm.emm_cause = Some(request.cause);
        self.send_emm(EmmProcRequest::Detach {
            ue_id: ue.mme_ue_s1ap_id,
            request,
        })
    }

    // ========================================================================
    // Circuit Domain
    // ========================================================================

    fn handle_cs_domain_location_update_acc(
        &self,
        acc: CsDomainLocationUpdateAccData,
    ) -> MmeResult<()> {
        let handle = self.find_ue(acc.ue_id)?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;
        let associated = ue
            .sgs
            .as_ref()
            .is_some_and(|sgs| sgs.state == SgsState::Associated);

        if associated {
            ue.emm.csfb.additional_update_result = acc.additional_update_result;
        } else {
            let csfb = &mut ue.emm.csfb;
            csfb.lai = Some(acc.lai);
            if let Some(identity) = acc.mobile_identity {
                if matches!(identity, MobileIdentity::Tmsi(_))
                    && csfb.mobile_identity.as_ref() != Some(&identity)
                {
                    csfb.new_tmsi_allocated = true;
                }
                csfb.mobile_identity = Some(identity);
            }
            csfb.sgs_loc_updt_status = Some(LocationUpdateStatus::Success);
            csfb.additional_update_result = acc.additional_update_result;
            ue.sgs.get_or_insert_with(SgsContext::default).state = SgsState::Associated;
        }
        log::info!("[ue_id={}] circuit domain location update accepted", ue_id);

        let pending = Self::pending_accept(&ue);
        self.satisfy(&mut ue, pending, AcceptPrecondition::CsDomainLocationUpdate)
    }

    fn handle_cs_domain_location_update_fail(
        &self,
        ue_id: MmeUeS1apId,
        lai: Option<Lai>,
        cause: EmmCause,
    ) -> MmeResult<()> {
        let handle = self.find_ue(ue_id)?;
        let mut ue = lock_ue(&handle)?;
        if let Some(lai) = lai {
            ue.emm.csfb.lai = Some(lai);
        }
        ue.emm.emm_cause = Some(cause);
        ue.emm.csfb.sgs_loc_updt_status = Some(LocationUpdateStatus::Failure);
        if let Some(sgs) = ue.sgs.as_mut() {
            sgs.state = SgsState::Null;
        }
        log::warn!("[ue_id={}] circuit domain location update failed ({:?})", ue_id, cause);

        match Self::pending_accept(&ue) {
            PendingAccept::Attach => {
                self.satisfy(
                    &mut ue,
                    PendingAccept::Attach,
                    AcceptPrecondition::CsDomainLocationUpdate,
                )
            }
            PendingAccept::Tau => {
                let update_type = ue
                    .emm
                    .tau_proc
                    .as_ref()
                    .map(|p| p.update_type)
                    .unwrap_or(ue.emm.tau_update_type);
                if update_type == EpsUpdateType::CombinedTaLaUpdatingWithImsiAttach {
                    ue.emm.tau_proc = None;
                    return self.send_emm(EmmProcRequest::TauReject {
                        ue_id,
                        emm_cause: cause,
                    });
                }
                self.satisfy(
                    &mut ue,
                    PendingAccept::Tau,
                    AcceptPrecondition::CsDomainLocationUpdate,
                )
            }
        }
    }

    fn handle_cs_domain_mm_information_req(
        &self,
        imsi: Imsi64,
        information: Bytes,
    ) -> MmeResult<()> {
        let Some(handle) = self.repo.find(&UeKey::Imsi(imsi)) else {
            log::warn!("MM information for unknown IMSI {}", imsi);
            return Ok(());
        };
        let ue = lock_ue(&handle)?;
        if !ue.is_connected() || ue.sgs.is_none() {
            log::info!(
                "[ue_id={}] MM information dropped, UE not reachable over SGs",
                ue.mme_ue_s1ap_id
            );
            return Ok(());
        }
        self.send_emm(EmmProcRequest::EmmInformation {
            ue_id: ue.mme_ue_s1ap_id,
            information,
        })
    }
}

/// Circuit-domain part of an accept, when a registration was attempted
fn cs_domain_result(emm: &EmmContext) -> Option<CsDomainResult> {
    let csfb = &emm.csfb;
    let failed = csfb.sgs_loc_updt_status == Some(LocationUpdateStatus::Failure);
    if csfb.sgs_loc_updt_status.is_none() && emm.emm_cause != Some(EmmCause::CsDomainNotAvailable) {
        return None;
    }
    Some(CsDomainResult {
        lai: csfb.lai,
        mobile_identity: if failed { None } else { csfb.mobile_identity.clone() },
        additional_update_result: csfb.additional_update_result,
        emm_cause: if csfb.sgs_loc_updt_status == Some(LocationUpdateStatus::Success) {
            None
        } else {
            emm.emm_cause
        },
    })
}
