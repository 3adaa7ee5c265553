//! NAS Request Handling
//!
//! Requests the EMM/ESM procedures hand back to the lifecycle manager:
//! connection establishment, default session creation, E-RAB setup and
//! release, and the per-bearer answers of dedicated bearer activation and
//! deactivation.

use bytes::Bytes;

use crate::bearer_manager::BearerManager;
use crate::context::{Bitrate, CsfbServiceType, EcmState, Ebi, ImsiAuth, MmeUeS1apId, PdnCid};
use crate::emm_build::{DetachType, EmmCause, FailedProcedure};
use crate::error::{Lookup, MmeError, MmeResult};
use crate::event::{ConnEstCnfData, CsfbResponse, EmmCnPrimitive, ServiceType};
use crate::nas_security::init_next_hop;
use crate::procedure::ReportOutcome;
use crate::repository::{lock_ue, UeKey};
use crate::s11_build::{
    created_bearer_results, CreateBearerResponse, CreateSessionRequest, GtpCause, RatType,
    S11Message,
};
use crate::s1ap_build::{
    CsfbIndicator, ERabToBeSetup, InitialContextSetupRequest, S1apMessage,
};
use crate::sgsap_build::{SgsDetachType, SgsMessage, SgsapCause, ServiceIndicator, UeEmmMode};
use crate::timer::MmeTimerId;

impl BearerManager {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Security is in place for an attach: hand out a GUTI and fetch the
    /// subscription from the HSS
    pub fn handle_security_mode_complete(&self, ue_id: MmeUeS1apId) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        ue.imsi_auth = ImsiAuth::Authenticated;
        if ue.emm.attach_proc.is_none() {
            log::debug!("[ue_id={}] security mode complete outside an attach", ue_id);
            return Ok(());
        }
        if ue.imsi.is_none() {
            return Err(MmeError::InvalidState(format!(
                "ue_id={} attach without IMSI",
                ue_id
            )));
        }

        let guti = self.allocate_guti(ue_id);
        ue.emm.guti = Some(guti);
        self.update_keys(&ue)?;
        log::info!("[ue_id={}] GUTI {} allocated", ue_id, guti);
        self.update_location(&mut ue)
    }

    // ========================================================================
    // Connection Establishment
    // ========================================================================

    /// Mobility layer accepted the connection; set up the radio bearers
    pub fn handle_connection_establishment_confirm(
        &self,
        mut cnf: ConnEstCnfData,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(cnf.ue_id))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;

        if ue.pending_detach {
            ue.pending_detach = false;
            log::info!("[ue_id={}] paged for a deferred detach", ue_id);
            return self.send_emm_cn(EmmCnPrimitive::NwInitiatedDetachUe {
                ue_id,
                detach_type: DetachType::Eps,
            });
        }

        let enb_key = ue.enb_key.ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} has no eNB association", ue_id))
        })?;

        ue.security.kasme = cnf.kasme;
        ue.security.kenb = cnf.kenb;
        ue.security.capabilities = cnf.security_capabilities;
        init_next_hop(&mut ue.security)?;

        // CS fallback preconditions
        let imsi = ue.imsi;
        match ue.sgs.as_ref().map(|sgs| sgs.csfb_service_type) {
            Some(CsfbServiceType::MtSms) => {
                self.send_sgs(SgsMessage::ServiceRequest {
                    imsi,
                    service_indicator: ServiceIndicator::Sms,
                    ue_emm_mode: UeEmmMode::EmmIdle,
                })?;
            }
            Some(CsfbServiceType::MtCallOrSmsWithoutLai) => {
                self.send_sgs(SgsMessage::DetachIndication {
                    mme_ue_s1ap_id: ue_id,
                    imsi,
                    detach_type: SgsDetachType::ImsiDetach,
                })?;
                if let Some(sgs) = ue.sgs.as_mut() {
                    sgs.reset_csfb();
                }
                return Ok(());
            }
            Some(CsfbServiceType::MtCall)
                if ue.sgs.as_ref().is_some_and(|sgs| sgs.call_cancelled) =>
            {
                if let Some(sgs) = ue.sgs.as_mut() {
                    sgs.call_cancelled = false;
                    sgs.reset_csfb();
                }
                return self.notify_service_reject(
                    ue_id,
                    EmmCause::CsServiceTemporarilyNotAvailable,
                    FailedProcedure::MtCallCancelledByNwInIdleState,
                );
            }
            _ => {}
        }
        match cnf.service_type {
            Some(ServiceType::MoCsfb | ServiceType::MoCsfb1 | ServiceType::MoCsfbEmergency) => {
                let emergency = cnf.service_type == Some(ServiceType::MoCsfbEmergency);
                match ue.sgs.as_mut() {
                    Some(sgs) => {
                        sgs.csfb_service_type = CsfbServiceType::MoCall;
                        sgs.is_emergency_call |= emergency;
                    }
                    None => {
                        log::warn!("[ue_id={}] MO CS fallback without SGs association", ue_id);
                        return self.notify_service_reject(
                            ue_id,
                            EmmCause::Congestion,
                            FailedProcedure::InitialContextSetup,
                        );
                    }
                }
            }
            Some(ServiceType::MtCsfb | ServiceType::MtCsfb1)
                if cnf.csfb_response == Some(CsfbResponse::RejectedByUe) =>
            {
                log::info!("[ue_id={}] MT CS fallback rejected by the UE", ue_id);
                return self.send_sgs(SgsMessage::PagingReject {
                    imsi,
                    cause: SgsapCause::MtCsfbCallRejectedByUser,
                });
            }
            _ => {}
        }

        let mut nas_pdu = cnf.nas_pdu.take();
        let mut e_rabs = Vec::new();
        for bearer in ue.bearers.iter() {
            let Some(sgw_s1u) = bearer.state().sgw_s1u() else {
                continue;
            };
            e_rabs.push(ERabToBeSetup {
                ebi: bearer.ebi,
                qos: bearer.qos,
                sgw_s1u: *sgw_s1u,
                nas_pdu: nas_pdu.take(),
            });
        }

        let csfb_indicator = match ue.sgs.as_mut() {
            Some(sgs)
                if matches!(
                    sgs.csfb_service_type,
                    CsfbServiceType::MoCall | CsfbServiceType::MtCall
                ) =>
            {
                if sgs.is_emergency_call {
                    sgs.is_emergency_call = false;
                    Some(CsfbIndicator::HighPriority)
                } else {
                    Some(CsfbIndicator::Required)
                }
            }
            _ => None,
        };

        log::info!(
            "[ue_id={}] initial context setup with {} E-RAB(s)",
            ue_id,
            e_rabs.len()
        );
        self.send_s1ap(S1apMessage::InitialContextSetupRequest(
            InitialContextSetupRequest {
                mme_ue_s1ap_id: ue_id,
                enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
                sctp_assoc_id: enb_key.sctp_assoc_id,
                ue_ambr: ue.ue_ambr,
                e_rabs,
                security_capabilities: ue.security.capabilities,
                kenb: ue.security.kenb,
                csfb_indicator,
                ue_radio_capability: ue.ue_radio_capability.clone(),
            },
        ))?;
        self.start_timer(&mut ue, MmeTimerId::InitialContextSetupRsp);

        if ue.ecm_state == EcmState::Idle {
            ue.ecm_state = EcmState::Connected;
            self.stop_timer(&mut ue, MmeTimerId::MobileReachability);
            self.stop_timer(&mut ue, MmeTimerId::ImplicitDetach);
            log::info!("[ue_id={}] now ECM-CONNECTED", ue_id);
            let mt_call = ue
                .sgs
                .as_ref()
                .is_some_and(|sgs| sgs.csfb_service_type == CsfbServiceType::MtCall);
            if mt_call {
                self.send_sgs(SgsMessage::ServiceRequest {
                    imsi,
                    service_indicator: ServiceIndicator::CsCall,
                    ue_emm_mode: UeEmmMode::EmmIdle,
                })?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Default Session
    // ========================================================================

    /// Ask the gateway for the session of `pdn_cid`. The answer arrives as a
    /// create session response.
    pub fn initiate_default_session(&self, ue_id: MmeUeS1apId, pdn_cid: PdnCid) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;

        ue.imsi_auth = ImsiAuth::Authenticated;
        if ue.mme_teid_s11 == 0 {
            ue.mme_teid_s11 = ue_id;
            self.update_keys(&ue)?;
        }

        let default_ebi = ue.pdn(pdn_cid)?.default_ebi().ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} pdn {} has no default bearer", ue_id, pdn_cid))
        })?;
        let bearer = ue.bearer_mut(default_ebi)?;
        bearer.mark_mme_created()?;
        let bearer_qos = bearer.qos;

        let pdn = ue.pdn(pdn_cid)?;
        let req = CreateSessionRequest {
            sender_teid: ue.mme_teid_s11,
            imsi: ue.imsi,
            msisdn: ue.msisdn.clone(),
            apn: pdn.apn_in_use.clone(),
            pdn_type: pdn.pdn_type,
            paa: pdn.paa,
            default_ebi,
            bearer_qos,
            apn_ambr: pdn.subscribed_apn_ambr,
            pco: pdn.pco.clone(),
            rat_type: RatType::Eutran,
            serving_network: ue.tai.plmn_id,
            tai: ue.tai,
            ecgi: ue.ecgi,
        };
        log::info!(
            "[ue_id={}] create session for apn '{}' (ebi={})",
            ue_id,
            req.apn,
            default_ebi
        );
        self.send_s11(S11Message::CreateSessionRequest(req))
    }

    // ========================================================================
    // E-RAB Setup / Release
    // ========================================================================

    pub fn handle_e_rab_setup_request(
        &self,
        ue_id: MmeUeS1apId,
        ebi: u8,
        mbr: Bitrate,
        gbr: Bitrate,
        nas_pdu: Option<Bytes>,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let ue = lock_ue(&handle)?;
        let enb_key = ue.enb_key.ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} has no eNB association", ue_id))
        })?;
        let bearer = ue.bearer_by_raw(ebi)?;
        let sgw_s1u = *bearer.state().sgw_s1u().ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} ebi={} has no gateway tunnel", ue_id, ebi))
        })?;
        let mut qos = bearer.qos;
        qos.mbr = mbr;
        qos.gbr = gbr;

        self.send_s1ap(S1apMessage::ERabSetupRequest {
            mme_ue_s1ap_id: ue_id,
            enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
            e_rab: ERabToBeSetup {
                ebi: bearer.ebi,
                qos,
                sgw_s1u,
                nas_pdu,
            },
        })
    }

    pub fn handle_e_rab_release_command(
        &self,
        ue_id: MmeUeS1apId,
        ebi: u8,
        nas_pdu: Option<Bytes>,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let ue = lock_ue(&handle)?;
        let enb_key = ue.enb_key.ok_or_else(|| {
            MmeError::InvalidState(format!("ue_id={} has no eNB association", ue_id))
        })?;
        let ebi = ue.bearer_by_raw(ebi)?.ebi;
        self.send_s1ap(S1apMessage::ERabReleaseCommand {
            mme_ue_s1ap_id: ue_id,
            enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
            ebi,
            nas_pdu,
        })
    }

    // ========================================================================
    // Dedicated Bearer Activation Results
    // ========================================================================

    /// One bearer of the running create bearer procedure was answered by the
    /// UE. The gateway hears back once every bearer has been answered.
    pub fn handle_activate_dedicated_bearer_result(
        &self,
        ue_id: MmeUeS1apId,
        ebi: u8,
        success: bool,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        let ebi = Ebi::new(ebi).ok_or(MmeError::NotFound(Lookup::Bearer { ue_id, ebi }))?;

        let outcome = ue
            .create_bearer_proc
            .as_mut()
            .ok_or(MmeError::NotFound(Lookup::CreateBearerProcedure { ue_id }))?
            .report(ebi, success)?;
        if !success {
            log::warn!("[ue_id={}] UE rejected dedicated bearer ebi={}", ue_id, ebi);
            ue.bearer_mut(ebi)?.reset();
        }

        let ReportOutcome::Complete(outcome) = outcome else {
            return Ok(());
        };
        let Some(procedure) = ue.create_bearer_proc.take() else {
            return Ok(());
        };

        let accepted: Vec<_> = outcome
            .accepted
            .iter()
            .filter_map(|ebi| ue.bearer(*ebi).ok())
            .map(|bearer| {
                (
                    bearer.ebi,
                    bearer.state().enb_s1u().copied(),
                    bearer.state().sgw_s1u().copied(),
                )
            })
            .collect();
        for ebi in &outcome.rejected {
            ue.remove_bearer(*ebi);
        }

        log::info!(
            "[ue_id={}] create bearer procedure done: {:?}, {} accepted, {} rejected",
            ue_id,
            outcome.cause,
            outcome.accepted.len(),
            outcome.rejected.len()
        );
        self.send_s11(S11Message::CreateBearerResponse(CreateBearerResponse {
            teid: procedure.transaction.sgw_teid,
            sequence: procedure.transaction.sequence,
            cause: outcome.cause,
            bearers: created_bearer_results(&accepted, &outcome.rejected),
        }))
    }

    // ========================================================================
    // Dedicated Bearer Deactivation Results
    // ========================================================================

    pub fn handle_deactivate_dedicated_bearer_result(
        &self,
        ue_id: MmeUeS1apId,
        ebis: Vec<u8>,
        delete_default_bearer: bool,
        success: bool,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        let ebis: Vec<Ebi> = ebis.into_iter().filter_map(Ebi::new).collect();
        let pending = ue.delete_bearers.take(&ebis).ok_or_else(|| {
            MmeError::InvalidState(format!(
                "ue_id={} has no pending delete bearer request for {:?}",
                ue_id, ebis
            ))
        })?;
        if pending.delete_default_bearer != delete_default_bearer {
            log::warn!(
                "[ue_id={}] deactivation reported default={} for a request with default={}",
                ue_id,
                delete_default_bearer,
                pending.delete_default_bearer
            );
        }

        let cause = if success {
            for ebi in &ebis {
                if ue.remove_bearer(*ebi).is_none() {
                    log::warn!("[ue_id={}] bearer ebi={} already gone", ue_id, ebi);
                }
            }
            GtpCause::RequestAccepted
        } else {
            log::warn!("[ue_id={}] UE did not deactivate {:?}", ue_id, ebis);
            GtpCause::UeNotResponding
        };
        self.send_delete_bearer_response(
            pending.transaction,
            pending.delete_default_bearer,
            &ebis,
            cause,
        )
    }
}
