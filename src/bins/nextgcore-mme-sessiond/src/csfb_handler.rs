//! CS Fallback Handling
//!
//! Extended service requests, SGs paging and service abort from the MSC/VLR,
//! and the failure path shared by every CS fallback guard.

use crate::bearer_manager::{BearerManager, PagingTarget};
use crate::context::{CsfbServiceType, Imsi64, Lai, MmeUeS1apId, UeContext};
use crate::emm_build::{EmmCause, FailedProcedure};
use crate::error::{MmeError, MmeResult};
use crate::event::{CsfbResponse, ServiceType};
use crate::repository::{lock_ue, UeKey};
use crate::s1ap_build::{CsfbIndicator, PagingDomain, S1apMessage};
use crate::sgsap_build::{ServiceIndicator, SgsMessage, SgsapCause, UeEmmMode};
use crate::timer::MmeTimerId;

impl BearerManager {
    // ========================================================================
    // Extended Service Request
    // ========================================================================

    pub fn handle_extended_service_request(
        &self,
        ue_id: MmeUeS1apId,
        service_type: ServiceType,
        csfb_response: Option<CsfbResponse>,
    ) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::MmeUeS1apId(ue_id))?;
        let mut ue = lock_ue(&handle)?;
        log::info!(
            "[ue_id={}] extended service request {:?} ({:?})",
            ue_id,
            service_type,
            csfb_response
        );

        match service_type {
            ServiceType::MoCsfb | ServiceType::MoCsfb1 | ServiceType::MtCsfb1 => {
                let Some(sgs) = ue.sgs.as_mut() else {
                    return self.notify_service_reject(
                        ue_id,
                        EmmCause::Congestion,
                        FailedProcedure::UeContextModification,
                    );
                };
                sgs.csfb_service_type = CsfbServiceType::MoCall;
                sgs.call_cancelled = false;
                self.ue_context_modification_for_csfb(&mut ue, CsfbIndicator::Required)
            }
            ServiceType::MtCsfb => {
                let imsi = ue.imsi;
                let Some(sgs) = ue.sgs.as_mut() else {
                    return self.notify_service_reject(
                        ue_id,
                        EmmCause::Congestion,
                        FailedProcedure::UeContextModification,
                    );
                };
                if csfb_response == Some(CsfbResponse::RejectedByUe) {
                    sgs.call_cancelled = false;
                    sgs.reset_csfb();
                    return self.send_sgs(SgsMessage::PagingReject {
                        imsi,
                        cause: SgsapCause::MtCsfbCallRejectedByUser,
                    });
                }
                sgs.mt_call_in_progress = true;
                if sgs.call_cancelled {
                    sgs.call_cancelled = false;
                    sgs.mt_call_in_progress = false;
                    sgs.reset_csfb();
                    log::info!("[ue_id={}] MT call already cancelled by the MSC", ue_id);
                    return self.notify_service_reject(
                        ue_id,
                        EmmCause::CsServiceTemporarilyNotAvailable,
                        FailedProcedure::MtCallCancelledByNwInConnectedState,
                    );
                }
                self.ue_context_modification_for_csfb(&mut ue, CsfbIndicator::Required)
            }
            ServiceType::MoCsfbEmergency => {
                let Some(sgs) = ue.sgs.as_mut() else {
                    return self.notify_service_reject(
                        ue_id,
                        EmmCause::Congestion,
                        FailedProcedure::UeContextModification,
                    );
                };
                sgs.csfb_service_type = CsfbServiceType::MoCall;
                sgs.is_emergency_call = true;
                self.ue_context_modification_for_csfb(&mut ue, CsfbIndicator::HighPriority)
            }
            ServiceType::PacketServicesViaS1 => Ok(()),
        }
    }

    /// Tell the eNB to move the UE to the CS domain, guarded by a timer
    pub(crate) fn ue_context_modification_for_csfb(
        &self,
        ue: &mut UeContext,
        indicator: CsfbIndicator,
    ) -> MmeResult<()> {
        let enb_key = ue.enb_key.ok_or_else(|| {
            MmeError::InvalidState(format!(
                "ue_id={} has no eNB association for CS fallback",
                ue.mme_ue_s1ap_id
            ))
        })?;
        self.send_s1ap(S1apMessage::UeContextModificationRequest {
            mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
            enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
            csfb_indicator: Some(indicator),
            ue_ambr: None,
        })?;
        self.start_timer(ue, MmeTimerId::UeContextModification);
        Ok(())
    }

    // ========================================================================
    // CS Fallback Failure
    // ========================================================================

    /// A CS fallback attempt could not complete. The MSC and the UE are both
    /// answered so neither waits on a dead procedure.
    pub(crate) fn csfb_procedure_failure(
        &self,
        ue: &mut UeContext,
        failed_procedure: FailedProcedure,
    ) -> MmeResult<()> {
        let ue_id = ue.mme_ue_s1ap_id;
        let imsi = ue.imsi;
        let Some(sgs) = ue.sgs.as_mut() else {
            return Ok(());
        };
        sgs.mt_call_in_progress = false;
        let service_type = sgs.csfb_service_type;
        sgs.reset_csfb();
        log::warn!(
            "[ue_id={}] CS fallback {:?} failed ({:?})",
            ue_id,
            service_type,
            failed_procedure
        );

        match service_type {
            CsfbServiceType::MtCall => {
                self.send_sgs(SgsMessage::PagingReject {
                    imsi,
                    cause: SgsapCause::MtCsfbCallRejectedByUser,
                })?;
                self.notify_service_reject(ue_id, EmmCause::Congestion, failed_procedure)
            }
            CsfbServiceType::MoCall => {
                self.notify_service_reject(ue_id, EmmCause::Congestion, failed_procedure)
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // SGs
    // ========================================================================

    /// Mobile terminated CS service announced by the MSC
    pub fn handle_sgs_paging_request(
        &self,
        imsi: Imsi64,
        service_indicator: ServiceIndicator,
        lai: Option<Lai>,
    ) -> MmeResult<()> {
        let Some(handle) = self.repository().find(&UeKey::Imsi(imsi)) else {
            log::warn!("SGs paging for unknown IMSI {}", imsi);
            return self.send_sgs(SgsMessage::PagingReject {
                imsi: Some(imsi),
                cause: SgsapCause::ImsiUnknown,
            });
        };
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;
        let connected = ue.is_connected();

        let Some(sgs) = ue.sgs.as_mut() else {
            log::warn!("[ue_id={}] SGs paging without SGs association", ue_id);
            return self.send_sgs(SgsMessage::PagingReject {
                imsi: Some(imsi),
                cause: SgsapCause::ImsiDetachedForNonEpsServices,
            });
        };
        sgs.service_indicator = service_indicator;
        sgs.csfb_service_type = match (lai, service_indicator) {
            (None, _) => CsfbServiceType::MtCallOrSmsWithoutLai,
            (Some(_), ServiceIndicator::CsCall) => CsfbServiceType::MtCall,
            (Some(_), ServiceIndicator::Sms) => CsfbServiceType::MtSms,
        };

        if connected {
            return self.send_sgs(SgsMessage::ServiceRequest {
                imsi: Some(imsi),
                service_indicator,
                ue_emm_mode: UeEmmMode::EmmConnected,
            });
        }
        let target = if lai.is_some() {
            PagingTarget::STmsi
        } else {
            PagingTarget::Imsi
        };
        self.paging(&mut ue, target, PagingDomain::Cs, true)
    }

    /// The MSC gave up on a mobile terminated call
    pub fn handle_sgs_service_abort_request(&self, imsi: Imsi64) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::Imsi(imsi))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;
        let Some(sgs) = ue.sgs.as_mut() else {
            log::warn!("[ue_id={}] service abort without SGs association", ue_id);
            return Ok(());
        };
        if sgs.csfb_service_type != CsfbServiceType::MtCall {
            log::debug!("[ue_id={}] service abort with no MT call pending", ue_id);
            return Ok(());
        }
        if sgs.mt_call_in_progress {
            log::info!("[ue_id={}] service abort after the UE accepted the call", ue_id);
            return Ok(());
        }
        sgs.call_cancelled = true;
        log::info!("[ue_id={}] MT call cancelled by the MSC", ue_id);
        Ok(())
    }
}
