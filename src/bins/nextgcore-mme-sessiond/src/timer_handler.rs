//! Timer Expiry and HSS Answer Handling
//!
//! Every guard timer lands here once its expiry has been matched against the
//! instance armed on the subscriber. The update location answer shares the
//! module because it is what the ULR guard waits for.

use crate::bearer_manager::{BearerManager, PagingTarget};
use crate::context::{CsfbServiceType, Pti, UeContext};
use crate::emm_build::{EmmCause, EmmProcRequest, FailedProcedure};
use crate::error::MmeResult;
use crate::event::{EmmCnPrimitive, UpdateLocationAnswerData};
use crate::repository::{lock_ue, UeKey};
use crate::s11_build::GtpCause;
use crate::s1ap_build::{PagingDomain, S1apReleaseCause};
use crate::timer::{MmeTimerId, TimerExpiry};

impl BearerManager {
    // ========================================================================
    // Timer Expiry
    // ========================================================================

    pub fn handle_timer_expiry(&self, expiry: TimerExpiry) -> MmeResult<()> {
        let Some(handle) = self.repository().find(&UeKey::MmeUeS1apId(expiry.ue_id)) else {
            log::debug!(
                "[ue_id={}] {} expired after the context was removed",
                expiry.ue_id,
                expiry.timer_id.name()
            );
            return Ok(());
        };
        let mut ue = lock_ue(&handle)?;
        if !Self::take_expiry(&mut ue, &expiry) {
            return Ok(());
        }
        log::info!("[ue_id={}] {} expired", expiry.ue_id, expiry.timer_id.name());

        match expiry.timer_id {
            MmeTimerId::InitialContextSetupRsp => self.abort_initial_context_setup(
                &mut ue,
                S1apReleaseCause::InitialContextSetupTimerExpired,
            ),
            MmeTimerId::Paging => self.paging_expired(&mut ue),
            MmeTimerId::MobileReachability => {
                ue.ppf = false;
                self.start_timer(&mut ue, MmeTimerId::ImplicitDetach);
                Ok(())
            }
            MmeTimerId::ImplicitDetach => self.send_emm_cn(EmmCnPrimitive::ImplicitDetachUe {
                ue_id: ue.mme_ue_s1ap_id,
            }),
            MmeTimerId::UlrResponse => {
                let Some(pti) = pending_pti(&ue) else {
                    log::warn!(
                        "[ue_id={}] no pending PDN connectivity for the lost ULA",
                        ue.mme_ue_s1ap_id
                    );
                    return Ok(());
                };
                self.send_emm_cn(EmmCnPrimitive::PdnConnectivityFail {
                    ue_id: ue.mme_ue_s1ap_id,
                    pti,
                    cause: GtpCause::SystemFailure,
                })
            }
            MmeTimerId::UeContextModification => {
                if ue.sgs.is_none() {
                    return Ok(());
                }
                self.csfb_procedure_failure(&mut ue, FailedProcedure::UeContextModification)
            }
        }
    }

    /// One retransmission; the guard is not re-armed so a second silence
    /// leaves the subscriber alone.
    fn paging_expired(&self, ue: &mut UeContext) -> MmeResult<()> {
        if ue.is_connected() {
            return Ok(());
        }
        let domain = match ue.sgs.as_ref().map(|sgs| sgs.csfb_service_type) {
            Some(
                CsfbServiceType::MtCall
                | CsfbServiceType::MtSms
                | CsfbServiceType::MtCallOrSmsWithoutLai,
            ) => {
                PagingDomain::Cs
            }
            _ => PagingDomain::Ps,
        };
        self.paging(ue, PagingTarget::STmsi, domain, false)
    }

    // ========================================================================
    // Update Location Answer
    // ========================================================================

    pub fn handle_update_location_answer(&self, ula: UpdateLocationAnswerData) -> MmeResult<()> {
        let handle = self.find_ue(&UeKey::Imsi(ula.imsi))?;
        let mut ue = lock_ue(&handle)?;
        let ue_id = ue.mme_ue_s1ap_id;
        self.stop_timer(&mut ue, MmeTimerId::UlrResponse);

        if !ula.success {
            log::warn!("[ue_id={}] update location rejected by the HSS", ue_id);
            ue.emm.attach_proc = None;
            ue.emm.esm_proc_data = None;
            return self.send_emm(EmmProcRequest::AttachReject {
                ue_id,
                emm_cause: EmmCause::NetworkFailure,
                esm_msg: None,
            });
        }

        ue.msisdn = ula.msisdn;
        ue.ue_ambr = ula.ue_ambr;
        ue.location_info_confirmed_in_hss = false;
        if ue.emm.is_registered() {
            log::debug!("[ue_id={}] location confirmed in the HSS", ue_id);
            return Ok(());
        }
        self.send_emm_cn(EmmCnPrimitive::PdnConfigRes {
            ue_id,
            apn_profile: ula.apn_profile,
            network_access_mode: ula.network_access_mode,
        })
    }
}

/// Transaction of the PDN connectivity the subscriber is waiting on
pub(crate) fn pending_pti(ue: &UeContext) -> Option<Pti> {
    if let Some(esm) = ue.emm.esm_proc_data.as_ref() {
        return Some(esm.pti);
    }
    let (_, pdn) = ue.pdns.iter().next()?;
    let ebi = pdn.default_ebi()?;
    ue.bearers.get(ebi).map(|bearer| bearer.transaction_id)
}
