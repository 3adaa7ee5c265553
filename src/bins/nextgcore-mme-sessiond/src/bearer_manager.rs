//! Session/Bearer Lifecycle Manager
//!
//! Owns PDN and bearer state transitions. The handler modules add the
//! per-peer operations as further `impl BearerManager` blocks; this module
//! holds the collaborators and the helpers they share (lookup, timers,
//! paging, releases and service rejects).

use std::sync::Arc;

use crate::config::MmeConfig;
use crate::context::{EpsGuti, Gummei, MmeUeS1apId, STmsi, UeContext};
use crate::dispatch::{Dispatch, OutboundMessage, S6aMessage};
use crate::emm_build::{EmmCause, EmmProcRequest, FailedProcedure};
use crate::error::{MmeError, MmeResult};
use crate::event::EmmCnPrimitive;
use crate::repository::{UeHandle, UeKey, UeKeys, UeRepository};
use crate::s11_build::S11Message;
use crate::s1ap_build::{PagingDomain, PagingIdentity, S1apMessage, S1apReleaseCause};
use crate::sgsap_build::SgsMessage;
use crate::timer::{MmeTimerConfigs, MmeTimerId, TimerExpiry, TimerService, TimerSlot};

/// M-TMSI values handed out by this MME carry the top two bits set
const M_TMSI_BASE: u32 = 0xc000_0000;

/// Which identity a paging uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingTarget {
    /// S-TMSI of the current GUTI
    STmsi,
    /// Permanent identity
    Imsi,
}

/// Lifecycle manager of PDN and bearer contexts
pub struct BearerManager {
    repo: Arc<dyn UeRepository>,
    dispatch: Arc<dyn Dispatch>,
    timers: Arc<dyn TimerService>,
    config: MmeConfig,
    gummei: Gummei,
    timer_configs: MmeTimerConfigs,
}

impl BearerManager {
    pub fn new(
        repo: Arc<dyn UeRepository>,
        dispatch: Arc<dyn Dispatch>,
        timers: Arc<dyn TimerService>,
        config: MmeConfig,
    ) -> Self {
        let gummei = config.gummei();
        let timer_configs = config.timers();
        Self {
            repo,
            dispatch,
            timers,
            config,
            gummei,
            timer_configs,
        }
    }

    pub fn repository(&self) -> &Arc<dyn UeRepository> {
        &self.repo
    }

    pub fn config(&self) -> &MmeConfig {
        &self.config
    }

    pub(crate) fn gummei(&self) -> &Gummei {
        &self.gummei
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// GUTI behind an S-TMSI, when the S-TMSI was allocated by this MME
    pub(crate) fn guti_of(&self, s_tmsi: &STmsi) -> Option<EpsGuti> {
        if s_tmsi.mme_code != self.gummei.mme_code {
            log::debug!("S-TMSI with foreign MME code {} ignored", s_tmsi.mme_code);
            return None;
        }
        Some(EpsGuti::from_s_tmsi(&self.gummei, s_tmsi))
    }

    /// Resolve a subscriber; a miss is logged here so handlers just `?`
    pub(crate) fn find_ue(&self, key: &UeKey) -> MmeResult<UeHandle> {
        self.repo.get(key).map_err(|e| {
            log::warn!("{}", e);
            e
        })
    }

    /// Re-index the subscriber after any of its keys changed
    pub(crate) fn update_keys(&self, ue: &UeContext) -> MmeResult<()> {
        self.repo.update_keys(ue.mme_ue_s1ap_id, UeKeys::of(ue))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub(crate) fn send(&self, msg: OutboundMessage) -> MmeResult<()> {
        log::debug!("Sending {}", msg.name());
        self.dispatch.send(msg)
    }

    pub(crate) fn send_s11(&self, msg: S11Message) -> MmeResult<()> {
        self.send(OutboundMessage::S11(msg))
    }

    pub(crate) fn send_s1ap(&self, msg: S1apMessage) -> MmeResult<()> {
        self.send(OutboundMessage::S1ap(msg))
    }

    pub(crate) fn send_sgs(&self, msg: SgsMessage) -> MmeResult<()> {
        self.send(OutboundMessage::Sgs(msg))
    }

    pub(crate) fn send_s6a(&self, msg: S6aMessage) -> MmeResult<()> {
        self.send(OutboundMessage::S6a(msg))
    }

    pub(crate) fn send_emm(&self, req: EmmProcRequest) -> MmeResult<()> {
        self.send(OutboundMessage::Emm(req))
    }

    pub(crate) fn send_emm_cn(&self, primitive: EmmCnPrimitive) -> MmeResult<()> {
        self.send(OutboundMessage::EmmCn(primitive))
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Arm `timer_id`, replacing a previous instance of the same timer
    pub(crate) fn start_timer(&self, ue: &mut UeContext, timer_id: MmeTimerId) {
        let ue_id = ue.mme_ue_s1ap_id;
        if let Some(old) = ue.timers.slot_mut(timer_id).handle() {
            self.timers.cancel(old);
        }
        let handle = self
            .timers
            .arm(ue_id, timer_id, self.timer_configs.get(timer_id));
        *ue.timers.slot_mut(timer_id) = TimerSlot::Active(handle);
    }

    /// Cancel `timer_id` if armed; the slot always ends inactive
    pub(crate) fn stop_timer(&self, ue: &mut UeContext, timer_id: MmeTimerId) {
        let slot = ue.timers.slot_mut(timer_id);
        if let Some(handle) = slot.handle() {
            self.timers.cancel(handle);
            log::debug!(
                "[ue_id={}] {} stopped",
                ue.mme_ue_s1ap_id,
                timer_id.name()
            );
        }
        *ue.timers.slot_mut(timer_id) = TimerSlot::Inactive;
    }

    pub(crate) fn stop_all_timers(&self, ue: &mut UeContext) {
        for timer_id in [
            MmeTimerId::InitialContextSetupRsp,
            MmeTimerId::Paging,
            MmeTimerId::MobileReachability,
            MmeTimerId::ImplicitDetach,
            MmeTimerId::UlrResponse,
            MmeTimerId::UeContextModification,
        ] {
            self.stop_timer(ue, timer_id);
        }
    }

    /// Consume an expiry. False when the subscriber no longer has that
    /// instance armed; the caller must then do nothing.
    pub(crate) fn take_expiry(ue: &mut UeContext, expiry: &TimerExpiry) -> bool {
        let slot = ue.timers.slot_mut(expiry.timer_id);
        if !slot.matches(expiry.handle) {
            log::warn!(
                "[ue_id={}] stale {} expiry {} ignored",
                expiry.ue_id,
                expiry.timer_id.name(),
                expiry.handle
            );
            return false;
        }
        *slot = TimerSlot::Inactive;
        true
    }

    // ========================================================================
    // Paging
    // ========================================================================

    /// Page an idle subscriber. The response guard is armed by the first
    /// attempt only; a retransmission or a second request leaves it running.
    pub fn paging(
        &self,
        ue: &mut UeContext,
        target: PagingTarget,
        domain: PagingDomain,
        set_timer: bool,
    ) -> MmeResult<()> {
        let ue_id = ue.mme_ue_s1ap_id;
        if ue.is_connected() {
            return Err(MmeError::InvalidState(format!(
                "ue_id={} is connected, paging not allowed",
                ue_id
            )));
        }
        let identity = match target {
            PagingTarget::STmsi => match ue.emm.guti {
                Some(guti) => PagingIdentity::STmsi(STmsi {
                    mme_code: guti.mme_code,
                    m_tmsi: guti.m_tmsi,
                }),
                None => {
                    let imsi = ue.imsi.ok_or_else(|| no_paging_identity(ue_id))?;
                    log::debug!("[ue_id={}] no GUTI, paging with IMSI", ue_id);
                    PagingIdentity::Imsi(imsi)
                }
            },
            PagingTarget::Imsi => {
                PagingIdentity::Imsi(ue.imsi.ok_or_else(|| no_paging_identity(ue_id))?)
            }
        };

        self.send_s1ap(S1apMessage::Paging {
            mme_ue_s1ap_id: ue_id,
            tai: ue.tai,
            identity,
            domain,
        })?;

        if set_timer && !ue.timers.paging.is_active() {
            self.start_timer(ue, MmeTimerId::Paging);
        }
        Ok(())
    }

    // ========================================================================
    // Releases and Rejects
    // ========================================================================

    /// UE context release command toward the serving eNB
    pub(crate) fn ue_context_release(
        &self,
        ue: &UeContext,
        cause: S1apReleaseCause,
    ) -> MmeResult<()> {
        let Some(enb_key) = ue.enb_key else {
            log::debug!(
                "[ue_id={}] no eNB association, skipping release ({})",
                ue.mme_ue_s1ap_id,
                cause.name()
            );
            return Ok(());
        };
        self.send_s1ap(S1apMessage::UeContextReleaseCommand {
            mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
            enb_ue_s1ap_id: enb_key.enb_ue_s1ap_id,
            sctp_assoc_id: enb_key.sctp_assoc_id,
            cause,
        })
    }

    pub(crate) fn notify_service_reject(
        &self,
        ue_id: MmeUeS1apId,
        emm_cause: EmmCause,
        failed_procedure: FailedProcedure,
    ) -> MmeResult<()> {
        log::info!(
            "[ue_id={}] service reject {:?} ({:?})",
            ue_id,
            emm_cause,
            failed_procedure
        );
        self.send_emm(EmmProcRequest::ServiceReject {
            ue_id,
            emm_cause,
            failed_procedure,
        })
    }

    /// GUTI under the serving GUMMEI. The M-TMSI is derived from the MME UE
    /// S1AP ID, so two live contexts never share one.
    pub(crate) fn allocate_guti(&self, ue_id: MmeUeS1apId) -> EpsGuti {
        EpsGuti {
            plmn_id: self.gummei.plmn_id,
            mme_gid: self.gummei.mme_gid,
            mme_code: self.gummei.mme_code,
            m_tmsi: M_TMSI_BASE | (ue_id & !M_TMSI_BASE),
        }
    }

    /// Update location request, guarded by the ULR response timer
    pub(crate) fn update_location(&self, ue: &mut UeContext) -> MmeResult<()> {
        self.send_s6a(S6aMessage::UpdateLocationRequest {
            ue_id: ue.mme_ue_s1ap_id,
            imsi: ue.imsi,
        })?;
        self.start_timer(ue, MmeTimerId::UlrResponse);
        Ok(())
    }
}

fn no_paging_identity(ue_id: MmeUeS1apId) -> MmeError {
    MmeError::InvalidState(format!("ue_id={} has neither GUTI nor IMSI to page", ue_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EcmState, EnbUeKey, EpsGuti};
    use crate::dispatch::DispatchQueue;
    use crate::repository::InMemoryUeRepository;
    use crate::timer::TimerManager;

    fn manager() -> (BearerManager, Arc<DispatchQueue>, Arc<TimerManager>) {
        let dispatch = Arc::new(DispatchQueue::new());
        let timers = Arc::new(TimerManager::new());
        let manager = BearerManager::new(
            Arc::new(InMemoryUeRepository::default()),
            dispatch.clone(),
            timers.clone(),
            MmeConfig::default(),
        );
        (manager, dispatch, timers)
    }

    fn idle_ue() -> UeContext {
        let mut ue = UeContext::new();
        ue.mme_ue_s1ap_id = 7;
        ue.imsi = Some(1010000000001);
        ue.emm.guti = Some(EpsGuti {
            mme_code: 1,
            m_tmsi: 0xc0000007,
            ..Default::default()
        });
        ue
    }

    #[test]
    fn test_paging_arms_once() {
        let (manager, dispatch, timers) = manager();
        let mut ue = idle_ue();

        manager
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)
            .unwrap();
        let first = ue.timers.paging;
        assert!(first.is_active());

        manager
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)
            .unwrap();
        assert_eq!(ue.timers.paging, first);
        assert_eq!(timers.arm_count(MmeTimerId::Paging), 1);
        assert_eq!(dispatch.s1ap().len(), 2);
    }

    #[test]
    fn test_paging_connected_sends_nothing() {
        let (manager, dispatch, _) = manager();
        let mut ue = idle_ue();
        ue.ecm_state = EcmState::Connected;
        assert!(manager
            .paging(&mut ue, PagingTarget::Imsi, PagingDomain::Cs, true)
            .is_err());
        assert!(dispatch.is_empty());
        assert!(!ue.timers.paging.is_active());
    }

    #[test]
    fn test_paging_falls_back_to_imsi() {
        let (manager, dispatch, _) = manager();
        let mut ue = idle_ue();
        ue.emm.guti = None;
        manager
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, false)
            .unwrap();
        assert!(matches!(
            dispatch.s1ap()[0],
            S1apMessage::Paging {
                identity: PagingIdentity::Imsi(1010000000001),
                ..
            }
        ));
        assert!(!ue.timers.paging.is_active());
    }

    #[test]
    fn test_stale_expiry_rejected() {
        let (manager, _, timers) = manager();
        let mut ue = idle_ue();
        manager.start_timer(&mut ue, MmeTimerId::ImplicitDetach);
        let handle = ue.timers.implicit_detach.handle().unwrap();
        let expiry = timers.expire(handle).unwrap();

        assert!(BearerManager::take_expiry(&mut ue, &expiry));
        assert!(!ue.timers.implicit_detach.is_active());
        assert!(!BearerManager::take_expiry(&mut ue, &expiry));
    }

    #[test]
    fn test_restart_cancels_previous_instance() {
        let (manager, _, timers) = manager();
        let mut ue = idle_ue();
        manager.start_timer(&mut ue, MmeTimerId::UlrResponse);
        manager.start_timer(&mut ue, MmeTimerId::UlrResponse);
        assert_eq!(timers.arm_count(MmeTimerId::UlrResponse), 2);
        assert_eq!(timers.active_timer_count(), 1);
        manager.stop_all_timers(&mut ue);
        assert_eq!(timers.active_timer_count(), 0);
    }

    #[test]
    fn test_release_without_enb_is_silent() {
        let (manager, dispatch, _) = manager();
        let mut ue = idle_ue();
        manager
            .ue_context_release(&ue, S1apReleaseCause::NasDetach)
            .unwrap();
        assert!(dispatch.is_empty());

        ue.enb_key = Some(EnbUeKey {
            sctp_assoc_id: 3,
            enb_ue_s1ap_id: 30,
        });
        manager
            .ue_context_release(&ue, S1apReleaseCause::UserInactivity)
            .unwrap();
        assert!(matches!(
            dispatch.s1ap()[0],
            S1apMessage::UeContextReleaseCommand {
                enb_ue_s1ap_id: 30,
                cause: S1apReleaseCause::UserInactivity,
                ..
            }
        ));
    }
}
