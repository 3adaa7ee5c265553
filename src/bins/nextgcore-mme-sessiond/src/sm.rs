//! MME Session State Machine
//!
//! Top-level event dispatch. Every inbound event is resolved to a subscriber
//! and queued on the worker that owns it (`ue_id % workers`), so a
//! subscriber never has two handlers in flight. Handler errors are logged and
//! the event is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bearer_manager::BearerManager;
use crate::emm_cn::EmmCnCoordinator;
use crate::error::MmeResult;
use crate::event::{MmeEvent, NasEvent, S11Event, S1apEvent, S6aEvent, SgsEvent};
use crate::repository::UeKey;

/// Default number of subscriber workers
pub const DEFAULT_WORKERS: usize = 4;

/// Depth of each worker queue
const WORKER_QUEUE_DEPTH: usize = 256;

/// How often the router re-checks the running flag while idle
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The two session-core components behind one entry point
pub struct MmeSm {
    manager: BearerManager,
    emm_cn: EmmCnCoordinator,
}

impl MmeSm {
    pub fn new(manager: BearerManager, emm_cn: EmmCnCoordinator) -> Self {
        Self { manager, emm_cn }
    }

    pub fn manager(&self) -> &BearerManager {
        &self.manager
    }

    pub fn emm_cn(&self) -> &EmmCnCoordinator {
        &self.emm_cn
    }

    /// Handle one event; failures end here
    pub fn dispatch(&self, event: MmeEvent) {
        let name = event.name();
        log::debug!("Handling {}", name);
        if let Err(e) = self.handle(event) {
            if e.is_lookup_miss() {
                log::warn!("{} dropped: {}", name, e);
            } else {
                log::error!("{} failed: {}", name, e);
            }
        }
    }

    pub fn handle(&self, event: MmeEvent) -> MmeResult<()> {
        match event {
            MmeEvent::S11(e) => self.handle_s11(e),
            MmeEvent::S1ap(e) => self.handle_s1ap(e),
            MmeEvent::Nas(e) => self.handle_nas(e),
            MmeEvent::EmmCn(primitive) => self.emm_cn.handle_primitive(primitive),
            MmeEvent::Sgs(SgsEvent::PagingRequest {
                imsi,
                service_indicator,
                lai,
            }) => self
                .manager
                .handle_sgs_paging_request(imsi, service_indicator, lai),
            MmeEvent::Sgs(SgsEvent::ServiceAbortRequest { imsi }) => {
                self.manager.handle_sgs_service_abort_request(imsi)
            }
            MmeEvent::S6a(S6aEvent::UpdateLocationAnswer(ula)) => {
                self.manager.handle_update_location_answer(ula)
            }
            MmeEvent::Timer(expiry) => self.manager.handle_timer_expiry(expiry),
        }
    }

    fn handle_s11(&self, event: S11Event) -> MmeResult<()> {
        let m = &self.manager;
        match event {
            S11Event::CreateSessionResponse(rsp) => m.handle_create_session_response(rsp),
            S11Event::DeleteSessionResponse { teid, cause } => {
                m.handle_delete_session_response(teid, cause)
            }
            S11Event::ModifyBearerResponse(rsp) => m.handle_modify_bearer_response(rsp),
            S11Event::ReleaseAccessBearersResponse { teid, cause } => {
                m.handle_release_access_bearers_response(teid, cause)
            }
            S11Event::CreateBearerRequest(req) => m.handle_create_bearer_request(req),
            S11Event::NwInitiatedActivateBearerRequest(req) => {
                m.handle_nw_initiated_activate_bearer_request(req)
            }
            S11Event::DeleteBearerRequest(req) => m.handle_delete_bearer_request(req),
            S11Event::SuspendAcknowledge { teid, cause } => {
                m.handle_suspend_acknowledge(teid, cause)
            }
            S11Event::ModifyUeAmbrRequest { teid, ue_ambr } => {
                m.handle_modify_ue_ambr_request(teid, ue_ambr)
            }
            S11Event::DownlinkDataNotification { teid } => {
                m.handle_downlink_data_notification(teid)
            }
        }
    }

    fn handle_s1ap(&self, event: S1apEvent) -> MmeResult<()> {
        let m = &self.manager;
        match event {
            S1apEvent::InitialUeMessage(msg) => m.handle_initial_ue_message(msg),
            S1apEvent::InitialContextSetupResponse {
                mme_ue_s1ap_id,
                e_rabs,
                e_rabs_failed,
            } => m.handle_initial_context_setup_response(mme_ue_s1ap_id, e_rabs, e_rabs_failed),
            S1apEvent::InitialContextSetupFailure { mme_ue_s1ap_id } => {
                m.handle_initial_context_setup_failure(mme_ue_s1ap_id)
            }
            S1apEvent::ERabSetupResponse {
                mme_ue_s1ap_id,
                succeeded,
                failed,
            } => m.handle_e_rab_setup_response(mme_ue_s1ap_id, succeeded, failed),
            S1apEvent::ERabReleaseResponse {
                mme_ue_s1ap_id,
                released,
            } => m.handle_e_rab_release_response(mme_ue_s1ap_id, released),
            S1apEvent::PathSwitchRequest(req) => m.handle_path_switch_request(req),
            S1apEvent::UeContextReleaseRequest {
                mme_ue_s1ap_id,
                cause,
            } => m.handle_ue_context_release_request(mme_ue_s1ap_id, cause),
            S1apEvent::UeContextReleaseComplete { mme_ue_s1ap_id } => {
                m.handle_ue_context_release_complete(mme_ue_s1ap_id)
            }
            S1apEvent::UeContextModificationResponse { mme_ue_s1ap_id } => {
                m.handle_ue_context_modification_response(mme_ue_s1ap_id)
            }
            S1apEvent::UeContextModificationFailure { mme_ue_s1ap_id } => {
                m.handle_ue_context_modification_failure(mme_ue_s1ap_id)
            }
        }
    }

    fn handle_nas(&self, event: NasEvent) -> MmeResult<()> {
        let m = &self.manager;
        match event {
            NasEvent::AttachRequest(req) => self.emm_cn.handle_attach_request(req),
            NasEvent::SecurityModeComplete { ue_id } => m.handle_security_mode_complete(ue_id),
            NasEvent::TrackingAreaUpdateRequest { ue_id, update_type } => {
                self.emm_cn.handle_tau_request(ue_id, update_type)
            }
            NasEvent::RegistrationComplete { ue_id } => {
                self.emm_cn.handle_registration_complete(ue_id)
            }
            NasEvent::Deregistered { ue_id } => self.emm_cn.handle_deregistered(ue_id),
            NasEvent::ConnectionEstablishmentConfirm(cnf) => {
                m.handle_connection_establishment_confirm(cnf)
            }
            NasEvent::PdnConnectivityReq { ue_id, pdn_cid } => {
                m.initiate_default_session(ue_id, pdn_cid)
            }
            NasEvent::ErabSetupReq {
                ue_id,
                ebi,
                mbr,
                gbr,
                nas_pdu,
            } => m.handle_e_rab_setup_request(ue_id, ebi, mbr, gbr, nas_pdu),
            NasEvent::ErabReleaseCmd {
                ue_id,
                ebi,
                nas_pdu,
            } => m.handle_e_rab_release_command(ue_id, ebi, nas_pdu),
            NasEvent::ActivateDedicatedBearerRsp { ue_id, ebi } => {
                m.handle_activate_dedicated_bearer_result(ue_id, ebi, true)
            }
            NasEvent::ActivateDedicatedBearerRej { ue_id, ebi } => {
                m.handle_activate_dedicated_bearer_result(ue_id, ebi, false)
            }
            NasEvent::DeactivateDedicatedBearerRsp {
                ue_id,
                ebis,
                delete_default_bearer,
            } => {
                m.handle_deactivate_dedicated_bearer_result(
                    ue_id,
                    ebis,
                    delete_default_bearer,
                    true,
                )
            }
            NasEvent::DeactivateDedicatedBearerRej {
                ue_id,
                ebis,
                delete_default_bearer,
            } => {
                m.handle_deactivate_dedicated_bearer_result(
                    ue_id,
                    ebis,
                    delete_default_bearer,
                    false,
                )
            }
            NasEvent::ExtendedServiceRequest {
                ue_id,
                service_type,
                csfb_response,
            } => m.handle_extended_service_request(ue_id, service_type, csfb_response),
        }
    }

    /// Worker owning `event`, read from the repository index without
    /// locking any subscriber. A returning UE's initial UE message is matched
    /// through its S-TMSI. Events for a subscriber not known yet (a first
    /// initial UE message, an unknown tunnel) go to worker 0.
    pub fn worker_for(&self, event: &MmeEvent, workers: usize) -> usize {
        let workers = workers.max(1);
        let repo = self.manager.repository();
        let ue_id = match event {
            MmeEvent::S1ap(S1apEvent::InitialUeMessage(msg)) => msg
                .s_tmsi
                .and_then(|s_tmsi| self.manager.guti_of(&s_tmsi))
                .and_then(|guti| repo.resolve(&UeKey::Guti(guti)))
                .or_else(|| repo.resolve(&UeKey::Enb(msg.enb_key))),
            _ => repo.resolve(&event.route_key()),
        };
        ue_id.map_or(0, |ue_id| ue_id as usize % workers)
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Run the router until `running` clears or the event channel closes, then
/// let the workers drain their queues.
pub async fn run(
    sm: Arc<MmeSm>,
    mut events: mpsc::Receiver<MmeEvent>,
    workers: usize,
    running: Arc<AtomicBool>,
) {
    let workers = workers.max(1);
    let mut queues = Vec::with_capacity(workers);
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
    for index in 0..workers {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        queues.push(tx);
        handles.push(tokio::spawn(worker(index, Arc::clone(&sm), rx)));
    }
    log::info!("session core running with {} workers", workers);

    while running.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(POLL_INTERVAL, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                log::info!("event channel closed");
                break;
            }
            Err(_) => continue,
        };
        let index = sm.worker_for(&event, workers);
        if queues[index].send(event).await.is_err() {
            log::error!("worker {} stopped, event dropped", index);
        }
    }

    drop(queues);
    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("worker task failed: {}", e);
        }
    }
    log::info!("session core stopped");
}

async fn worker(index: usize, sm: Arc<MmeSm>, mut rx: mpsc::Receiver<MmeEvent>) {
    log::debug!("worker {} started", index);
    while let Some(event) = rx.recv().await {
        sm.dispatch(event);
    }
    log::debug!("worker {} stopped", index);
}
