//! MME Session Events
//!
//! Decoded messages delivered to the lifecycle manager and the EMM-CN
//! coordinator. Wire decoding happens in the peer paths; every event here is
//! already resolved to plain values.

use std::fmt;

use bytes::Bytes;

use crate::context::{
    AdditionalUpdateResult, ApnConfigProfile, AttachType, AuthVector, Bitrate, ECgi, EnbUeKey,
    EpsGuti, EpsTai, EpsUpdateType, Fteid, Imsi64, Lai, MobileIdentity, MmeUeS1apId,
    NetworkAccessMode, Paa, PdnCid, Pti, Qos, STmsi, Teid, UeSecurityCapabilities,
};
use crate::emm_build::{DetachType, EmmCause};
use crate::esm_build::PdnType;
use crate::repository::UeKey;
use crate::s11_build::GtpCause;
use crate::s1ap_build::S1apReleaseCause;
use crate::sgsap_build::ServiceIndicator;
use crate::timer::TimerExpiry;

// ============================================================================
// Common Items
// ============================================================================

/// One bearer as reported by the eNB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ERabSetupItem {
    pub ebi: u8,
    pub enb_s1u: Fteid,
}

/// Service type of a service request (TS 24.301 9.9.3.27)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    MoCsfb,
    MtCsfb,
    MoCsfbEmergency,
    /// Spare values treated as MO CSFB
    MoCsfb1,
    /// Spare values treated as MT CSFB
    MtCsfb1,
    PacketServicesViaS1,
}

/// UE's answer to a mobile terminated CS fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsfbResponse {
    RejectedByUe,
    AcceptedByUe,
}

// ============================================================================
// S11 (from the serving gateway)
// ============================================================================

/// Bearer context created, as carried in a create session response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerContextCreated {
    pub ebi: u8,
    pub cause: GtpCause,
    pub sgw_s1u: Option<Fteid>,
    pub pgw_s5u: Option<Fteid>,
    pub qos: Option<Qos>,
}

/// Parsed Create Session Response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSessionResponseData {
    /// Local S11 TEID the response is addressed to
    pub teid: Teid,
    pub cause: GtpCause,
    /// Gateway S11 F-TEID for the new session
    pub sgw_s11: Option<Fteid>,
    pub paa: Option<Paa>,
    pub apn_ambr: Option<Bitrate>,
    pub pco: Option<Bytes>,
    pub bearers: Vec<BearerContextCreated>,
}

/// Parsed Modify Bearer Response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyBearerResponseData {
    pub teid: Teid,
    pub cause: GtpCause,
    pub bearers_modified: Vec<u8>,
    pub bearers_removed: Vec<u8>,
}

/// Bearer requested by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToCreate {
    /// Zero when the MME chooses the EBI
    pub ebi: u8,
    pub qos: Qos,
    pub sgw_s1u: Fteid,
    pub pgw_s5u: Option<Fteid>,
    pub tft: Option<Bytes>,
    pub pco: Option<Bytes>,
}

/// Parsed Create Bearer Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBearerRequestData {
    pub teid: Teid,
    pub sequence: u32,
    /// Gateway TEID to answer to
    pub sgw_teid: Teid,
    pub linked_ebi: u8,
    pub bearers: Vec<BearerToCreate>,
}

/// Network initiated dedicated bearer activation from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NwActivateBearerData {
    pub teid: Teid,
    pub linked_ebi: u8,
    pub qos: Qos,
    pub sgw_s1u: Fteid,
    pub tft: Option<Bytes>,
    pub pco: Option<Bytes>,
}

/// Parsed Delete Bearer Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBearerRequestData {
    pub teid: Teid,
    pub sequence: u32,
    pub ebis: Vec<u8>,
    /// The first listed EBI is a default bearer
    pub delete_default_bearer: bool,
}

/// Messages from the serving gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S11Event {
    CreateSessionResponse(CreateSessionResponseData),
    DeleteSessionResponse { teid: Teid, cause: GtpCause },
    ModifyBearerResponse(ModifyBearerResponseData),
    ReleaseAccessBearersResponse { teid: Teid, cause: GtpCause },
    CreateBearerRequest(CreateBearerRequestData),
    NwInitiatedActivateBearerRequest(NwActivateBearerData),
    DeleteBearerRequest(DeleteBearerRequestData),
    SuspendAcknowledge { teid: Teid, cause: GtpCause },
    ModifyUeAmbrRequest { teid: Teid, ue_ambr: Bitrate },
    DownlinkDataNotification { teid: Teid },
}

impl S11Event {
    pub fn teid(&self) -> Teid {
        match self {
            S11Event::CreateSessionResponse(rsp) => rsp.teid,
            S11Event::ModifyBearerResponse(rsp) => rsp.teid,
            S11Event::CreateBearerRequest(req) => req.teid,
            S11Event::NwInitiatedActivateBearerRequest(req) => req.teid,
            S11Event::DeleteBearerRequest(req) => req.teid,
            S11Event::DeleteSessionResponse { teid, .. }
            | S11Event::ReleaseAccessBearersResponse { teid, .. }
            | S11Event::SuspendAcknowledge { teid, .. }
            | S11Event::ModifyUeAmbrRequest { teid, .. }
            | S11Event::DownlinkDataNotification { teid } => *teid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            S11Event::CreateSessionResponse(_) => "S11_CREATE_SESSION_RESPONSE",
            S11Event::DeleteSessionResponse { .. } => "S11_DELETE_SESSION_RESPONSE",
            S11Event::ModifyBearerResponse(_) => "S11_MODIFY_BEARER_RESPONSE",
            S11Event::ReleaseAccessBearersResponse { .. } => "S11_RELEASE_ACCESS_BEARERS_RESPONSE",
            S11Event::CreateBearerRequest(_) => "S11_CREATE_BEARER_REQUEST",
            S11Event::NwInitiatedActivateBearerRequest(_) => {
                "S11_NW_INITIATED_ACTIVATE_BEARER_REQUEST"
            }
            S11Event::DeleteBearerRequest(_) => "S11_DELETE_BEARER_REQUEST",
            S11Event::SuspendAcknowledge { .. } => "S11_SUSPEND_ACKNOWLEDGE",
            S11Event::ModifyUeAmbrRequest { .. } => "S11_MODIFY_UE_AMBR_REQUEST",
            S11Event::DownlinkDataNotification { .. } => "S11_DOWNLINK_DATA_NOTIFICATION",
        }
    }
}

// ============================================================================
// S1AP (from the eNB)
// ============================================================================

/// Parsed Initial UE Message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialUeMessageData {
    pub enb_key: EnbUeKey,
    pub s_tmsi: Option<STmsi>,
    pub tai: EpsTai,
    pub ecgi: ECgi,
    pub nas_pdu: Bytes,
}

/// Parsed Path Switch Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSwitchRequestData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    /// Association and UE id at the target eNB
    pub enb_key: EnbUeKey,
    pub e_rabs: Vec<ERabSetupItem>,
    pub security_capabilities: UeSecurityCapabilities,
    pub tai: EpsTai,
    pub ecgi: ECgi,
}

/// Messages from the eNB
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apEvent {
    InitialUeMessage(InitialUeMessageData),
    InitialContextSetupResponse {
        mme_ue_s1ap_id: MmeUeS1apId,
        e_rabs: Vec<ERabSetupItem>,
        e_rabs_failed: Vec<u8>,
    },
    InitialContextSetupFailure { mme_ue_s1ap_id: MmeUeS1apId },
    ERabSetupResponse {
        mme_ue_s1ap_id: MmeUeS1apId,
        succeeded: Vec<ERabSetupItem>,
        failed: Vec<u8>,
    },
    ERabReleaseResponse {
        mme_ue_s1ap_id: MmeUeS1apId,
        released: Vec<u8>,
    },
    PathSwitchRequest(PathSwitchRequestData),
    UeContextReleaseRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apReleaseCause,
    },
    /// The eNB released the radio connection
    UeContextReleaseComplete { mme_ue_s1ap_id: MmeUeS1apId },
    UeContextModificationResponse { mme_ue_s1ap_id: MmeUeS1apId },
    UeContextModificationFailure { mme_ue_s1ap_id: MmeUeS1apId },
}

impl S1apEvent {
    pub fn name(&self) -> &'static str {
        match self {
            S1apEvent::InitialUeMessage(_) => "S1AP_INITIAL_UE_MESSAGE",
            S1apEvent::InitialContextSetupResponse { .. } => "S1AP_INITIAL_CONTEXT_SETUP_RSP",
            S1apEvent::InitialContextSetupFailure { .. } => "S1AP_INITIAL_CONTEXT_SETUP_FAILURE",
            S1apEvent::ERabSetupResponse { .. } => "S1AP_E_RAB_SETUP_RSP",
            S1apEvent::ERabReleaseResponse { .. } => "S1AP_E_RAB_RELEASE_RSP",
            S1apEvent::PathSwitchRequest(_) => "S1AP_PATH_SWITCH_REQUEST",
            S1apEvent::UeContextReleaseRequest { .. } => "S1AP_UE_CONTEXT_RELEASE_REQ",
            S1apEvent::UeContextReleaseComplete { .. } => "S1AP_UE_CONTEXT_RELEASE_COMPLETE",
            S1apEvent::UeContextModificationResponse { .. } => "S1AP_UE_CONTEXT_MODIFICATION_RSP",
            S1apEvent::UeContextModificationFailure { .. } => "S1AP_UE_CONTEXT_MODIFICATION_FAIL",
        }
    }

    fn route_key(&self) -> UeKey {
        match self {
            S1apEvent::InitialUeMessage(msg) => UeKey::Enb(msg.enb_key),
            S1apEvent::PathSwitchRequest(req) => UeKey::MmeUeS1apId(req.mme_ue_s1ap_id),
            S1apEvent::InitialContextSetupResponse { mme_ue_s1ap_id, .. }
            | S1apEvent::InitialContextSetupFailure { mme_ue_s1ap_id }
            | S1apEvent::ERabSetupResponse { mme_ue_s1ap_id, .. }
            | S1apEvent::ERabReleaseResponse { mme_ue_s1ap_id, .. }
            | S1apEvent::UeContextReleaseRequest { mme_ue_s1ap_id, .. }
            | S1apEvent::UeContextReleaseComplete { mme_ue_s1ap_id }
            | S1apEvent::UeContextModificationResponse { mme_ue_s1ap_id }
            | S1apEvent::UeContextModificationFailure { mme_ue_s1ap_id } => {
                UeKey::MmeUeS1apId(*mme_ue_s1ap_id)
            }
        }
    }
}

// ============================================================================
// NAS (from the EMM/ESM procedures to the lifecycle manager)
// ============================================================================

/// Connection establishment confirm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnEstCnfData {
    pub ue_id: MmeUeS1apId,
    /// NAS message for the first E-RAB
    pub nas_pdu: Option<Bytes>,
    pub security_capabilities: UeSecurityCapabilities,
    pub kasme: [u8; 32],
    pub kenb: [u8; 32],
    pub service_type: Option<ServiceType>,
    pub csfb_response: Option<CsfbResponse>,
}

/// Attach request as decoded by the EMM procedures, with its piggybacked
/// PDN connectivity request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachRequestData {
    pub ue_id: MmeUeS1apId,
    pub attach_type: AttachType,
    /// IMSI presented by the UE, or recovered from its old GUTI
    pub imsi: Option<Imsi64>,
    pub old_guti: Option<EpsGuti>,
    pub pti: Pti,
    pub apn: Option<String>,
    pub pdn_type: PdnType,
    pub pco: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasEvent {
    AttachRequest(AttachRequestData),
    /// The UE accepted the security mode command of a registration
    SecurityModeComplete { ue_id: MmeUeS1apId },
    TrackingAreaUpdateRequest {
        ue_id: MmeUeS1apId,
        update_type: EpsUpdateType,
    },
    /// Attach complete or TAU complete
    RegistrationComplete { ue_id: MmeUeS1apId },
    /// The EMM procedures finished a detach
    Deregistered { ue_id: MmeUeS1apId },
    ConnectionEstablishmentConfirm(ConnEstCnfData),
    /// Start gateway session creation for a freshly allocated PDN
    PdnConnectivityReq { ue_id: MmeUeS1apId, pdn_cid: PdnCid },
    ErabSetupReq {
        ue_id: MmeUeS1apId,
        ebi: u8,
        mbr: Bitrate,
        gbr: Bitrate,
        nas_pdu: Option<Bytes>,
    },
    ErabReleaseCmd {
        ue_id: MmeUeS1apId,
        ebi: u8,
        nas_pdu: Option<Bytes>,
    },
    ActivateDedicatedBearerRsp { ue_id: MmeUeS1apId, ebi: u8 },
    ActivateDedicatedBearerRej { ue_id: MmeUeS1apId, ebi: u8 },
    DeactivateDedicatedBearerRsp {
        ue_id: MmeUeS1apId,
        ebis: Vec<u8>,
        delete_default_bearer: bool,
    },
    DeactivateDedicatedBearerRej {
        ue_id: MmeUeS1apId,
        ebis: Vec<u8>,
        delete_default_bearer: bool,
    },
    ExtendedServiceRequest {
        ue_id: MmeUeS1apId,
        service_type: ServiceType,
        csfb_response: Option<CsfbResponse>,
    },
}

impl NasEvent {
    pub fn ue_id(&self) -> MmeUeS1apId {
        match self {
            NasEvent::AttachRequest(req) => req.ue_id,
            NasEvent::ConnectionEstablishmentConfirm(cnf) => cnf.ue_id,
            NasEvent::SecurityModeComplete { ue_id }
            | NasEvent::TrackingAreaUpdateRequest { ue_id, .. }
            | NasEvent::RegistrationComplete { ue_id }
            | NasEvent::Deregistered { ue_id }
            | NasEvent::PdnConnectivityReq { ue_id, .. }
            | NasEvent::ErabSetupReq { ue_id, .. }
            | NasEvent::ErabReleaseCmd { ue_id, .. }
            | NasEvent::ActivateDedicatedBearerRsp { ue_id, .. }
            | NasEvent::ActivateDedicatedBearerRej { ue_id, .. }
            | NasEvent::DeactivateDedicatedBearerRsp { ue_id, .. }
            | NasEvent::DeactivateDedicatedBearerRej { ue_id, .. }
            | NasEvent::ExtendedServiceRequest { ue_id, .. } => *ue_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NasEvent::AttachRequest(_) => "NAS_ATTACH_REQUEST",
            NasEvent::SecurityModeComplete { .. } => "NAS_SECURITY_MODE_COMPLETE",
            NasEvent::TrackingAreaUpdateRequest { .. } => "NAS_TAU_REQUEST",
            NasEvent::RegistrationComplete { .. } => "NAS_REGISTRATION_COMPLETE",
            NasEvent::Deregistered { .. } => "NAS_DEREGISTERED",
            NasEvent::ConnectionEstablishmentConfirm(_) => "NAS_CONNECTION_ESTABLISHMENT_CNF",
            NasEvent::PdnConnectivityReq { .. } => "NAS_PDN_CONNECTIVITY_REQ",
            NasEvent::ErabSetupReq { .. } => "NAS_ERAB_SETUP_REQ",
            NasEvent::ErabReleaseCmd { .. } => "NAS_ERAB_REL_CMD",
            NasEvent::ActivateDedicatedBearerRsp { .. } => "NAS_ACTIVATE_DEDICATED_BEARER_RSP",
            NasEvent::ActivateDedicatedBearerRej { .. } => "NAS_ACTIVATE_DEDICATED_BEARER_REJ",
            NasEvent::DeactivateDedicatedBearerRsp { .. } => "NAS_DEACTIVATE_DEDICATED_BEARER_RSP",
            NasEvent::DeactivateDedicatedBearerRej { .. } => "NAS_DEACTIVATE_DEDICATED_BEARER_REJ",
            NasEvent::ExtendedServiceRequest { .. } => "NAS_EXTENDED_SERVICE_REQ",
        }
    }
}

// ============================================================================
// EMM-CN primitives (to the coordinator)
// ============================================================================

/// Result of a successful session creation, as handed to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnConnectivityResData {
    pub ue_id: MmeUeS1apId,
    pub pdn_cid: PdnCid,
    pub pti: Pti,
    pub ebi: u8,
    pub qos: Qos,
    pub paa: Option<Paa>,
    pub apn_ambr: Bitrate,
    pub pco: Option<Bytes>,
}

/// Circuit-domain location update accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsDomainLocationUpdateAccData {
    pub ue_id: MmeUeS1apId,
    pub lai: Lai,
    pub mobile_identity: Option<MobileIdentity>,
    pub additional_update_result: Option<AdditionalUpdateResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmCnPrimitive {
    AuthRes {
        ue_id: MmeUeS1apId,
        vectors: Vec<AuthVector>,
    },
    AuthFail {
        ue_id: MmeUeS1apId,
        cause: EmmCause,
    },
    SmcFail {
        ue_id: MmeUeS1apId,
        emm_cause: EmmCause,
    },
    Deregister { ue_id: MmeUeS1apId },
    PdnConfigRes {
        ue_id: MmeUeS1apId,
        apn_profile: ApnConfigProfile,
        network_access_mode: NetworkAccessMode,
    },
    PdnConnectivityRes(PdnConnectivityResData),
    PdnConnectivityFail {
        ue_id: MmeUeS1apId,
        pti: Pti,
        cause: GtpCause,
    },
    ImplicitDetachUe { ue_id: MmeUeS1apId },
    NwInitiatedDetachUe {
        ue_id: MmeUeS1apId,
        detach_type: DetachType,
    },
    ActivateDedicatedBearerReq {
        ue_id: MmeUeS1apId,
        pdn_cid: PdnCid,
        ebi: u8,
        linked_ebi: u8,
        qos: Qos,
        sgw_s1u: Fteid,
        tft: Option<Bytes>,
        pco: Option<Bytes>,
    },
    DeactivateDedicatedBearerReq {
        ue_id: MmeUeS1apId,
        ebis: Vec<u8>,
        /// The first listed EBI is the default bearer of its PDN
        delete_default_bearer: bool,
    },
    CsDomainLocationUpdateAcc(CsDomainLocationUpdateAccData),
    CsDomainLocationUpdateFail {
        ue_id: MmeUeS1apId,
        lai: Option<Lai>,
        cause: EmmCause,
    },
    CsDomainMmInformationReq { imsi: Imsi64, information: Bytes },
}

impl EmmCnPrimitive {
    pub fn name(&self) -> &'static str {
        match self {
            EmmCnPrimitive::AuthRes { .. } => "EMMCN_AUTHENTICATION_PARAM_RES",
            EmmCnPrimitive::AuthFail { .. } => "EMMCN_AUTHENTICATION_PARAM_FAIL",
            EmmCnPrimitive::SmcFail { .. } => "EMMCN_SMC_PROC_FAIL",
            EmmCnPrimitive::Deregister { .. } => "EMMCN_DEREGISTER_UE",
            EmmCnPrimitive::PdnConfigRes { .. } => "EMMCN_PDN_CONFIG_RES",
            EmmCnPrimitive::PdnConnectivityRes(_) => "EMMCN_PDN_CONNECTIVITY_RES",
            EmmCnPrimitive::PdnConnectivityFail { .. } => "EMMCN_PDN_CONNECTIVITY_FAIL",
            EmmCnPrimitive::ImplicitDetachUe { .. } => "EMMCN_IMPLICIT_DETACH_UE",
            EmmCnPrimitive::NwInitiatedDetachUe { .. } => "EMMCN_NW_INITIATED_DETACH_UE",
            EmmCnPrimitive::ActivateDedicatedBearerReq { .. } => {
                "EMMCN_ACTIVATE_DEDICATED_BEARER_REQ"
            }
            EmmCnPrimitive::DeactivateDedicatedBearerReq { .. } => {
                "EMMCN_DEACTIVATE_DEDICATED_BEARER_REQ"
            }
            EmmCnPrimitive::CsDomainLocationUpdateAcc(_) => "EMMCN_CS_DOMAIN_LOCATION_UPDT_ACC",
            EmmCnPrimitive::CsDomainLocationUpdateFail { .. } => {
                "EMMCN_CS_DOMAIN_LOCATION_UPDT_FAIL"
            }
            EmmCnPrimitive::CsDomainMmInformationReq { .. } => "EMMCN_CS_DOMAIN_MM_INFORMATION_REQ",
        }
    }

    fn route_key(&self) -> UeKey {
        let ue_id = match self {
            EmmCnPrimitive::CsDomainMmInformationReq { imsi, .. } => return UeKey::Imsi(*imsi),
            EmmCnPrimitive::PdnConnectivityRes(res) => res.ue_id,
            EmmCnPrimitive::CsDomainLocationUpdateAcc(acc) => acc.ue_id,
            EmmCnPrimitive::AuthRes { ue_id, .. }
            | EmmCnPrimitive::AuthFail { ue_id, .. }
            | EmmCnPrimitive::SmcFail { ue_id, .. }
            | EmmCnPrimitive::Deregister { ue_id }
            | EmmCnPrimitive::PdnConfigRes { ue_id, .. }
            | EmmCnPrimitive::PdnConnectivityFail { ue_id, .. }
            | EmmCnPrimitive::ImplicitDetachUe { ue_id }
            | EmmCnPrimitive::NwInitiatedDetachUe { ue_id, .. }
            | EmmCnPrimitive::ActivateDedicatedBearerReq { ue_id, .. }
            | EmmCnPrimitive::DeactivateDedicatedBearerReq { ue_id, .. }
            | EmmCnPrimitive::CsDomainLocationUpdateFail { ue_id, .. } => *ue_id,
        };
        UeKey::MmeUeS1apId(ue_id)
    }
}

// ============================================================================
// SGs and S6a
// ============================================================================

/// Messages from the MSC/VLR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgsEvent {
    PagingRequest {
        imsi: Imsi64,
        service_indicator: ServiceIndicator,
        lai: Option<Lai>,
    },
    /// MSC gave up on a mobile terminated call
    ServiceAbortRequest { imsi: Imsi64 },
}

impl SgsEvent {
    pub fn imsi(&self) -> Imsi64 {
        match self {
            SgsEvent::PagingRequest { imsi, .. } | SgsEvent::ServiceAbortRequest { imsi } => *imsi,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SgsEvent::PagingRequest { .. } => "SGSAP_PAGING_REQUEST",
            SgsEvent::ServiceAbortRequest { .. } => "SGSAP_SERVICE_ABORT_REQUEST",
        }
    }
}

/// Update Location Answer contents used by the session core
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateLocationAnswerData {
    pub imsi: Imsi64,
    /// Diameter result was success
    pub success: bool,
    pub msisdn: Option<String>,
    pub ue_ambr: Bitrate,
    pub apn_profile: ApnConfigProfile,
    pub network_access_mode: NetworkAccessMode,
}

/// Messages from the HSS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S6aEvent {
    UpdateLocationAnswer(UpdateLocationAnswerData),
}

// ============================================================================
// MME Event
// ============================================================================

/// Everything the session core consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmeEvent {
    S11(S11Event),
    S1ap(S1apEvent),
    Nas(NasEvent),
    EmmCn(EmmCnPrimitive),
    Sgs(SgsEvent),
    S6a(S6aEvent),
    Timer(TimerExpiry),
}

impl MmeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MmeEvent::S11(e) => e.name(),
            MmeEvent::S1ap(e) => e.name(),
            MmeEvent::Nas(e) => e.name(),
            MmeEvent::EmmCn(e) => e.name(),
            MmeEvent::Sgs(e) => e.name(),
            MmeEvent::S6a(S6aEvent::UpdateLocationAnswer(_)) => "S6A_UPDATE_LOCATION_ANSWER",
            MmeEvent::Timer(_) => "MME_TIMER_EXPIRY",
        }
    }

    /// Key identifying the subscriber this event belongs to
    pub fn route_key(&self) -> UeKey {
        match self {
            MmeEvent::S11(e) => UeKey::S11Teid(e.teid()),
            MmeEvent::S1ap(e) => e.route_key(),
            MmeEvent::Nas(e) => UeKey::MmeUeS1apId(e.ue_id()),
            MmeEvent::EmmCn(e) => e.route_key(),
            MmeEvent::Sgs(e) => UeKey::Imsi(e.imsi()),
            MmeEvent::S6a(S6aEvent::UpdateLocationAnswer(ula)) => UeKey::Imsi(ula.imsi),
            MmeEvent::Timer(expiry) => UeKey::MmeUeS1apId(expiry.ue_id),
        }
    }
}

impl fmt::Display for MmeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{MmeTimerId, TimerHandle};

    #[test]
    fn test_route_keys() {
        let event = MmeEvent::S11(S11Event::DownlinkDataNotification { teid: 0x55 });
        assert_eq!(event.route_key(), UeKey::S11Teid(0x55));
        assert_eq!(event.to_string(), "S11_DOWNLINK_DATA_NOTIFICATION");

        let event = MmeEvent::EmmCn(EmmCnPrimitive::CsDomainMmInformationReq {
            imsi: 1010000000001,
            information: Bytes::new(),
        });
        assert_eq!(event.route_key(), UeKey::Imsi(1010000000001));

        let event = MmeEvent::Timer(TimerExpiry {
            ue_id: 3,
            timer_id: MmeTimerId::Paging,
            handle: TimerHandle(1),
        });
        assert_eq!(event.route_key(), UeKey::MmeUeS1apId(3));
    }

    #[test]
    fn test_initial_ue_message_routes_by_enb_key() {
        let enb_key = EnbUeKey {
            sctp_assoc_id: 1,
            enb_ue_s1ap_id: 77,
        };
        let event = MmeEvent::S1ap(S1apEvent::InitialUeMessage(InitialUeMessageData {
            enb_key,
            s_tmsi: None,
            tai: EpsTai::default(),
            ecgi: ECgi::default(),
            nas_pdu: Bytes::from_static(&[0x07, 0x41]),
        }));
        assert_eq!(event.route_key(), UeKey::Enb(enb_key));
        assert_eq!(event.name(), "S1AP_INITIAL_UE_MESSAGE");
    }
}
