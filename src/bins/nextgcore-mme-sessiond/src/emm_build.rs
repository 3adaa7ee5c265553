//! EMM Primitives
//!
//! EMM cause vocabulary, the NAS buffer used by the ESM builders, and the
//! requests the coordinator and lifecycle manager hand to the embedded EMM/ESM
//! procedures (attach, TAU, detach, service reject, ESM standalone).

use bytes::{BufMut, Bytes, BytesMut};

use crate::context::{
    AdditionalUpdateResult, ECgi, EpsTai, Fteid, Lai, MmeUeS1apId, MobileIdentity, Qos, STmsi,
};

// ============================================================================
// EMM Cause Codes (3GPP TS 24.301)
// ============================================================================

/// EMM Cause codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EmmCause {
    /// Request accepted
    #[default]
    RequestAccepted = 0,
    /// IMSI unknown in HSS
    ImsiUnknownInHss = 2,
    /// Illegal UE
    IllegalUe = 3,
    /// EPS services not allowed
    EpsServicesNotAllowed = 7,
    /// UE identity cannot be derived by the network
    UeIdentityCannotBeDerived = 9,
    /// Implicitly detached
    ImplicitlyDetached = 10,
    /// MSC temporarily not reachable
    MscTemporarilyNotReachable = 16,
    /// Network failure
    NetworkFailure = 17,
    /// CS domain not available
    CsDomainNotAvailable = 18,
    /// ESM failure
    EsmFailure = 19,
    /// MAC failure
    MacFailure = 20,
    /// Congestion
    Congestion = 22,
    /// UE security capabilities mismatch
    UeSecurityCapabilitiesMismatch = 23,
    /// Security mode rejected, unspecified
    SecurityModeRejectedUnspecified = 24,
    /// CS service temporarily not available
    CsServiceTemporarilyNotAvailable = 39,
    /// Protocol error, unspecified
    ProtocolErrorUnspecified = 111,
}

impl EmmCause {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EmmCause::ImsiUnknownInHss,
            3 => EmmCause::IllegalUe,
            7 => EmmCause::EpsServicesNotAllowed,
            9 => EmmCause::UeIdentityCannotBeDerived,
            10 => EmmCause::ImplicitlyDetached,
            16 => EmmCause::MscTemporarilyNotReachable,
            17 => EmmCause::NetworkFailure,
            18 => EmmCause::CsDomainNotAvailable,
            19 => EmmCause::EsmFailure,
            20 => EmmCause::MacFailure,
            22 => EmmCause::Congestion,
            23 => EmmCause::UeSecurityCapabilitiesMismatch,
            24 => EmmCause::SecurityModeRejectedUnspecified,
            39 => EmmCause::CsServiceTemporarilyNotAvailable,
            0 => EmmCause::RequestAccepted,
            _ => EmmCause::ProtocolErrorUnspecified,
        }
    }
}

/// NAS Protocol Discriminator for EMM
pub const NAS_PROTOCOL_DISCRIMINATOR_EMM: u8 = 0x07;

// ============================================================================
// NAS Buffer
// ============================================================================

/// Buffer for building NAS messages
#[derive(Debug, Clone, Default)]
pub struct NasBuffer {
    data: BytesMut,
}

impl NasBuffer {
    /// Create new buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(256),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write 16-bit value (big endian)
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    /// Write 32-bit value (big endian)
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Write length-prefixed bytes
    pub fn write_lv(&mut self, bytes: &[u8]) {
        self.data.put_u8(bytes.len() as u8);
        self.data.put_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Detach
// ============================================================================

/// Detach type of a network-initiated detach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DetachType {
    #[default]
    Eps = 1,
    Imsi = 2,
    EpsImsi = 3,
    ReattachRequired = 4,
}

/// Detach request handed to the detach state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachRequest {
    pub detach_type: DetachType,
    pub switch_off: bool,
    /// Native (true) or mapped security context
    pub native_sc: bool,
    pub ksi: u8,
    pub cause: EmmCause,
}

/// Procedure that failed when a service reject is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedProcedure {
    InitialContextSetup,
    UeContextModification,
    MtCallCancelledByNwInIdleState,
    MtCallCancelledByNwInConnectedState,
}

/// Circuit-domain results carried in an attach or TAU accept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsDomainResult {
    pub lai: Option<Lai>,
    pub mobile_identity: Option<MobileIdentity>,
    pub additional_update_result: Option<AdditionalUpdateResult>,
    /// Set when the circuit domain could not register the UE
    pub emm_cause: Option<EmmCause>,
}

// ============================================================================
// Requests to the EMM/ESM procedures
// ============================================================================

/// Requests handed to the embedded EMM/ESM procedures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmProcRequest {
    /// Initial NAS message from a new radio connection
    EstablishIndication {
        ue_id: MmeUeS1apId,
        nas_pdu: Bytes,
        tai: EpsTai,
        ecgi: ECgi,
        s_tmsi: Option<STmsi>,
    },
    AuthenticationRequest {
        ue_id: MmeUeS1apId,
        rand: [u8; 16],
        autn: [u8; 16],
    },
    AttachAccept {
        ue_id: MmeUeS1apId,
        esm_msg: Option<Bytes>,
        cs_domain: Option<CsDomainResult>,
    },
    AttachReject {
        ue_id: MmeUeS1apId,
        emm_cause: EmmCause,
        esm_msg: Option<Bytes>,
    },
    TauAccept {
        ue_id: MmeUeS1apId,
        cs_domain: Option<CsDomainResult>,
    },
    TauReject {
        ue_id: MmeUeS1apId,
        emm_cause: EmmCause,
    },
    Detach {
        ue_id: MmeUeS1apId,
        request: DetachRequest,
    },
    /// Implicit GUTI reallocation after attach accept
    CommonProcedureInitiated { ue_id: MmeUeS1apId },
    ServiceReject {
        ue_id: MmeUeS1apId,
        emm_cause: EmmCause,
        failed_procedure: FailedProcedure,
    },
    /// Standalone ESM activate dedicated EPS bearer context request
    ActivateDedicatedBearer {
        ue_id: MmeUeS1apId,
        ebi: u8,
        linked_ebi: u8,
        qos: Qos,
        sgw_s1u: Fteid,
        tft: Option<Bytes>,
        pco: Option<Bytes>,
    },
    /// Standalone ESM deactivate EPS bearer context request
    DeactivateDedicatedBearer {
        ue_id: MmeUeS1apId,
        ebis: Vec<u8>,
        pcrf_initiated: bool,
        /// PDN disconnect rather than a dedicated bearer release
        delete_default_bearer: bool,
    },
    EmmInformation {
        ue_id: MmeUeS1apId,
        information: Bytes,
    },
}

impl EmmProcRequest {
    pub fn ue_id(&self) -> MmeUeS1apId {
        match self {
            EmmProcRequest::EstablishIndication { ue_id, .. }
            | EmmProcRequest::AuthenticationRequest { ue_id, .. }
            | EmmProcRequest::AttachAccept { ue_id, .. }
            | EmmProcRequest::AttachReject { ue_id, .. }
            | EmmProcRequest::TauAccept { ue_id, .. }
            | EmmProcRequest::TauReject { ue_id, .. }
            | EmmProcRequest::Detach { ue_id, .. }
            | EmmProcRequest::CommonProcedureInitiated { ue_id }
            | EmmProcRequest::ServiceReject { ue_id, .. }
            | EmmProcRequest::ActivateDedicatedBearer { ue_id, .. }
            | EmmProcRequest::DeactivateDedicatedBearer { ue_id, .. }
            | EmmProcRequest::EmmInformation { ue_id, .. } => *ue_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EmmProcRequest::EstablishIndication { .. } => "EMMAS_ESTABLISH_IND",
            EmmProcRequest::AuthenticationRequest { .. } => "EMM_AUTHENTICATION_REQUEST",
            EmmProcRequest::AttachAccept { .. } => "EMM_ATTACH_ACCEPT",
            EmmProcRequest::AttachReject { .. } => "EMM_ATTACH_REJECT",
            EmmProcRequest::TauAccept { .. } => "EMM_TAU_ACCEPT",
            EmmProcRequest::TauReject { .. } => "EMM_TAU_REJECT",
            EmmProcRequest::Detach { .. } => "EMM_DETACH",
            EmmProcRequest::CommonProcedureInitiated { .. } => "EMM_COMMON_PROC_REQ",
            EmmProcRequest::ServiceReject { .. } => "EMM_SERVICE_REJECT",
            EmmProcRequest::ActivateDedicatedBearer { .. } => "ESM_ACTIVATE_DEDICATED_BEARER",
            EmmProcRequest::DeactivateDedicatedBearer { .. } => "ESM_DEACTIVATE_DEDICATED_BEARER",
            EmmProcRequest::EmmInformation { .. } => "EMM_INFORMATION",
        }
    }
}
