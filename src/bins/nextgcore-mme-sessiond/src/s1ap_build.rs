//! MME S1AP Messages
//!
//! S1AP messages the MME sends to the eNB. The lifecycle manager fills these
//! in; ASN.1 encoding belongs to the S1AP path.

use bytes::Bytes;

use crate::context::{
    Bitrate, Ebi, EnbUeS1apId, Fteid, Imsi64, MmeUeS1apId, Qos, SctpAssocId, STmsi, EpsTai,
    UeSecurityCapabilities,
};

/// S1AP Procedure Codes
pub mod procedure_code {
    pub const INITIAL_CONTEXT_SETUP: u8 = 9;
    pub const PAGING: u8 = 10;
    pub const UE_CONTEXT_RELEASE: u8 = 23;
    pub const PATH_SWITCH_REQUEST: u8 = 3;
    pub const E_RAB_SETUP: u8 = 5;
    pub const E_RAB_RELEASE: u8 = 7;
    pub const UE_CONTEXT_MODIFICATION: u8 = 21;
    pub const CONNECTION_ESTABLISHMENT_INDICATION: u8 = 54;
}

// ============================================================================
// Causes and Indicators
// ============================================================================

/// Cause carried by a UE context release command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum S1apReleaseCause {
    InvalidEnbId,
    #[default]
    NasDetach,
    NasNormalRelease,
    ImplicitContextRelease,
    SctpShutdownOrReset,
    InitialContextSetupFailed,
    InitialContextSetupTimerExpired,
    RadioEutranGeneratedReason,
    CsfbTriggered,
    UserInactivity,
}

impl S1apReleaseCause {
    pub fn name(&self) -> &'static str {
        match self {
            S1apReleaseCause::InvalidEnbId => "INVALID_ENB_ID",
            S1apReleaseCause::NasDetach => "NAS_DETACH",
            S1apReleaseCause::NasNormalRelease => "NAS_NORMAL_RELEASE",
            S1apReleaseCause::ImplicitContextRelease => "IMPLICIT_CONTEXT_RELEASE",
            S1apReleaseCause::SctpShutdownOrReset => "SCTP_SHUTDOWN_OR_RESET",
            S1apReleaseCause::InitialContextSetupFailed => "INITIAL_CONTEXT_SETUP_FAILED",
            S1apReleaseCause::InitialContextSetupTimerExpired => "INITIAL_CONTEXT_SETUP_TMR_EXPRD",
            S1apReleaseCause::RadioEutranGeneratedReason => "RADIO_EUTRAN_GENERATED_REASON",
            S1apReleaseCause::CsfbTriggered => "CSFB_TRIGGERED",
            S1apReleaseCause::UserInactivity => "USER_INACTIVITY",
        }
    }

    /// Releases after which the radio side is known to be gone
    pub fn moves_to_idle(&self) -> bool {
        matches!(
            self,
            S1apReleaseCause::SctpShutdownOrReset
                | S1apReleaseCause::InitialContextSetupTimerExpired
        )
    }
}

/// CS fallback indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CsfbIndicator {
    Required = 0,
    HighPriority = 1,
}

/// Paging domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PagingDomain {
    #[default]
    Ps = 0,
    Cs = 1,
}

/// Identity used to page the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingIdentity {
    STmsi(STmsi),
    Imsi(Imsi64),
}

// ============================================================================
// Messages
// ============================================================================

/// E-RAB to be set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ERabToBeSetup {
    pub ebi: Ebi,
    pub qos: Qos,
    pub sgw_s1u: Fteid,
    pub nas_pdu: Option<Bytes>,
}

/// Initial Context Setup Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialContextSetupRequest {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub sctp_assoc_id: SctpAssocId,
    pub ue_ambr: Bitrate,
    pub e_rabs: Vec<ERabToBeSetup>,
    pub security_capabilities: UeSecurityCapabilities,
    pub kenb: [u8; 32],
    pub csfb_indicator: Option<CsfbIndicator>,
    pub ue_radio_capability: Option<Bytes>,
}

/// S1AP messages sent by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apMessage {
    InitialContextSetupRequest(InitialContextSetupRequest),
    ERabSetupRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        e_rab: ERabToBeSetup,
    },
    ERabReleaseCommand {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        ebi: Ebi,
        nas_pdu: Option<Bytes>,
    },
    UeContextReleaseCommand {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        sctp_assoc_id: SctpAssocId,
        cause: S1apReleaseCause,
    },
    UeContextModificationRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        csfb_indicator: Option<CsfbIndicator>,
        ue_ambr: Option<Bitrate>,
    },
    Paging {
        mme_ue_s1ap_id: MmeUeS1apId,
        tai: EpsTai,
        identity: PagingIdentity,
        domain: PagingDomain,
    },
    PathSwitchRequestAcknowledge {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        sctp_assoc_id: SctpAssocId,
        nh: [u8; 32],
        ncc: u8,
        e_rabs_to_release: Vec<Ebi>,
    },
    PathSwitchRequestFailure {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        sctp_assoc_id: SctpAssocId,
    },
    /// Tells the S1AP layer which MME UE S1AP ID now serves an eNB UE
    MmeUeS1apIdAssociation {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        sctp_assoc_id: SctpAssocId,
    },
}

impl S1apMessage {
    pub fn name(&self) -> &'static str {
        match self {
            S1apMessage::InitialContextSetupRequest(_) => "InitialContextSetupRequest",
            S1apMessage::ERabSetupRequest { .. } => "E-RABSetupRequest",
            S1apMessage::ERabReleaseCommand { .. } => "E-RABReleaseCommand",
            S1apMessage::UeContextReleaseCommand { .. } => "UEContextReleaseCommand",
            S1apMessage::UeContextModificationRequest { .. } => "UEContextModificationRequest",
            S1apMessage::Paging { .. } => "Paging",
            S1apMessage::PathSwitchRequestAcknowledge { .. } => "PathSwitchRequestAcknowledge",
            S1apMessage::PathSwitchRequestFailure { .. } => "PathSwitchRequestFailure",
            S1apMessage::MmeUeS1apIdAssociation { .. } => "MmeUeS1apIdAssociation",
        }
    }

    pub fn procedure_code(&self) -> Option<u8> {
        match self {
            S1apMessage::InitialContextSetupRequest(_) => {
                Some(procedure_code::INITIAL_CONTEXT_SETUP)
            }
            S1apMessage::ERabSetupRequest { .. } => Some(procedure_code::E_RAB_SETUP),
            S1apMessage::ERabReleaseCommand { .. } => Some(procedure_code::E_RAB_RELEASE),
            S1apMessage::UeContextReleaseCommand { .. } => Some(procedure_code::UE_CONTEXT_RELEASE),
            S1apMessage::UeContextModificationRequest { .. } => {
                Some(procedure_code::UE_CONTEXT_MODIFICATION)
            }
            S1apMessage::Paging { .. } => Some(procedure_code::PAGING),
            S1apMessage::PathSwitchRequestAcknowledge { .. }
            | S1apMessage::PathSwitchRequestFailure { .. } => {
                Some(procedure_code::PATH_SWITCH_REQUEST)
            }
            S1apMessage::MmeUeS1apIdAssociation { .. } => None,
        }
    }
}
