//! MME S11 GTP-C Messages
//!
//! GTPv2-C messages the MME sends to the serving gateway, plus the cause
//! vocabulary shared with the inbound side. Encoding is left to the GTP path.

use bytes::Bytes;

use crate::context::{Bitrate, ECgi, Ebi, EpsTai, Fteid, Imsi64, IpAddr, Paa, PlmnId, Qos, Teid};
use crate::esm_build::PdnType;

// ============================================================================
// GTP-C Message Types
// ============================================================================

/// GTP-C message types
pub mod message_type {
    pub const CREATE_SESSION_REQUEST: u8 = 32;
    pub const CREATE_SESSION_RESPONSE: u8 = 33;
    pub const MODIFY_BEARER_REQUEST: u8 = 34;
    pub const MODIFY_BEARER_RESPONSE: u8 = 35;
    pub const DELETE_SESSION_REQUEST: u8 = 36;
    pub const DELETE_SESSION_RESPONSE: u8 = 37;
    pub const CREATE_BEARER_REQUEST: u8 = 95;
    pub const CREATE_BEARER_RESPONSE: u8 = 96;
    pub const DELETE_BEARER_REQUEST: u8 = 99;
    pub const DELETE_BEARER_RESPONSE: u8 = 100;
    pub const SUSPEND_NOTIFICATION: u8 = 162;
    pub const SUSPEND_ACKNOWLEDGE: u8 = 163;
    pub const RELEASE_ACCESS_BEARERS_REQUEST: u8 = 170;
    pub const RELEASE_ACCESS_BEARERS_RESPONSE: u8 = 171;
    pub const DOWNLINK_DATA_NOTIFICATION: u8 = 176;
}

// ============================================================================
// GTP Cause Values
// ============================================================================

/// GTP-C Cause values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GtpCause {
    #[default]
    Reserved = 0,
    RequestAccepted = 16,
    RequestAcceptedPartially = 17,
    NewPdnTypeDueToNetworkPreference = 18,
    NewPdnTypeDueToSingleAddressBearerOnly = 19,
    ContextNotFound = 64,
    InvalidMessageFormat = 65,
    VersionNotSupported = 66,
    InvalidLength = 67,
    ServiceNotSupported = 68,
    MandatoryIeIncorrect = 69,
    MandatoryIeMissing = 70,
    SystemFailure = 72,
    NoResourcesAvailable = 73,
    MissingOrUnknownApn = 78,
    AllDynamicAddressesAreOccupied = 84,
    UeNotResponding = 87,
    RequestRejected = 94,
    ConditionalIeMissing = 103,
}

impl From<u8> for GtpCause {
    fn from(value: u8) -> Self {
        match value {
            16 => GtpCause::RequestAccepted,
            17 => GtpCause::RequestAcceptedPartially,
            18 => GtpCause::NewPdnTypeDueToNetworkPreference,
            19 => GtpCause::NewPdnTypeDueToSingleAddressBearerOnly,
            64 => GtpCause::ContextNotFound,
            65 => GtpCause::InvalidMessageFormat,
            66 => GtpCause::VersionNotSupported,
            67 => GtpCause::InvalidLength,
            68 => GtpCause::ServiceNotSupported,
            69 => GtpCause::MandatoryIeIncorrect,
            70 => GtpCause::MandatoryIeMissing,
            72 => GtpCause::SystemFailure,
            73 => GtpCause::NoResourcesAvailable,
            78 => GtpCause::MissingOrUnknownApn,
            84 => GtpCause::AllDynamicAddressesAreOccupied,
            87 => GtpCause::UeNotResponding,
            94 => GtpCause::RequestRejected,
            103 => GtpCause::ConditionalIeMissing,
            _ => GtpCause::Reserved,
        }
    }
}

impl GtpCause {
    /// Acceptance causes (16..=19)
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            GtpCause::RequestAccepted
                | GtpCause::RequestAcceptedPartially
                | GtpCause::NewPdnTypeDueToNetworkPreference
                | GtpCause::NewPdnTypeDueToSingleAddressBearerOnly
        )
    }
}

/// RAT type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RatType {
    #[default]
    Eutran = 6,
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// Create Session Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    /// Local S11 TEID the gateway answers to
    pub sender_teid: Teid,
    pub imsi: Option<Imsi64>,
    pub msisdn: Option<String>,
    pub apn: String,
    pub pdn_type: PdnType,
    pub paa: Option<Paa>,
    pub default_ebi: Ebi,
    pub bearer_qos: Qos,
    pub apn_ambr: Bitrate,
    pub pco: Option<Bytes>,
    pub rat_type: RatType,
    pub serving_network: PlmnId,
    pub tai: EpsTai,
    pub ecgi: ECgi,
}

/// Bearer context within Modify Bearer Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerToModify {
    pub ebi: Ebi,
    pub enb_s1u: Fteid,
}

/// Modify Bearer Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyBearerRequest {
    /// Gateway S11 TEID of the addressed PDN
    pub teid: Teid,
    pub peer_addr: IpAddr,
    pub bearers_to_modify: Vec<BearerToModify>,
    pub bearers_to_remove: Vec<Ebi>,
    pub rat_type: RatType,
}

/// Bearer context within Create Bearer Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedBearerResult {
    pub ebi: Ebi,
    pub cause: GtpCause,
    pub enb_s1u: Option<Fteid>,
    pub sgw_s1u: Option<Fteid>,
}

/// Create Bearer Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBearerResponse {
    pub teid: Teid,
    pub sequence: u32,
    pub cause: GtpCause,
    pub bearers: Vec<CreatedBearerResult>,
}

/// Delete Bearer Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBearerResponse {
    pub teid: Teid,
    pub sequence: u32,
    pub cause: GtpCause,
    pub linked_ebi: Option<Ebi>,
    pub bearers: Vec<(Ebi, GtpCause)>,
}

/// S11 messages sent by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S11Message {
    CreateSessionRequest(CreateSessionRequest),
    ModifyBearerRequest(ModifyBearerRequest),
    CreateBearerResponse(CreateBearerResponse),
    DeleteBearerResponse(DeleteBearerResponse),
    ReleaseAccessBearersRequest { teid: Teid, peer_addr: IpAddr },
    SuspendNotification { teid: Teid, linked_ebi: Ebi, imsi: Option<Imsi64> },
}

impl S11Message {
    pub fn message_type(&self) -> u8 {
        match self {
            S11Message::CreateSessionRequest(_) => message_type::CREATE_SESSION_REQUEST,
            S11Message::ModifyBearerRequest(_) => message_type::MODIFY_BEARER_REQUEST,
            S11Message::CreateBearerResponse(_) => message_type::CREATE_BEARER_RESPONSE,
            S11Message::DeleteBearerResponse(_) => message_type::DELETE_BEARER_RESPONSE,
            S11Message::ReleaseAccessBearersRequest { .. } => {
                message_type::RELEASE_ACCESS_BEARERS_REQUEST
            }
            S11Message::SuspendNotification { .. } => message_type::SUSPEND_NOTIFICATION,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            S11Message::CreateSessionRequest(_) => "CreateSessionRequest",
            S11Message::ModifyBearerRequest(_) => "ModifyBearerRequest",
            S11Message::CreateBearerResponse(_) => "CreateBearerResponse",
            S11Message::DeleteBearerResponse(_) => "DeleteBearerResponse",
            S11Message::ReleaseAccessBearersRequest { .. } => "ReleaseAccessBearersRequest",
            S11Message::SuspendNotification { .. } => "SuspendNotification",
        }
    }
}

/// Build the per-bearer result list of a Create Bearer Response
pub fn created_bearer_results(
    accepted: &[(Ebi, Option<Fteid>, Option<Fteid>)],
    rejected: &[Ebi],
) -> Vec<CreatedBearerResult> {
    let mut results: Vec<CreatedBearerResult> = accepted
        .iter()
        .map(|(ebi, enb_s1u, sgw_s1u)| CreatedBearerResult {
            ebi: *ebi,
            cause: GtpCause::RequestAccepted,
            enb_s1u: *enb_s1u,
            sgw_s1u: *sgw_s1u,
        })
        .collect();
    results.extend(rejected.iter().map(|ebi| CreatedBearerResult {
        ebi: *ebi,
        cause: GtpCause::RequestRejected,
        enb_s1u: None,
        sgw_s1u: None,
    }));
    results.sort_by_key(|r| r.ebi);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gtp_cause_from_u8() {
        assert_eq!(GtpCause::from(16), GtpCause::RequestAccepted);
        assert_eq!(GtpCause::from(84), GtpCause::AllDynamicAddressesAreOccupied);
        assert_eq!(GtpCause::from(200), GtpCause::Reserved);
        assert_eq!(GtpCause::RequestRejected as u8, 94);
    }

    #[test]
    fn test_gtp_cause_accepted() {
        assert!(GtpCause::RequestAccepted.is_accepted());
        assert!(GtpCause::RequestAcceptedPartially.is_accepted());
        assert!(!GtpCause::ContextNotFound.is_accepted());
    }

    #[test]
    fn test_message_type() {
        let msg = S11Message::ReleaseAccessBearersRequest {
            teid: 1,
            peer_addr: IpAddr::default(),
        };
        assert_eq!(msg.message_type(), 170);
        assert_eq!(msg.name(), "ReleaseAccessBearersRequest");
    }

    #[test]
    fn test_created_bearer_results_sorted() {
        let e = |v| Ebi::new(v).unwrap();
        let results = created_bearer_results(&[(e(8), None, None), (e(6), None, None)], &[e(7)]);
        let order: Vec<u8> = results.iter().map(|r| r.ebi.value()).collect();
        assert_eq!(order, vec![6, 7, 8]);
        assert_eq!(results[1].cause, GtpCause::RequestRejected);
    }
}
