//! MME SGsAP Messages
//!
//! SGs messages toward the MSC/VLR used by CS fallback.

use crate::context::{Imsi64, MmeUeS1apId};

/// SGsAP message types
pub mod message_type {
    pub const PAGING_REJECT: u8 = 0x02;
    pub const SERVICE_REQUEST: u8 = 0x06;
    pub const LOCATION_UPDATE_REQUEST: u8 = 0x09;
    pub const EPS_DETACH_INDICATION: u8 = 0x11;
    pub const IMSI_DETACH_INDICATION: u8 = 0x13;
}

// ============================================================================
// SGsAP Cause Values
// ============================================================================

/// SGsAP cause values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SgsapCause {
    #[default]
    ImsiDetachedForEpsServices = 0x02,
    ImsiDetachedForEpsAndNonEpsServices = 0x03,
    ImsiUnknown = 0x04,
    ImsiDetachedForNonEpsServices = 0x05,
    ImsiImplicitlyDetachedForNonEpsServices = 0x06,
    UeUnreachable = 0x07,
    MessageNotCompatibleWithProtocolState = 0x08,
    MtCsfbCallRejectedByUser = 0x0e,
    UeTemporarilyUnreachable = 0x0f,
}

/// EPS location update type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsLocationUpdateType {
    #[default]
    ImsiAttach = 0x01,
    NormalLocationUpdate = 0x02,
}

/// Service indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ServiceIndicator {
    #[default]
    CsCall = 0x01,
    Sms = 0x02,
}

/// UE EMM mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UeEmmMode {
    #[default]
    EmmIdle = 0x00,
    EmmConnected = 0x01,
}

/// Kind of detach reported to the VLR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgsDetachType {
    /// Network-initiated EPS detach
    Eps,
    /// Implicit detach from non-EPS services
    ImplicitNonEps,
    /// Explicit IMSI detach, no LAI available
    ImsiDetach,
}

// ============================================================================
// Messages
// ============================================================================

/// SGs messages sent by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgsMessage {
    LocationUpdateRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        imsi: Option<Imsi64>,
        update_type: EpsLocationUpdateType,
    },
    ServiceRequest {
        imsi: Option<Imsi64>,
        service_indicator: ServiceIndicator,
        ue_emm_mode: UeEmmMode,
    },
    PagingReject {
        imsi: Option<Imsi64>,
        cause: SgsapCause,
    },
    DetachIndication {
        mme_ue_s1ap_id: MmeUeS1apId,
        imsi: Option<Imsi64>,
        detach_type: SgsDetachType,
    },
}

impl SgsMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            SgsMessage::LocationUpdateRequest { .. } => message_type::LOCATION_UPDATE_REQUEST,
            SgsMessage::ServiceRequest { .. } => message_type::SERVICE_REQUEST,
            SgsMessage::PagingReject { .. } => message_type::PAGING_REJECT,
            SgsMessage::DetachIndication { detach_type, .. } => match detach_type {
                SgsDetachType::Eps => message_type::EPS_DETACH_INDICATION,
                SgsDetachType::ImplicitNonEps | SgsDetachType::ImsiDetach => {
                    message_type::IMSI_DETACH_INDICATION
                }
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SgsMessage::LocationUpdateRequest { .. } => "SGsAP-LOCATION-UPDATE-REQUEST",
            SgsMessage::ServiceRequest { .. } => "SGsAP-SERVICE-REQUEST",
            SgsMessage::PagingReject { .. } => "SGsAP-PAGING-REJECT",
            SgsMessage::DetachIndication { .. } => "SGsAP-DETACH-INDICATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgsap_cause_values() {
        assert_eq!(SgsapCause::MtCsfbCallRejectedByUser as u8, 0x0e);
        assert_eq!(SgsapCause::UeUnreachable as u8, 0x07);
    }

    #[test]
    fn test_detach_message_types() {
        let eps = SgsMessage::DetachIndication {
            mme_ue_s1ap_id: 1,
            imsi: Some(1010123456789),
            detach_type: SgsDetachType::Eps,
        };
        assert_eq!(eps.message_type(), message_type::EPS_DETACH_INDICATION);
        let imsi = SgsMessage::DetachIndication {
            mme_ue_s1ap_id: 1,
            imsi: None,
            detach_type: SgsDetachType::ImplicitNonEps,
        };
        assert_eq!(imsi.message_type(), message_type::IMSI_DETACH_INDICATION);
    }
}
