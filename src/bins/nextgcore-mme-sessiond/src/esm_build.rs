//! ESM Message Building
//!
//! Session management payloads the coordinator piggybacks on attach accept and
//! attach reject, and the gateway-to-ESM cause table.

use bytes::Bytes;

use crate::context::{Bitrate, Ebi, Paa, Pti, Qos};
use crate::emm_build::NasBuffer;
use crate::s11_build::GtpCause;

/// NAS Protocol Discriminator for ESM
pub const NAS_PROTOCOL_DISCRIMINATOR_ESM: u8 = 0x02;

/// Procedure Transaction Identity - Unassigned
pub const PTI_UNASSIGNED: u8 = 0;

/// Optional IEIs
const ESM_CAUSE_IEI: u8 = 0x58;
const APN_AMBR_IEI: u8 = 0x5e;
const PCO_IEI: u8 = 0x27;

// ============================================================================
// ESM Cause Codes (3GPP TS 24.301)
// ============================================================================

/// ESM Cause codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EsmCause {
    /// Operator determined barring
    OperatorDeterminedBarring = 8,
    /// Insufficient resources
    InsufficientResources = 26,
    /// Missing or unknown APN
    MissingOrUnknownApn = 27,
    /// Unknown PDN type
    UnknownPdnType = 28,
    /// Request rejected by Serving GW or PDN GW
    RequestRejectedByGw = 30,
    /// Request rejected, unspecified
    RequestRejectedUnspecified = 31,
    /// Service option not supported
    ServiceOptionNotSupported = 32,
    /// Regular deactivation
    RegularDeactivation = 36,
    /// Network failure
    NetworkFailure = 38,
    /// PDN type IPv4 only allowed
    PdnTypeIpv4OnlyAllowed = 50,
    /// PDN type IPv6 only allowed
    PdnTypeIpv6OnlyAllowed = 51,
    /// Requested APN not supported in current RAT and PLMN combination
    RequestedApnNotSupportedInCurrentRatAndPlmn = 66,
}

impl EsmCause {
    /// Map a gateway cause of a failed session creation
    pub fn from_gtp_cause(cause: GtpCause) -> Self {
        match cause {
            GtpCause::ContextNotFound | GtpCause::InvalidMessageFormat => {
                EsmCause::RequestRejectedByGw
            }
            GtpCause::ServiceNotSupported => EsmCause::ServiceOptionNotSupported,
            GtpCause::SystemFailure => EsmCause::NetworkFailure,
            GtpCause::NoResourcesAvailable | GtpCause::AllDynamicAddressesAreOccupied => {
                EsmCause::InsufficientResources
            }
            _ => EsmCause::RequestRejectedByGw,
        }
    }
}

/// ESM Message Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EsmMessageType {
    ActivateDefaultEpsBearerContextRequest = 0xc1,
    ActivateDedicatedEpsBearerContextRequest = 0xc5,
    DeactivateEpsBearerContextRequest = 0xcd,
    PdnConnectivityReject = 0xd1,
}

// ============================================================================
// PDN Types
// ============================================================================

/// PDN Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdnType {
    #[default]
    Ipv4 = 1,
    Ipv6 = 2,
    Ipv4v6 = 3,
    NonIp = 5,
}

impl PdnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PdnType::Ipv4),
            2 => Some(PdnType::Ipv6),
            3 => Some(PdnType::Ipv4v6),
            5 => Some(PdnType::NonIp),
            _ => None,
        }
    }
}

// ============================================================================
// IE Building
// ============================================================================

/// Build EPS QoS IE contents. Bitrates are in bps.
pub fn eps_qos_build(qos: &Qos) -> Vec<u8> {
    let mut buf = NasBuffer::new();
    buf.write_u8(qos.qci);

    // GBR bearers (QCI 1-4) carry MBR and GBR
    if (1..=4).contains(&qos.qci) {
        buf.write_u8(encode_bitrate(qos.mbr.uplink / 1000));
        buf.write_u8(encode_bitrate(qos.mbr.downlink / 1000));
        buf.write_u8(encode_bitrate(qos.gbr.uplink / 1000));
        buf.write_u8(encode_bitrate(qos.gbr.downlink / 1000));
    }
    buf.into_vec()
}

/// Encode bitrate value (3GPP TS 24.301 9.9.4.3)
fn encode_bitrate(kbps: u64) -> u8 {
    if kbps == 0 {
        return 0xff;
    }
    if kbps <= 63 {
        return kbps as u8;
    }
    if kbps <= 568 {
        return (64 + (kbps - 64) / 8) as u8;
    }
    if kbps <= 8640 {
        return (128 + (kbps - 576) / 64) as u8;
    }
    0xfe
}

/// Build APN-AMBR IE contents. Bitrates are in bps.
pub fn apn_ambr_build(ambr: &Bitrate) -> Vec<u8> {
    let mut buf = NasBuffer::new();
    buf.write_u8(encode_bitrate(ambr.downlink / 1000));
    buf.write_u8(encode_bitrate(ambr.uplink / 1000));
    buf.into_vec()
}

/// Build PDN address IE contents
pub fn encode_pdn_address(paa: &Paa) -> Vec<u8> {
    let mut buf = NasBuffer::new();
    match paa.pdn_type {
        PdnType::Ipv6 => {
            buf.write_u8(PdnType::Ipv6 as u8);
            // Interface identifier only
            buf.write_bytes(&paa.addr6[8..16]);
        }
        PdnType::Ipv4v6 => {
            buf.write_u8(PdnType::Ipv4v6 as u8);
            buf.write_bytes(&paa.addr6[8..16]);
            buf.write_bytes(&paa.addr);
        }
        _ => {
            buf.write_u8(PdnType::Ipv4 as u8);
            buf.write_bytes(&paa.addr);
        }
    }
    buf.into_vec()
}

fn write_esm_header(buf: &mut NasBuffer, ebi: u8, pti: Pti, message_type: EsmMessageType) {
    buf.write_u8((ebi << 4) | NAS_PROTOCOL_DISCRIMINATOR_ESM);
    buf.write_u8(pti);
    buf.write_u8(message_type as u8);
}

// ============================================================================
// ESM Message Building Functions
// ============================================================================

/// Contents of an activate default EPS bearer context request
#[derive(Debug, Clone, Default)]
pub struct DefaultBearerActivation {
    pub pti: Pti,
    pub ebi: Option<Ebi>,
    pub qos: Qos,
    pub apn: String,
    pub paa: Paa,
    /// PDN type the UE asked for
    pub requested_pdn_type: PdnType,
    pub apn_ambr: Bitrate,
    pub pco: Option<Bytes>,
}

/// Build activate default EPS bearer context request
pub fn build_activate_default_bearer_context_request(params: &DefaultBearerActivation) -> Bytes {
    let mut buf = NasBuffer::new();
    let ebi = params.ebi.map(|e| e.value()).unwrap_or(0);
    write_esm_header(
        &mut buf,
        ebi,
        params.pti,
        EsmMessageType::ActivateDefaultEpsBearerContextRequest,
    );

    buf.write_lv(&eps_qos_build(&params.qos));
    buf.write_lv(params.apn.as_bytes());
    buf.write_lv(&encode_pdn_address(&params.paa));

    if let Some(cause) = pdn_type_restriction(params.requested_pdn_type, params.paa.pdn_type) {
        buf.write_u8(ESM_CAUSE_IEI);
        buf.write_u8(cause as u8);
    }
    if params.apn_ambr.downlink > 0 || params.apn_ambr.uplink > 0 {
        buf.write_u8(APN_AMBR_IEI);
        buf.write_lv(&apn_ambr_build(&params.apn_ambr));
    }
    if let Some(pco) = params.pco.as_ref().filter(|p| !p.is_empty()) {
        buf.write_u8(PCO_IEI);
        buf.write_lv(pco);
    }
    buf.freeze()
}

/// IPv4v6 requested but only one family granted
fn pdn_type_restriction(requested: PdnType, granted: PdnType) -> Option<EsmCause> {
    if requested != PdnType::Ipv4v6 {
        return None;
    }
    match granted {
        PdnType::Ipv4 => Some(EsmCause::PdnTypeIpv4OnlyAllowed),
        PdnType::Ipv6 => Some(EsmCause::PdnTypeIpv6OnlyAllowed),
        _ => None,
    }
}

/// Build PDN connectivity reject
pub fn build_pdn_connectivity_reject(pti: Pti, esm_cause: EsmCause) -> Bytes {
    let mut buf = NasBuffer::new();
    write_esm_header(&mut buf, 0, pti, EsmMessageType::PdnConnectivityReject);
    buf.write_u8(esm_cause as u8);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esm_cause_from_gtp_cause() {
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::ContextNotFound),
            EsmCause::RequestRejectedByGw
        );
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::InvalidMessageFormat),
            EsmCause::RequestRejectedByGw
        );
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::ServiceNotSupported),
            EsmCause::ServiceOptionNotSupported
        );
        assert_eq!(EsmCause::from_gtp_cause(GtpCause::SystemFailure), EsmCause::NetworkFailure);
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::NoResourcesAvailable),
            EsmCause::InsufficientResources
        );
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::AllDynamicAddressesAreOccupied),
            EsmCause::InsufficientResources
        );
        assert_eq!(
            EsmCause::from_gtp_cause(GtpCause::RequestRejected),
            EsmCause::RequestRejectedByGw
        );
    }

    #[test]
    fn test_encode_bitrate() {
        assert_eq!(encode_bitrate(0), 0xff);
        assert_eq!(encode_bitrate(10), 10);
        assert_eq!(encode_bitrate(64), 64);
        assert_eq!(encode_bitrate(576), 128);
        assert_eq!(encode_bitrate(100_000), 0xfe);
    }

    #[test]
    fn test_eps_qos_build() {
        let non_gbr = Qos {
            qci: 9,
            ..Default::default()
        };
        assert_eq!(eps_qos_build(&non_gbr), vec![9]);

        let gbr = Qos {
            qci: 1,
            mbr: Bitrate {
                downlink: 64_000,
                uplink: 64_000,
            },
            gbr: Bitrate {
                downlink: 32_000,
                uplink: 32_000,
            },
            ..Default::default()
        };
        assert_eq!(eps_qos_build(&gbr), vec![1, 64, 64, 32, 32]);
    }

    #[test]
    fn test_build_pdn_connectivity_reject() {
        let msg = build_pdn_connectivity_reject(
            3,
            EsmCause::RequestedApnNotSupportedInCurrentRatAndPlmn,
        );
        assert_eq!(&msg[..], &[0x02, 3, 0xd1, 66]);
    }

    #[test]
    fn test_build_activate_default_bearer() {
        let params = DefaultBearerActivation {
            pti: 1,
            ebi: Ebi::new(5),
            qos: Qos {
                qci: 9,
                ..Default::default()
            },
            apn: "internet".to_string(),
            paa: Paa {
                pdn_type: PdnType::Ipv4,
                addr: [10, 45, 0, 2],
                addr6: [0; 16],
            },
            requested_pdn_type: PdnType::Ipv4v6,
            ..Default::default()
        };
        let msg = build_activate_default_bearer_context_request(&params);
        assert_eq!(msg[0], 0x52);
        assert_eq!(msg[1], 1);
        assert_eq!(msg[2], 0xc1);
        // QoS LV
        assert_eq!(&msg[3..5], &[1, 9]);
        // APN LV
        assert_eq!(msg[5], 8);
        assert_eq!(&msg[6..14], b"internet");
        // PDN address LV
        assert_eq!(&msg[14..20], &[5, 1, 10, 45, 0, 2]);
        // IPv4 only allowed
        assert_eq!(&msg[20..22], &[0x58, 50]);
        assert_eq!(msg.len(), 22);
    }
}
