//! MME Session Error Types
//!
//! Error kinds surfaced by the bearer lifecycle manager and the EMM-CN
//! coordinator. Handlers return these; the event router logs and drops them.

use std::fmt;

use thiserror::Error;

use crate::timer::MmeTimerId;

/// Result type for session and coordinator operations
pub type MmeResult<T> = Result<T, MmeError>;

// ============================================================================
// Lookup Keys
// ============================================================================

/// Describes what a failed lookup was searching for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Subscriber context by MME UE S1AP ID
    MmeUeS1apId(u32),
    /// Subscriber context by (SCTP association, eNB UE S1AP ID)
    EnbUeS1apId { sctp_assoc_id: u32, enb_ue_s1ap_id: u32 },
    /// Subscriber context by local S11 TEID
    S11Teid(u32),
    /// Subscriber context by IMSI
    Imsi(u64),
    /// Subscriber context by GUTI
    Guti(String),
    /// Bearer context inside a subscriber context
    Bearer { ue_id: u32, ebi: u8 },
    /// PDN context inside a subscriber context
    Pdn { ue_id: u32, cid: usize },
    /// Pending create-bearer procedure
    CreateBearerProcedure { ue_id: u32 },
    /// Pending EMM procedure of the given kind
    EmmProcedure { ue_id: u32, kind: &'static str },
    /// APN configuration in the subscription profile
    ApnConfiguration { ue_id: u32, apn: String },
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::MmeUeS1apId(id) => write!(f, "ue context mme_ue_s1ap_id={}", id),
            Lookup::EnbUeS1apId {
                sctp_assoc_id,
                enb_ue_s1ap_id,
            } => write!(
                f,
                "ue context enb_ue_s1ap_id={} assoc={}",
                enb_ue_s1ap_id, sctp_assoc_id
            ),
            Lookup::S11Teid(teid) => write!(f, "ue context s11_teid=0x{:08x}", teid),
            Lookup::Imsi(imsi) => write!(f, "ue context imsi={}", imsi),
            Lookup::Guti(guti) => write!(f, "ue context guti={}", guti),
            Lookup::Bearer { ue_id, ebi } => write!(f, "bearer ebi={} of ue {}", ebi, ue_id),
            Lookup::Pdn { ue_id, cid } => write!(f, "pdn cid={} of ue {}", cid, ue_id),
            Lookup::CreateBearerProcedure { ue_id } => {
                write!(f, "create bearer procedure of ue {}", ue_id)
            }
            Lookup::EmmProcedure { ue_id, kind } => write!(f, "{} procedure of ue {}", kind, ue_id),
            Lookup::ApnConfiguration { ue_id, apn } => {
                write!(f, "apn configuration '{}' of ue {}", apn, ue_id)
            }
        }
    }
}

/// External peer that rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// Serving gateway over S11
    Gateway,
    /// eNB over S1AP
    RadioPeer,
    /// EMM/ESM layer
    MobilityLayer,
    /// MSC/VLR over SGs
    CircuitDomain,
    /// HSS over S6a
    SubscriberDb,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Gateway => write!(f, "GATEWAY"),
            Peer::RadioPeer => write!(f, "RADIO_PEER"),
            Peer::MobilityLayer => write!(f, "MOBILITY_LAYER"),
            Peer::CircuitDomain => write!(f, "CIRCUIT_DOMAIN"),
            Peer::SubscriberDb => write!(f, "SUBSCRIBER_DB"),
        }
    }
}

// ============================================================================
// MME Error
// ============================================================================

/// MME session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmeError {
    #[error("not found: {0}")]
    NotFound(Lookup),

    #[error("{peer} rejected the request with cause {cause}")]
    PeerRejected { peer: Peer, cause: u8 },

    #[error("timer {0} expired")]
    Timeout(MmeTimerId),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("illegal transition for bearer ebi={ebi}: {event} in state {from}")]
    IllegalBearerTransition {
        ebi: u8,
        from: &'static str,
        event: &'static str,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("subscriber context lock poisoned")]
    LockPoisoned,

    #[error("configuration error: {0}")]
    Config(String),
}

impl MmeError {
    /// True for errors that leave the subscriber context untouched
    pub fn is_lookup_miss(&self) -> bool {
        matches!(self, MmeError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = MmeError::NotFound(Lookup::S11Teid(0x10));
        assert_eq!(err.to_string(), "not found: ue context s11_teid=0x00000010");
        assert!(err.is_lookup_miss());
    }

    #[test]
    fn test_illegal_transition_display() {
        let err = MmeError::IllegalBearerTransition {
            ebi: 6,
            from: "ENB_CREATED",
            event: "gateway_created",
        };
        assert_eq!(
            err.to_string(),
            "illegal transition for bearer ebi=6: gateway_created in state ENB_CREATED"
        );
        assert!(!err.is_lookup_miss());
    }

    #[test]
    fn test_peer_rejected_display() {
        let err = MmeError::PeerRejected {
            peer: Peer::Gateway,
            cause: 64,
        };
        assert_eq!(err.to_string(), "GATEWAY rejected the request with cause 64");
    }

    #[test]
    fn test_timeout_display() {
        let err = MmeError::Timeout(MmeTimerId::Paging);
        assert_eq!(err.to_string(), "timer MME_TIMER_PAGING expired");
    }
}
