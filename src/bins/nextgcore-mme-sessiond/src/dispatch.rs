//! MME Session Message Dispatch
//!
//! Outbound side of the session core. Handlers hand every message to a
//! `Dispatch`; the peer paths own encoding and transport.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::context::{Imsi64, MmeUeS1apId};
use crate::emm_build::EmmProcRequest;
use crate::error::{MmeError, MmeResult};
use crate::event::{EmmCnPrimitive, MmeEvent, NasEvent};
use crate::s11_build::S11Message;
use crate::s1ap_build::S1apMessage;
use crate::sgsap_build::SgsMessage;

/// S6a requests toward the HSS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S6aMessage {
    AuthenticationInformationRequest { ue_id: MmeUeS1apId, imsi: Imsi64 },
    UpdateLocationRequest {
        ue_id: MmeUeS1apId,
        imsi: Option<Imsi64>,
    },
    PurgeUeRequest { imsi: Option<Imsi64> },
}

impl S6aMessage {
    pub fn name(&self) -> &'static str {
        match self {
            S6aMessage::AuthenticationInformationRequest { .. } => {
                "S6A_AUTHENTICATION_INFO_REQUEST"
            }
            S6aMessage::UpdateLocationRequest { .. } => "S6A_UPDATE_LOCATION_REQUEST",
            S6aMessage::PurgeUeRequest { .. } => "S6A_PURGE_UE_REQUEST",
        }
    }
}

/// Message produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    S11(S11Message),
    S1ap(S1apMessage),
    Sgs(SgsMessage),
    S6a(S6aMessage),
    /// Request to the EMM/ESM procedures
    Emm(EmmProcRequest),
    /// Primitive for the EMM-CN coordinator
    EmmCn(EmmCnPrimitive),
    /// Request from the NAS side back to the lifecycle manager
    MmeApp(NasEvent),
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::S11(msg) => msg.name(),
            OutboundMessage::S1ap(msg) => msg.name(),
            OutboundMessage::Sgs(msg) => msg.name(),
            OutboundMessage::S6a(msg) => msg.name(),
            OutboundMessage::Emm(req) => req.name(),
            OutboundMessage::EmmCn(primitive) => primitive.name(),
            OutboundMessage::MmeApp(event) => event.name(),
        }
    }
}

/// Ordered delivery toward the peers
pub trait Dispatch: Send + Sync {
    fn send(&self, msg: OutboundMessage) -> MmeResult<()>;
}

// ============================================================================
// Recording Queue
// ============================================================================

/// Dispatch that keeps every message in send order
#[derive(Debug, Default)]
pub struct DispatchQueue {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sent().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every message sent so far
    pub fn drain(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent())
    }

    /// Copy of every message sent so far
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.sent().clone()
    }

    pub fn s11(&self) -> Vec<S11Message> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::S11(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn s1ap(&self) -> Vec<S1apMessage> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::S1ap(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sgs(&self) -> Vec<SgsMessage> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Sgs(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn emm(&self) -> Vec<EmmProcRequest> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Emm(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn emm_cn(&self) -> Vec<EmmCnPrimitive> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::EmmCn(primitive) => Some(primitive.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn s6a(&self) -> Vec<S6aMessage> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::S6a(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mme_app(&self) -> Vec<NasEvent> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::MmeApp(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent(&self) -> std::sync::MutexGuard<'_, Vec<OutboundMessage>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Dispatch for DispatchQueue {
    fn send(&self, msg: OutboundMessage) -> MmeResult<()> {
        log::debug!("Queued {}", msg.name());
        self.sent().push(msg);
        Ok(())
    }
}

// ============================================================================
// Channel Dispatch
// ============================================================================

/// Dispatch for the daemon. Coordinator primitives and NAS requests loop back
/// into the event channel; everything else goes to the peer channel.
pub struct ChannelDispatch {
    events: mpsc::Sender<MmeEvent>,
    peers: mpsc::Sender<OutboundMessage>,
}

impl ChannelDispatch {
    pub fn new(events: mpsc::Sender<MmeEvent>, peers: mpsc::Sender<OutboundMessage>) -> Self {
        Self { events, peers }
    }
}

impl Dispatch for ChannelDispatch {
    fn send(&self, msg: OutboundMessage) -> MmeResult<()> {
        let name = msg.name();
        let result = match msg {
            OutboundMessage::EmmCn(primitive) => self
                .events
                .try_send(MmeEvent::EmmCn(primitive))
                .map_err(|e| e.to_string()),
            OutboundMessage::MmeApp(event) => self
                .events
                .try_send(MmeEvent::Nas(event))
                .map_err(|e| e.to_string()),
            other => self.peers.try_send(other).map_err(|e| e.to_string()),
        };
        result.map_err(|e| MmeError::Dispatch(format!("{}: {}", name, e)))?;
        log::debug!("Sent {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sgsap_build::SgsapCause;

    #[test]
    fn test_queue_keeps_order() {
        let queue = DispatchQueue::new();
        queue
            .send(OutboundMessage::Emm(EmmProcRequest::CommonProcedureInitiated { ue_id: 1 }))
            .unwrap();
        queue
            .send(OutboundMessage::Sgs(SgsMessage::PagingReject {
                imsi: Some(1),
                cause: SgsapCause::UeUnreachable,
            }))
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.emm().len(), 1);
        assert_eq!(queue.sgs().len(), 1);
        let drained = queue.drain();
        assert_eq!(drained[0].name(), "EMM_COMMON_PROC_REQ");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_channel_dispatch_loops_back_coordinator_primitives() {
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (peers_tx, mut peers_rx) = mpsc::channel(4);
        let dispatch = ChannelDispatch::new(events_tx, peers_tx);

        dispatch
            .send(OutboundMessage::EmmCn(EmmCnPrimitive::Deregister { ue_id: 5 }))
            .unwrap();
        dispatch
            .send(OutboundMessage::S6a(S6aMessage::PurgeUeRequest { imsi: Some(9) }))
            .unwrap();

        assert!(matches!(
            events_rx.try_recv(),
            Ok(MmeEvent::EmmCn(EmmCnPrimitive::Deregister { ue_id: 5 }))
        ));
        assert!(matches!(
            peers_rx.try_recv(),
            Ok(OutboundMessage::S6a(S6aMessage::PurgeUeRequest { imsi: Some(9) }))
        ));
    }

    #[test]
    fn test_channel_dispatch_full() {
        let (events_tx, _events_rx) = mpsc::channel(1);
        let (peers_tx, _peers_rx) = mpsc::channel(1);
        let dispatch = ChannelDispatch::new(events_tx, peers_tx);
        let msg = || OutboundMessage::S6a(S6aMessage::PurgeUeRequest { imsi: None });
        dispatch.send(msg()).unwrap();
        assert!(matches!(dispatch.send(msg()), Err(MmeError::Dispatch(_))));
    }
}
