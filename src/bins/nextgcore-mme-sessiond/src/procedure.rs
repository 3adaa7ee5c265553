//! Gateway Bearer Procedures
//!
//! Tracks a gateway-initiated create bearer request that fans out into one
//! mobility-layer request per dedicated bearer. The aggregate answer to the
//! gateway is built once every bearer has reported exactly once. Delete bearer
//! requests waiting for the UE are queued per bearer set so that each one is
//! answered on its own transaction.

use std::fmt;

use crate::context::{Ebi, PdnCid, Teid};
use crate::error::{MmeError, MmeResult};
use crate::s11_build::GtpCause;

/// Per-bearer status within the procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerStatus {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for BearerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerStatus::Pending => write!(f, "PENDING"),
            BearerStatus::Success => write!(f, "SUCCESS"),
            BearerStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Correlates the aggregate response with the gateway's request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTransaction {
    /// Gateway S11 TEID to answer to
    pub sgw_teid: Teid,
    pub sequence: u32,
}

/// What the last report did to the procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Pending,
    Complete(CreateBearerOutcome),
}

/// Aggregate result once all bearers reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBearerOutcome {
    pub cause: GtpCause,
    pub accepted: Vec<Ebi>,
    pub rejected: Vec<Ebi>,
}

/// Outstanding create-bearer fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBearerProcedure {
    pub transaction: GatewayTransaction,
    pub pdn_cid: PdnCid,
    pub linked_ebi: Ebi,
    bearers: Vec<(Ebi, BearerStatus)>,
    num_status_received: usize,
}

impl CreateBearerProcedure {
    pub fn new(
        transaction: GatewayTransaction,
        pdn_cid: PdnCid,
        linked_ebi: Ebi,
        ebis: &[Ebi],
    ) -> Self {
        Self {
            transaction,
            pdn_cid,
            linked_ebi,
            bearers: ebis.iter().map(|ebi| (*ebi, BearerStatus::Pending)).collect(),
            num_status_received: 0,
        }
    }

    pub fn num_bearers(&self) -> usize {
        self.bearers.len()
    }

    pub fn num_status_received(&self) -> usize {
        self.num_status_received
    }

    pub fn status(&self, ebi: Ebi) -> Option<BearerStatus> {
        self.bearers
            .iter()
            .find(|(e, _)| *e == ebi)
            .map(|(_, status)| *status)
    }

    pub fn covers(&self, ebi: Ebi) -> bool {
        self.status(ebi).is_some()
    }

    /// Record the mobility layer's answer for one bearer
    pub fn report(&mut self, ebi: Ebi, success: bool) -> MmeResult<ReportOutcome> {
        let entry = self
            .bearers
            .iter_mut()
            .find(|(e, _)| *e == ebi)
            .ok_or_else(|| {
                MmeError::ProtocolViolation(format!(
                    "ebi={} is not part of the create bearer procedure",
                    ebi
                ))
            })?;
        if entry.1 != BearerStatus::Pending {
            return Err(MmeError::ProtocolViolation(format!(
                "ebi={} already reported {}",
                ebi, entry.1
            )));
        }
        entry.1 = if success {
            BearerStatus::Success
        } else {
            BearerStatus::Failed
        };
        self.num_status_received += 1;

        if self.num_status_received < self.bearers.len() {
            return Ok(ReportOutcome::Pending);
        }
        Ok(ReportOutcome::Complete(self.outcome()))
    }

    fn outcome(&self) -> CreateBearerOutcome {
        let accepted: Vec<Ebi> = self
            .bearers
            .iter()
            .filter(|(_, s)| *s == BearerStatus::Success)
            .map(|(e, _)| *e)
            .collect();
        let rejected: Vec<Ebi> = self
            .bearers
            .iter()
            .filter(|(_, s)| *s == BearerStatus::Failed)
            .map(|(e, _)| *e)
            .collect();
        let cause = if rejected.is_empty() {
            GtpCause::RequestAccepted
        } else if accepted.is_empty() {
            GtpCause::RequestRejected
        } else {
            GtpCause::RequestAcceptedPartially
        };
        CreateBearerOutcome {
            cause,
            accepted,
            rejected,
        }
    }
}

// ============================================================================
// Delete Bearer
// ============================================================================

/// Gateway delete bearer request waiting for the UE's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDeleteBearer {
    pub transaction: GatewayTransaction,
    pub delete_default_bearer: bool,
    pub ebis: Vec<Ebi>,
}

/// Outstanding delete bearer requests of one subscriber, keyed by bearer set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBearerQueue {
    pending: Vec<PendingDeleteBearer>,
}

impl DeleteBearerQueue {
    /// Queue a request. A bearer is never part of two pending requests.
    pub fn push(&mut self, entry: PendingDeleteBearer) -> MmeResult<()> {
        if let Some(ebi) = entry.ebis.iter().find(|ebi| self.covers(**ebi)) {
            return Err(MmeError::InvalidState(format!(
                "ebi={} already has a delete bearer request pending",
                ebi
            )));
        }
        self.pending.push(entry);
        Ok(())
    }

    pub fn covers(&self, ebi: Ebi) -> bool {
        self.pending.iter().any(|p| p.ebis.contains(&ebi))
    }

    /// Remove the request that the UE's answer for `ebis` belongs to
    pub fn take(&mut self, ebis: &[Ebi]) -> Option<PendingDeleteBearer> {
        let index = self
            .pending
            .iter()
            .position(|p| ebis.iter().any(|ebi| p.ebis.contains(ebi)))?;
        Some(self.pending.remove(index))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ebis(values: &[u8]) -> Vec<Ebi> {
        values.iter().map(|v| Ebi::new(*v).unwrap()).collect()
    }

    fn proc_for(values: &[u8]) -> CreateBearerProcedure {
        CreateBearerProcedure::new(
            GatewayTransaction {
                sgw_teid: 0x55,
                sequence: 7,
            },
            PdnCid::new(0).unwrap(),
            Ebi::new(5).unwrap(),
            &ebis(values),
        )
    }

    #[test]
    fn test_all_accepted() {
        let mut proc = proc_for(&[6, 7]);
        let e = ebis(&[6, 7]);
        assert_eq!(proc.report(e[0], true).unwrap(), ReportOutcome::Pending);
        match proc.report(e[1], true).unwrap() {
            ReportOutcome::Complete(outcome) => {
                assert_eq!(outcome.cause, GtpCause::RequestAccepted);
                assert_eq!(outcome.accepted.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partially_accepted() {
        let mut proc = proc_for(&[6, 7, 8]);
        let e = ebis(&[6, 7, 8]);
        proc.report(e[0], true).unwrap();
        proc.report(e[1], false).unwrap();
        let outcome = match proc.report(e[2], true).unwrap() {
            ReportOutcome::Complete(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.cause, GtpCause::RequestAcceptedPartially);
        assert_eq!(outcome.accepted, ebis(&[6, 8]));
        assert_eq!(outcome.rejected, ebis(&[7]));
        assert_eq!(proc.num_status_received(), 3);
    }

    #[test]
    fn test_all_rejected() {
        let mut proc = proc_for(&[6]);
        match proc.report(ebis(&[6])[0], false).unwrap() {
            ReportOutcome::Complete(outcome) => {
                assert_eq!(outcome.cause, GtpCause::RequestRejected)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_double_report_rejected() {
        let mut proc = proc_for(&[6, 7]);
        let e = ebis(&[6, 7]);
        proc.report(e[0], true).unwrap();
        assert!(proc.report(e[0], false).is_err());
        assert_eq!(proc.status(e[0]), Some(BearerStatus::Success));
        assert_eq!(proc.num_status_received(), 1);
    }

    #[test]
    fn test_unknown_bearer_report() {
        let mut proc = proc_for(&[6]);
        assert!(proc.report(ebis(&[9])[0], true).is_err());
        assert!(!proc.covers(ebis(&[9])[0]));
    }

    fn pending_delete(sequence: u32, values: &[u8]) -> PendingDeleteBearer {
        PendingDeleteBearer {
            transaction: GatewayTransaction {
                sgw_teid: 0x55,
                sequence,
            },
            delete_default_bearer: false,
            ebis: ebis(values),
        }
    }

    #[test]
    fn test_delete_bearer_queue_matches_by_bearer() {
        let mut queue = DeleteBearerQueue::default();
        queue.push(pending_delete(100, &[6])).unwrap();
        queue.push(pending_delete(200, &[7, 8])).unwrap();
        assert_eq!(queue.len(), 2);

        let second = queue.take(&ebis(&[8])).unwrap();
        assert_eq!(second.transaction.sequence, 200);
        let first = queue.take(&ebis(&[6])).unwrap();
        assert_eq!(first.transaction.sequence, 100);
        assert!(queue.take(&ebis(&[6])).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_delete_bearer_queue_refuses_overlap() {
        let mut queue = DeleteBearerQueue::default();
        queue.push(pending_delete(100, &[6, 7])).unwrap();
        assert!(queue.push(pending_delete(200, &[7])).is_err());
        assert_eq!(queue.len(), 1);
        assert!(queue.covers(ebis(&[7])[0]));
    }
}
