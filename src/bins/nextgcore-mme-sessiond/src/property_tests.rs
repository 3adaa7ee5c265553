//! Property-based tests for the subscriber context and procedure plumbing
//!
//! Bearer/PDN linkage under arbitrary add/remove sequences, one-shot barrier
//! firing, and timer expiry idempotence.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::barrier::{Barrier, BarrierOutcome};
    use crate::bearer_manager::BearerManager;
    use crate::config::MmeConfig;
    use crate::context::{
        Ebi, EcmState, EpsGuti, MmState, PdnCid, PdnContext, Qos, UeContext, MAX_NUM_OF_SESS,
    };
    use crate::dispatch::DispatchQueue;
    use crate::esm_build::PdnType;
    use crate::repository::{lock_ue, InMemoryUeRepository, UeKey, UeRepository};
    use crate::timer::{MmeTimerId, TimerExpiry, TimerHandle, TimerManager};

    #[derive(Debug, Clone)]
    enum ContextOp {
        AddPdn(usize),
        AddBearer(usize, u8),
        RemoveBearer(u8),
        RemovePdn(usize),
    }

    fn arb_context_op() -> impl Strategy<Value = ContextOp> {
        prop_oneof![
            (0..MAX_NUM_OF_SESS).prop_map(ContextOp::AddPdn),
            (0..MAX_NUM_OF_SESS, 5u8..=15).prop_map(|(cid, ebi)| ContextOp::AddBearer(cid, ebi)),
            (5u8..=15).prop_map(ContextOp::RemoveBearer),
            (0..MAX_NUM_OF_SESS).prop_map(ContextOp::RemovePdn),
        ]
    }

    fn arb_timer_id() -> impl Strategy<Value = MmeTimerId> {
        prop_oneof![
            Just(MmeTimerId::InitialContextSetupRsp),
            Just(MmeTimerId::Paging),
            Just(MmeTimerId::MobileReachability),
            Just(MmeTimerId::ImplicitDetach),
            Just(MmeTimerId::UlrResponse),
            Just(MmeTimerId::UeContextModification),
        ]
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Gate {
        A,
        B,
        C,
    }

    fn arb_gate() -> impl Strategy<Value = Gate> {
        prop_oneof![Just(Gate::A), Just(Gate::B), Just(Gate::C)]
    }

    fn apply(ue: &mut UeContext, op: &ContextOp) {
        match *op {
            ContextOp::AddPdn(c) => {
                let cid = PdnCid::new(c).unwrap();
                let pdn = PdnContext::new(c as u32 + 1, "internet", PdnType::Ipv4);
                let _ = ue.insert_pdn(cid, pdn);
            }
            ContextOp::AddBearer(c, e) => {
                let cid = PdnCid::new(c).unwrap();
                let ebi = Ebi::new(e).unwrap();
                if ue.add_bearer(cid, ebi, Qos::default()).is_ok() {
                    assert_eq!(ue.pdn_of(ebi).unwrap().0, cid);
                }
            }
            ContextOp::RemoveBearer(e) => {
                let ebi = Ebi::new(e).unwrap();
                let was_default = ue
                    .pdn_of(ebi)
                    .map(|(cid, pdn)| (cid, pdn.default_ebi() == Some(ebi)))
                    .ok();
                ue.remove_bearer(ebi);
                assert!(ue.bearers.get(ebi).is_none());
                if let Some((cid, true)) = was_default {
                    assert!(ue.pdns.get(cid).is_none());
                }
            }
            ContextOp::RemovePdn(c) => {
                let cid = PdnCid::new(c).unwrap();
                ue.remove_pdn(cid);
                assert!(ue.bearers.iter().all(|b| b.pdn_cid != cid));
            }
        }
    }

    fn setup() -> (
        BearerManager,
        Arc<InMemoryUeRepository>,
        Arc<DispatchQueue>,
        Arc<TimerManager>,
    ) {
        let repo = Arc::new(InMemoryUeRepository::default());
        let dispatch = Arc::new(DispatchQueue::new());
        let timers = Arc::new(TimerManager::new());
        let manager = BearerManager::new(
            repo.clone(),
            dispatch.clone(),
            timers.clone(),
            MmeConfig::default(),
        );
        (manager, repo, dispatch, timers)
    }

    fn idle_ue(repo: &InMemoryUeRepository) -> u32 {
        let mut ue = UeContext::new();
        ue.imsi = Some(1010000000001);
        ue.mm_state = MmState::Registered;
        ue.ecm_state = EcmState::Idle;
        ue.emm.guti = Some(EpsGuti {
            m_tmsi: 0x0a0b,
            ..Default::default()
        });
        repo.insert(ue).unwrap()
    }

    fn arm(manager: &BearerManager, repo: &InMemoryUeRepository, ue_id: u32, timer_id: MmeTimerId) {
        let handle = repo.get(&UeKey::MmeUeS1apId(ue_id)).unwrap();
        let mut ue = lock_ue(&handle).unwrap();
        manager.start_timer(&mut ue, timer_id);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Every bearer belongs to exactly one PDN and every PDN lists only its own bearers
        #[test]
        fn prop_bearer_pdn_linkage(ops in prop::collection::vec(arb_context_op(), 0..40)) {
            let mut ue = UeContext::new();
            for op in &ops {
                apply(&mut ue, op);
                prop_assert!(ue.check_linkage().is_ok());

                let listed: usize = ue.pdns.iter().map(|(_, pdn)| pdn.bearers().count()).sum();
                prop_assert_eq!(listed, ue.bearers.len());

                for (_, pdn) in ue.pdns.iter() {
                    if pdn.bearers().next().is_some() {
                        let default_ebi = pdn.default_ebi();
                        prop_assert!(default_ebi.is_some());
                        prop_assert!(default_ebi.map(|e| pdn.owns(e)).unwrap_or(false));
                    }
                }
            }
        }

        /// The barrier fires exactly once, on the call that completes the required set
        #[test]
        fn prop_barrier_fires_once(
            mask in 1u8..8,
            calls in prop::collection::vec(arb_gate(), 0..20),
        ) {
            let required: Vec<Gate> = [Gate::A, Gate::B, Gate::C]
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, g)| g)
                .collect();
            let mut barrier = Barrier::new(required.iter().copied());

            let mut seen = std::collections::BTreeSet::new();
            let mut fired_at = None;
            for (i, gate) in calls.iter().enumerate() {
                let outcome = barrier.satisfy(*gate);
                if required.contains(gate) {
                    seen.insert(*gate);
                }
                if outcome == BarrierOutcome::Fired {
                    prop_assert!(fired_at.is_none());
                    fired_at = Some(i);
                    prop_assert_eq!(seen.len(), required.len());
                }
                if fired_at.is_some() && fired_at != Some(i) {
                    prop_assert_eq!(outcome, BarrierOutcome::AlreadyFired);
                }
            }

            let complete = required.iter().all(|g| calls.contains(g));
            prop_assert_eq!(barrier.has_fired(), complete);
            prop_assert_eq!(fired_at.is_some(), complete);
        }

        /// Expiries of superseded timers do nothing and leave the live timer armed
        #[test]
        fn prop_stale_expiry_ignored(rearms in prop::collection::vec(arb_timer_id(), 1..12)) {
            let (manager, repo, dispatch, timers) = setup();
            let ue_id = idle_ue(&repo);

            let mut handles: Vec<(MmeTimerId, TimerHandle)> = Vec::new();
            for timer_id in &rearms {
                arm(&manager, &repo, ue_id, *timer_id);
                let handle = timers.active_handle(ue_id, *timer_id).unwrap();
                handles.push((*timer_id, handle));
            }

            for (timer_id, handle) in &handles {
                if timers.active_handle(ue_id, *timer_id) == Some(*handle) {
                    continue;
                }
                let stale = TimerExpiry { ue_id, timer_id: *timer_id, handle: *handle };
                prop_assert!(manager.handle_timer_expiry(stale).is_ok());
                prop_assert!(dispatch.is_empty());
                prop_assert!(timers.is_armed(ue_id, *timer_id));
            }
        }

        /// A delivered expiry handled a second time has no further effect
        #[test]
        fn prop_duplicate_expiry_idempotent(timer_id in arb_timer_id()) {
            let (manager, repo, dispatch, timers) = setup();
            let ue_id = idle_ue(&repo);
            arm(&manager, &repo, ue_id, timer_id);

            let handle = timers.active_handle(ue_id, timer_id).unwrap();
            let expiry = timers.expire(handle).unwrap();
            let _ = manager.handle_timer_expiry(expiry);
            let sent = dispatch.len();

            prop_assert!(manager.handle_timer_expiry(expiry).is_ok());
            prop_assert_eq!(dispatch.len(), sent);
        }
    }
}
