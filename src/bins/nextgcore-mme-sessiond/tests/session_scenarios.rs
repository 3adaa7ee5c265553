//! Session lifecycle scenarios driven through the state machine

mod common;

use bytes::Bytes;

use common::*;
use nextgcore_mme_sessiond::bearer_manager::PagingTarget;
use nextgcore_mme_sessiond::context::{EcmState, EpsGuti, MmState, Qos, UeSecurityCapabilities};
use nextgcore_mme_sessiond::event::{
    BearerContextCreated, BearerToCreate, ConnEstCnfData, CreateBearerRequestData,
    CreateSessionResponseData, EmmCnPrimitive, ERabSetupItem, ModifyBearerResponseData, NasEvent,
    PathSwitchRequestData, S11Event, S1apEvent,
};
use nextgcore_mme_sessiond::s11_build::{GtpCause, S11Message};
use nextgcore_mme_sessiond::s1ap_build::{PagingDomain, S1apMessage};
use nextgcore_mme_sessiond::{lock_ue, MmeEvent, MmeTimerId, UeKey, UeRepository};

#[test]
fn test_create_bearer_partially_accepted() {
    let h = Harness::default();
    let ue_id = established_session(&h, Some(enb_key(11)));

    let template = BearerToCreate {
        ebi: 0,
        qos: Qos {
            qci: 1,
            ..Default::default()
        },
        sgw_s1u: sgw_s1u(),
        pgw_s5u: None,
        tft: Some(Bytes::from_static(&[0x21, 0x10])),
        pco: None,
    };
    h.sm.handle(MmeEvent::S11(S11Event::CreateBearerRequest(CreateBearerRequestData {
        teid: MME_TEID,
        sequence: 0x77,
        sgw_teid: SGW_TEID,
        linked_ebi: 5,
        bearers: vec![template.clone(), template.clone(), template],
    })))
    .unwrap();

    let requested: Vec<u8> = h
        .dispatch
        .emm_cn()
        .iter()
        .filter_map(|p| match p {
            EmmCnPrimitive::ActivateDedicatedBearerReq { ebi, linked_ebi: 5, .. } => Some(*ebi),
            _ => None,
        })
        .collect();
    assert_eq!(requested, vec![6, 7, 8]);

    h.sm.handle(MmeEvent::Nas(NasEvent::ActivateDedicatedBearerRsp { ue_id, ebi: 6 }))
        .unwrap();
    h.sm.handle(MmeEvent::Nas(NasEvent::ActivateDedicatedBearerRej { ue_id, ebi: 8 }))
        .unwrap();
    assert!(h.dispatch.s11().is_empty());
    h.with_ue(ue_id, |ue| {
        let proc = ue.create_bearer_proc.as_ref().unwrap();
        assert_eq!(proc.num_status_received(), 2);
    });

    h.sm.handle(MmeEvent::Nas(NasEvent::ActivateDedicatedBearerRsp { ue_id, ebi: 7 }))
        .unwrap();

    let s11 = h.dispatch.s11();
    assert_eq!(s11.len(), 1);
    match &s11[0] {
        S11Message::CreateBearerResponse(rsp) => {
            assert_eq!(rsp.teid, SGW_TEID);
            assert_eq!(rsp.sequence, 0x77);
            assert_eq!(rsp.cause, GtpCause::RequestAcceptedPartially);
            let accepted = rsp
                .bearers
                .iter()
                .filter(|b| b.cause == GtpCause::RequestAccepted)
                .count();
            let rejected = rsp
                .bearers
                .iter()
                .filter(|b| b.cause != GtpCause::RequestAccepted)
                .count();
            assert_eq!((accepted, rejected), (2, 1));
        }
        other => panic!("unexpected {:?}", other),
    }

    h.with_ue(ue_id, |ue| {
        assert!(ue.create_bearer_proc.is_none());
        assert!(ue.bearer(ebi(6)).is_ok());
        assert!(ue.bearer(ebi(7)).is_ok());
        assert!(ue.bearer(ebi(8)).is_err());
        ue.check_linkage().unwrap();
    });
}

#[test]
fn test_create_session_rejected_keeps_context() {
    let h = Harness::default();
    let ue_id = pending_session(&h);

    h.sm.handle(MmeEvent::S11(S11Event::CreateSessionResponse(CreateSessionResponseData {
        teid: MME_TEID,
        cause: GtpCause::NoResourcesAvailable,
        bearers: vec![BearerContextCreated {
            ebi: 5,
            cause: GtpCause::NoResourcesAvailable,
            sgw_s1u: None,
            pgw_s5u: None,
            qos: None,
        }],
        ..Default::default()
    })))
    .unwrap();

    assert_eq!(
        h.dispatch.emm_cn(),
        vec![EmmCnPrimitive::PdnConnectivityFail {
            ue_id,
            pti: 3,
            cause: GtpCause::NoResourcesAvailable,
        }]
    );
    assert!(h.repo.find(&UeKey::MmeUeS1apId(ue_id)).is_some());
    assert!(h.repo.find(&UeKey::S11Teid(MME_TEID)).is_some());
}

#[test]
fn test_paging_arms_guard_once() {
    let h = Harness::default();
    let ue_id = established_session(&h, None);
    h.with_ue(ue_id, |ue| {
        ue.mm_state = MmState::Registered;
        ue.emm.guti = Some(EpsGuti {
            m_tmsi: 0xc0ffee,
            ..Default::default()
        });
    });

    let handle = h.repo.get(&UeKey::MmeUeS1apId(ue_id)).unwrap();
    {
        let mut ue = lock_ue(&handle).unwrap();
        let manager = h.sm.manager();
        manager
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)
            .unwrap();
        let first = h.timers.active_handle(ue_id, MmeTimerId::Paging).unwrap();

        manager
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true)
            .unwrap();
        assert_eq!(h.timers.active_handle(ue_id, MmeTimerId::Paging), Some(first));
        assert_eq!(h.timers.arm_count(MmeTimerId::Paging), 1);
    }
    assert_eq!(h.dispatch.s1ap().len(), 2);

    {
        let mut ue = lock_ue(&handle).unwrap();
        ue.ecm_state = EcmState::Connected;
        let result = h
            .sm
            .manager()
            .paging(&mut ue, PagingTarget::STmsi, PagingDomain::Ps, true);
        assert!(result.is_err());
    }
    assert_eq!(h.dispatch.s1ap().len(), 2);
}

#[test]
fn test_initial_context_setup_expiry_unregistered_detaches() {
    let h = Harness::default();
    let ue_id = established_session(&h, Some(enb_key(21)));

    h.sm.handle(MmeEvent::Nas(NasEvent::ConnectionEstablishmentConfirm(ConnEstCnfData {
        ue_id,
        nas_pdu: Some(Bytes::from_static(&[0x07, 0x42])),
        security_capabilities: UeSecurityCapabilities::default(),
        kasme: [0x11; 32],
        kenb: [0x22; 32],
        ..Default::default()
    })))
    .unwrap();
    assert!(matches!(
        h.dispatch.s1ap()[0],
        S1apMessage::InitialContextSetupRequest(_)
    ));

    let handle = h
        .timers
        .active_handle(ue_id, MmeTimerId::InitialContextSetupRsp)
        .unwrap();
    let expiry = h.timers.expire(handle).unwrap();
    h.dispatch.drain();
    h.sm.handle(MmeEvent::Timer(expiry)).unwrap();

    assert_eq!(
        h.dispatch.emm_cn(),
        vec![EmmCnPrimitive::ImplicitDetachUe { ue_id }]
    );
    assert!(h.dispatch.s11().is_empty());
    assert!(h.dispatch.s1ap().is_empty());

    // Delivered again after the slot was cleared
    h.sm.handle(MmeEvent::Timer(expiry)).unwrap();
    assert_eq!(h.dispatch.len(), 1);
}

fn path_switch(h: &Harness, ue_id: u32) {
    h.sm.handle(MmeEvent::S1ap(S1apEvent::PathSwitchRequest(PathSwitchRequestData {
        mme_ue_s1ap_id: ue_id,
        enb_key: enb_key(99),
        e_rabs: vec![ERabSetupItem {
            ebi: 5,
            enb_s1u: enb_s1u(0x500),
        }],
        security_capabilities: UeSecurityCapabilities::default(),
        tai: Default::default(),
        ecgi: Default::default(),
    })))
    .unwrap();
}

#[test]
fn test_path_switch_without_modified_bearer_fails() {
    let h = Harness::default();
    let ue_id = established_session(&h, Some(enb_key(31)));
    path_switch(&h, ue_id);

    assert!(matches!(
        h.dispatch.s11()[0],
        S11Message::ModifyBearerRequest(_)
    ));
    assert!(h.repo.find(&UeKey::Enb(enb_key(99))).is_some());
    assert!(h.repo.find(&UeKey::Enb(enb_key(31))).is_none());

    h.sm.handle(MmeEvent::S11(S11Event::ModifyBearerResponse(ModifyBearerResponseData {
        teid: MME_TEID,
        cause: GtpCause::RequestAccepted,
        bearers_modified: Vec::new(),
        bearers_removed: Vec::new(),
    })))
    .unwrap();

    let s1ap = h.dispatch.s1ap();
    assert_eq!(s1ap.len(), 1);
    assert!(matches!(
        s1ap[0],
        S1apMessage::PathSwitchRequestFailure {
            mme_ue_s1ap_id,
            enb_ue_s1ap_id: 99,
            ..
        } if mme_ue_s1ap_id == ue_id
    ));
}

#[test]
fn test_path_switch_acknowledged() {
    let h = Harness::default();
    let ue_id = established_session(&h, Some(enb_key(41)));
    path_switch(&h, ue_id);

    h.sm.handle(MmeEvent::S11(S11Event::ModifyBearerResponse(ModifyBearerResponseData {
        teid: MME_TEID,
        cause: GtpCause::RequestAccepted,
        bearers_modified: vec![5],
        bearers_removed: Vec::new(),
    })))
    .unwrap();

    assert!(matches!(
        h.dispatch.s1ap()[0],
        S1apMessage::PathSwitchRequestAcknowledge { ncc: 0, .. }
    ));
    h.with_ue(ue_id, |ue| {
        assert_eq!(ue.security.ncc, 1);
        assert!(ue.path_switch.is_none());
        assert_eq!(ue.bearer(ebi(5)).unwrap().state().enb_s1u(), Some(&enb_s1u(0x500)));
    });
}
