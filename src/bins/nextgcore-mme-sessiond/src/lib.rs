//! NextGCore MME Session Core
//!
//! Session and bearer lifecycle management for the EPC MME, together with
//! the EMM-CN coordinator that bridges mobility-management outcomes into
//! session establishment. Wire codecs and transports live in the peer paths;
//! this crate consumes decoded events and emits typed outbound messages.

pub mod error;
pub mod config;
pub mod context;
pub mod repository;
pub mod timer;
pub mod event;
pub mod dispatch;
pub mod s11_build;
pub mod s1ap_build;
pub mod sgsap_build;
pub mod esm_build;
pub mod emm_build;
pub mod procedure;
pub mod barrier;
pub mod nas_security;
pub mod bearer_manager;
pub mod s11_handler;
pub mod s1ap_handler;
pub mod nas_handler;
pub mod csfb_handler;
pub mod timer_handler;
pub mod emm_cn;
pub mod sm;

#[cfg(test)]
mod property_tests;

// Re-export commonly used types
pub use error::{Lookup, MmeError, MmeResult, Peer};
pub use config::{MmeConfig, NonEpsServiceControl};
pub use context::{
    BearerContext, BearerState, Ebi, PdnCid, PdnContext, UeContext,
};
pub use repository::{lock_ue, InMemoryUeRepository, UeHandle, UeKey, UeKeys, UeRepository};
pub use timer::{
    MmeTimerId, TimerExpiry, TimerHandle, TimerManager, TimerService, TokioTimerService,
};
pub use event::MmeEvent;
pub use dispatch::{ChannelDispatch, Dispatch, DispatchQueue, OutboundMessage};
pub use barrier::{Barrier, BarrierOutcome};
pub use bearer_manager::{BearerManager, PagingTarget};
pub use emm_cn::{DefaultAuthInfoNotify, EmmCnCoordinator};
pub use sm::MmeSm;
