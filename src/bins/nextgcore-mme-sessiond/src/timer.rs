//! MME Session Timers
//!
//! Per-subscriber guard timers. Every armed timer gets a fresh handle; the
//! subscriber context remembers the handle it armed, so an expiry that
//! carries any other handle is stale and is ignored by the handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::MmeUeS1apId;
use crate::event::MmeEvent;

// ============================================================================
// Timer IDs
// ============================================================================

/// MME session timer identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmeTimerId {
    /// Waiting for the initial context setup response from the eNB
    InitialContextSetupRsp,
    /// T3413 - paging response
    Paging,
    /// Mobile reachability timer, runs while the UE is idle
    MobileReachability,
    /// Implicit detach timer, started when mobile reachability expires
    ImplicitDetach,
    /// Waiting for the update location answer from the HSS
    UlrResponse,
    /// Waiting for the UE context modification response from the eNB
    UeContextModification,
}

impl MmeTimerId {
    /// Get timer name
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialContextSetupRsp => "MME_TIMER_INITIAL_CONTEXT_SETUP_RSP",
            Self::Paging => "MME_TIMER_PAGING",
            Self::MobileReachability => "MME_TIMER_MOBILE_REACHABILITY",
            Self::ImplicitDetach => "MME_TIMER_IMPLICIT_DETACH",
            Self::UlrResponse => "MME_TIMER_ULR_RESPONSE",
            Self::UeContextModification => "MME_TIMER_UE_CONTEXT_MODIFICATION",
        }
    }

    /// Check if this timer guards an S1AP exchange
    pub fn is_s1ap_timer(&self) -> bool {
        matches!(
            self,
            Self::InitialContextSetupRsp | Self::Paging | Self::UeContextModification
        )
    }
}

impl fmt::Display for MmeTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Timer Configuration
// ============================================================================

/// Timer durations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmeTimerConfigs {
    pub initial_context_setup_rsp: Duration,
    pub paging_response: Duration,
    pub mobile_reachability: Duration,
    pub implicit_detach: Duration,
    pub ulr_response: Duration,
    pub ue_context_modification: Duration,
}

impl Default for MmeTimerConfigs {
    fn default() -> Self {
        Self {
            initial_context_setup_rsp: Duration::from_secs(2),
            // T3413
            paging_response: Duration::from_secs(4),
            // T3412 plus 4 minutes, 54 minutes by default
            mobile_reachability: Duration::from_secs(54 * 60),
            implicit_detach: Duration::from_secs(54 * 60),
            ulr_response: Duration::from_secs(5),
            ue_context_modification: Duration::from_secs(2),
        }
    }
}

impl MmeTimerConfigs {
    /// Get timer duration by ID
    pub fn get(&self, timer_id: MmeTimerId) -> Duration {
        match timer_id {
            MmeTimerId::InitialContextSetupRsp => self.initial_context_setup_rsp,
            MmeTimerId::Paging => self.paging_response,
            MmeTimerId::MobileReachability => self.mobile_reachability,
            MmeTimerId::ImplicitDetach => self.implicit_detach,
            MmeTimerId::UlrResponse => self.ulr_response,
            MmeTimerId::UeContextModification => self.ue_context_modification,
        }
    }
}

// ============================================================================
// Timer Handles
// ============================================================================

/// Identity of one armed timer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Timer slot kept in the subscriber context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerSlot {
    #[default]
    Inactive,
    Active(TimerHandle),
}

impl TimerSlot {
    pub fn is_active(&self) -> bool {
        matches!(self, TimerSlot::Active(_))
    }

    pub fn handle(&self) -> Option<TimerHandle> {
        match self {
            TimerSlot::Active(handle) => Some(*handle),
            TimerSlot::Inactive => None,
        }
    }

    /// True if `handle` is the one currently armed in this slot
    pub fn matches(&self, handle: TimerHandle) -> bool {
        self.handle() == Some(handle)
    }
}

/// Timer expiry notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub ue_id: MmeUeS1apId,
    pub timer_id: MmeTimerId,
    pub handle: TimerHandle,
}

// ============================================================================
// Timer Service
// ============================================================================

/// Arms and cancels per-subscriber timers
pub trait TimerService: Send + Sync {
    /// Arm a timer; the expiry is delivered as a `TimerExpiry` carrying the returned handle
    fn arm(&self, ue_id: MmeUeS1apId, timer_id: MmeTimerId, duration: Duration) -> TimerHandle;

    /// Cancel a previously armed timer. Cancelling an expired or unknown handle is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

// ============================================================================
// Timer Manager
// ============================================================================

/// Timer instance for tracking armed timers
#[derive(Debug, Clone)]
pub struct TimerInstance {
    pub handle: TimerHandle,
    pub timer_id: MmeTimerId,
    pub ue_id: MmeUeS1apId,
    pub duration: Duration,
}

/// Recording timer service. Nothing fires on its own; callers drive expiry.
#[derive(Debug, Default)]
pub struct TimerManager {
    next_handle: AtomicU64,
    active_timers: Mutex<Vec<TimerInstance>>,
    armed_total: Mutex<Vec<TimerInstance>>,
}

impl TimerManager {
    /// Create a new timer manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Get active timer count
    pub fn active_timer_count(&self) -> usize {
        self.active().len()
    }

    /// Handle of the active timer `timer_id` for `ue_id`
    pub fn active_handle(&self, ue_id: MmeUeS1apId, timer_id: MmeTimerId) -> Option<TimerHandle> {
        self.active()
            .iter()
            .find(|t| t.ue_id == ue_id && t.timer_id == timer_id)
            .map(|t| t.handle)
    }

    pub fn is_armed(&self, ue_id: MmeUeS1apId, timer_id: MmeTimerId) -> bool {
        self.active_handle(ue_id, timer_id).is_some()
    }

    /// Number of times `timer_id` was armed since creation
    pub fn arm_count(&self, timer_id: MmeTimerId) -> usize {
        self.armed_total
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.timer_id == timer_id)
            .count()
    }

    /// Mark the timer as fired and build its expiry event
    pub fn expire(&self, handle: TimerHandle) -> Option<TimerExpiry> {
        let mut active = self.active();
        let pos = active.iter().position(|t| t.handle == handle)?;
        let timer = active.remove(pos);
        log::debug!("Timer {} {} expired for UE {}", timer.timer_id.name(), handle, timer.ue_id);
        Some(TimerExpiry {
            ue_id: timer.ue_id,
            timer_id: timer.timer_id,
            handle,
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Vec<TimerInstance>> {
        self.active_timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TimerService for TimerManager {
    fn arm(&self, ue_id: MmeUeS1apId, timer_id: MmeTimerId, duration: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let timer = TimerInstance {
            handle,
            timer_id,
            ue_id,
            duration,
        };
        self.active().push(timer.clone());
        self.armed_total
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(timer);
        log::debug!(
            "Started timer {} {} for UE {} (duration: {:?})",
            timer_id.name(),
            handle,
            ue_id,
            duration
        );
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.active().retain(|t| t.handle != handle);
        log::debug!("Stopped timer {}", handle);
    }
}

// ============================================================================
// Tokio Timer Service
// ============================================================================

/// Timer service backed by tokio sleeps posting expiries to the event channel
pub struct TokioTimerService {
    next_handle: AtomicU64,
    runtime: tokio::runtime::Handle,
    tx: mpsc::Sender<MmeEvent>,
    tasks: Arc<Mutex<HashMap<TimerHandle, JoinHandle<()>>>>,
}

impl TokioTimerService {
    pub fn new(runtime: tokio::runtime::Handle, tx: mpsc::Sender<MmeEvent>) -> Self {
        Self {
            next_handle: AtomicU64::new(0),
            runtime,
            tx,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl TimerService for TokioTimerService {
    fn arm(&self, ue_id: MmeUeS1apId, timer_id: MmeTimerId, duration: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let tx = self.tx.clone();
        let tasks = Arc::clone(&self.tasks);

        // Hold the map lock across spawn so the task cannot remove itself first
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle);
            let expiry = TimerExpiry {
                ue_id,
                timer_id,
                handle,
            };
            if tx.send(MmeEvent::Timer(expiry)).await.is_err() {
                log::warn!("Event channel closed, dropping {} expiry", timer_id.name());
            }
        });
        guard.insert(handle, task);
        log::debug!(
            "Started timer {} {} for UE {} (duration: {:?})",
            timer_id.name(),
            handle,
            ue_id,
            duration
        );
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)
        {
            task.abort();
            log::debug!("Stopped timer {}", handle);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
