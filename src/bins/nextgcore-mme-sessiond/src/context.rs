//! MME Session Context
//!
//! Subscriber, PDN and bearer contexts. A subscriber owns fixed-size arenas of
//! PDN and bearer slots; every mutation that touches the PDN/bearer linkage goes
//! through `UeContext` so a bearer always points at a live PDN that lists it.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;

use crate::barrier::Barrier;
use crate::emm_build::{EmmCause, EmmProcRequest};
use crate::error::{Lookup, MmeError, MmeResult};
use crate::esm_build::PdnType;
use crate::procedure::{CreateBearerProcedure, DeleteBearerQueue};
use crate::s1ap_build::S1apReleaseCause;
use crate::sgsap_build::ServiceIndicator;
use crate::timer::TimerSlot;

// ============================================================================
// Identifiers and Constants
// ============================================================================

/// MME UE S1AP ID, the subscriber session id
pub type MmeUeS1apId = u32;
/// eNB UE S1AP ID
pub type EnbUeS1apId = u32;
/// SCTP association of the serving eNB
pub type SctpAssocId = u32;
/// GTP tunnel endpoint identifier
pub type Teid = u32;
/// IMSI packed as a decimal number
pub type Imsi64 = u64;
/// Procedure transaction identity
pub type Pti = u8;

/// First valid EPS bearer identity
pub const MIN_EPS_BEARER_ID: u8 = 5;
/// Last valid EPS bearer identity
pub const MAX_EPS_BEARER_ID: u8 = 15;
/// Bearer slots per subscriber
pub const BEARERS_PER_UE: usize = (MAX_EPS_BEARER_ID - MIN_EPS_BEARER_ID + 1) as usize;
/// PDN slots per subscriber
pub const MAX_NUM_OF_SESS: usize = 4;
/// EBI value meaning "not assigned yet"
pub const EBI_UNASSIGNED: u8 = 0;

/// EPS bearer identity, always within 5..=15
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ebi(u8);

impl Ebi {
    pub fn new(value: u8) -> Option<Self> {
        if (MIN_EPS_BEARER_ID..=MAX_EPS_BEARER_ID).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 - MIN_EPS_BEARER_ID) as usize
    }

    fn from_index(index: usize) -> Self {
        Self(MIN_EPS_BEARER_ID + index as u8)
    }
}

impl fmt::Display for Ebi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PDN context slot id, always below `MAX_NUM_OF_SESS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdnCid(usize);

impl PdnCid {
    pub fn new(value: usize) -> Option<Self> {
        if value < MAX_NUM_OF_SESS {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for PdnCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Network Identities
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    /// MCC digit 1
    pub mcc1: u8,
    /// MCC digit 2
    pub mcc2: u8,
    /// MCC digit 3
    pub mcc3: u8,
    /// MNC digit 1
    pub mnc1: u8,
    /// MNC digit 2
    pub mnc2: u8,
    /// MNC digit 3 (0xf if 2-digit MNC)
    pub mnc3: u8,
}

impl PlmnId {
    /// Create a new PLMN ID from decimal strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc: Vec<u8> = mcc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();
        let mnc: Vec<u8> = mnc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();

        Self {
            mcc1: mcc.first().copied().unwrap_or(0),
            mcc2: mcc.get(1).copied().unwrap_or(0),
            mcc3: mcc.get(2).copied().unwrap_or(0),
            mnc1: mnc.first().copied().unwrap_or(0),
            mnc2: mnc.get(1).copied().unwrap_or(0),
            mnc3: mnc.get(2).copied().unwrap_or(0xf),
        }
    }

    /// Encode as the 3-octet TBCD form used on the wire
    pub fn encode(&self) -> [u8; 3] {
        [
            (self.mcc2 << 4) | self.mcc1,
            (self.mnc3 << 4) | self.mcc3,
            (self.mnc2 << 4) | self.mnc1,
        ]
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.mcc1, self.mcc2, self.mcc3)?;
        write!(f, "{}{}", self.mnc1, self.mnc2)?;
        if self.mnc3 != 0xf {
            write!(f, "{}", self.mnc3)?;
        }
        Ok(())
    }
}

/// EPS TAI (Tracking Area Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpsTai {
    pub plmn_id: PlmnId,
    pub tac: u16,
}

/// E-CGI (E-UTRAN Cell Global Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ECgi {
    pub plmn_id: PlmnId,
    /// E-UTRAN Cell ID (28 bits)
    pub cell_id: u32,
}

/// LAI (Location Area Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lai {
    pub plmn_id: PlmnId,
    pub lac: u16,
}

/// GUMMEI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gummei {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
}

/// EPS GUTI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
    pub m_tmsi: u32,
}

impl EpsGuti {
    /// Build a GUTI from the serving GUMMEI and an S-TMSI
    pub fn from_s_tmsi(gummei: &Gummei, s_tmsi: &STmsi) -> Self {
        Self {
            plmn_id: gummei.plmn_id,
            mme_gid: gummei.mme_gid,
            mme_code: s_tmsi.mme_code,
            m_tmsi: s_tmsi.m_tmsi,
        }
    }
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04x}-{:02x}-{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

/// S-TMSI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct STmsi {
    pub mme_code: u8,
    pub m_tmsi: u32,
}

/// Radio-side key of a subscriber: the serving association and the eNB's id for the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnbUeKey {
    pub sctp_assoc_id: SctpAssocId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
}

// ============================================================================
// Tunnels and QoS
// ============================================================================

/// IP address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpAddr {
    /// IPv4 address
    pub ipv4: Option<[u8; 4]>,
    /// IPv6 address
    pub ipv6: Option<[u8; 16]>,
}

impl IpAddr {
    pub fn v4(addr: [u8; 4]) -> Self {
        Self {
            ipv4: Some(addr),
            ipv6: None,
        }
    }

    /// Parse the transport-layer address form: 4, 16 or 20 octets
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        match raw.len() {
            4 => Some(Self {
                ipv4: raw.try_into().ok(),
                ipv6: None,
            }),
            16 => Some(Self {
                ipv4: None,
                ipv6: raw.try_into().ok(),
            }),
            20 => Some(Self {
                ipv4: raw[..4].try_into().ok(),
                ipv6: raw[4..].try_into().ok(),
            }),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Fully qualified tunnel endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fteid {
    pub teid: Teid,
    pub addr: IpAddr,
}

impl Fteid {
    pub fn new(teid: Teid, addr: IpAddr) -> Self {
        Self { teid, addr }
    }
}

/// Bitrate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitrate {
    /// Downlink bitrate (bps)
    pub downlink: u64,
    /// Uplink bitrate (bps)
    pub uplink: u64,
}

/// ARP (Allocation and Retention Priority)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arp {
    /// Priority level (1-15)
    pub priority_level: u8,
    /// Pre-emption capability
    pub pre_emption_capability: u8,
    /// Pre-emption vulnerability
    pub pre_emption_vulnerability: u8,
}

/// Bearer level QoS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qos {
    /// QCI (QoS Class Identifier)
    pub qci: u8,
    pub arp: Arp,
    /// MBR (Maximum Bit Rate)
    pub mbr: Bitrate,
    /// GBR (Guaranteed Bit Rate)
    pub gbr: Bitrate,
}

/// PAA (PDN Address Allocation)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paa {
    pub pdn_type: PdnType,
    /// IPv4 address
    pub addr: [u8; 4],
    /// IPv6 address
    pub addr6: [u8; 16],
}

// ============================================================================
// Bearer State
// ============================================================================

/// Creation progress of a bearer. Tunnel endpoints live inside the variant
/// that makes them meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BearerState {
    #[default]
    Uncreated,
    /// Allocated locally, gateway not asked yet or not answered
    MmeCreated,
    /// Gateway side tunnel known
    SgwCreated {
        sgw_s1u: Fteid,
        pgw_s5u: Option<Fteid>,
    },
    /// Radio side tunnel known as well
    EnbCreated {
        sgw_s1u: Fteid,
        pgw_s5u: Option<Fteid>,
        enb_s1u: Fteid,
    },
}

impl BearerState {
    pub fn name(&self) -> &'static str {
        match self {
            BearerState::Uncreated => "UNCREATED",
            BearerState::MmeCreated => "MME_CREATED",
            BearerState::SgwCreated { .. } => "SGW_CREATED",
            BearerState::EnbCreated { .. } => "ENB_CREATED",
        }
    }

    /// Position in the creation order
    pub fn rank(&self) -> u8 {
        match self {
            BearerState::Uncreated => 0,
            BearerState::MmeCreated => 1,
            BearerState::SgwCreated { .. } => 2,
            BearerState::EnbCreated { .. } => 3,
        }
    }

    pub fn is_sgw_created(&self) -> bool {
        self.rank() >= 2
    }

    pub fn is_enb_created(&self) -> bool {
        self.rank() >= 3
    }

    pub fn sgw_s1u(&self) -> Option<&Fteid> {
        match self {
            BearerState::SgwCreated { sgw_s1u, .. } | BearerState::EnbCreated { sgw_s1u, .. } => {
                Some(sgw_s1u)
            }
            _ => None,
        }
    }

    pub fn pgw_s5u(&self) -> Option<&Fteid> {
        match self {
            BearerState::SgwCreated { pgw_s5u, .. } | BearerState::EnbCreated { pgw_s5u, .. } => {
                pgw_s5u.as_ref()
            }
            _ => None,
        }
    }

    pub fn enb_s1u(&self) -> Option<&Fteid> {
        match self {
            BearerState::EnbCreated { enb_s1u, .. } => Some(enb_s1u),
            _ => None,
        }
    }
}

impl fmt::Display for BearerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Bearer Context
// ============================================================================

/// EPS bearer context
#[derive(Debug, Clone)]
pub struct BearerContext {
    pub ebi: Ebi,
    /// Owning PDN slot
    pub pdn_cid: PdnCid,
    state: BearerState,
    pub qos: Qos,
    /// Traffic flow template as received from the gateway
    pub tft: Option<Bytes>,
    pub pco: Option<Bytes>,
    /// PTI of the mobility-layer request this bearer answers
    pub transaction_id: Pti,
    /// QoS waiting to be pushed to the radio side
    pub saved_qos: Option<Qos>,
    /// TFT waiting to be pushed to the radio side
    pub saved_tft: Option<Bytes>,
}

impl BearerContext {
    fn new(ebi: Ebi, pdn_cid: PdnCid, qos: Qos) -> Self {
        Self {
            ebi,
            pdn_cid,
            state: BearerState::Uncreated,
            qos,
            tft: None,
            pco: None,
            transaction_id: 0,
            saved_qos: None,
            saved_tft: None,
        }
    }

    pub fn state(&self) -> &BearerState {
        &self.state
    }

    fn illegal(&self, event: &'static str) -> MmeError {
        MmeError::IllegalBearerTransition {
            ebi: self.ebi.value(),
            from: self.state.name(),
            event,
        }
    }

    fn set_state(&mut self, next: BearerState) {
        log::debug!("bearer ebi={} {} -> {}", self.ebi, self.state, next);
        self.state = next;
    }

    /// Uncreated -> MmeCreated
    pub fn mark_mme_created(&mut self) -> MmeResult<()> {
        match self.state {
            BearerState::Uncreated => {
                self.set_state(BearerState::MmeCreated);
                Ok(())
            }
            BearerState::MmeCreated => Ok(()),
            _ => Err(self.illegal("mme_created")),
        }
    }

    /// Gateway accepted the bearer. Not allowed once the radio side exists.
    pub fn mark_sgw_created(&mut self, sgw_s1u: Fteid, pgw_s5u: Option<Fteid>) -> MmeResult<()> {
        match self.state {
            BearerState::Uncreated | BearerState::MmeCreated | BearerState::SgwCreated { .. } => {
                self.set_state(BearerState::SgwCreated { sgw_s1u, pgw_s5u });
                Ok(())
            }
            BearerState::EnbCreated { .. } => Err(self.illegal("sgw_created")),
        }
    }

    /// Radio peer reported its tunnel endpoint
    pub fn mark_enb_created(&mut self, enb_s1u: Fteid) -> MmeResult<()> {
        match self.state {
            BearerState::SgwCreated { sgw_s1u, pgw_s5u }
            | BearerState::EnbCreated {
                sgw_s1u, pgw_s5u, ..
            } => {
                self.set_state(BearerState::EnbCreated {
                    sgw_s1u,
                    pgw_s5u,
                    enb_s1u,
                });
                Ok(())
            }
            _ => Err(self.illegal("enb_created")),
        }
    }

    /// Drop the radio side, keep the gateway side
    pub fn release_enb(&mut self) {
        if let BearerState::EnbCreated {
            sgw_s1u, pgw_s5u, ..
        } = self.state
        {
            self.set_state(BearerState::SgwCreated { sgw_s1u, pgw_s5u });
        }
    }

    pub fn reset(&mut self) {
        if self.state != BearerState::Uncreated {
            self.set_state(BearerState::Uncreated);
        }
    }
}

// ============================================================================
// PDN Context
// ============================================================================

/// PDN connection context
#[derive(Debug, Clone, Default)]
pub struct PdnContext {
    /// Subscription context identifier this PDN was built from
    pub context_identifier: u32,
    /// APN in use
    pub apn_in_use: String,
    pub pdn_type: PdnType,
    pub paa: Option<Paa>,
    /// Default bearer, set together with the first bearer of the PDN
    default_ebi: Option<Ebi>,
    /// Gateway S11 control tunnel
    pub s_gw_teid_s11_s4: Teid,
    pub s_gw_address_s11_s4: IpAddr,
    pub subscribed_apn_ambr: Bitrate,
    pub pco: Option<Bytes>,
    bearers: BTreeSet<Ebi>,
}

impl PdnContext {
    pub fn new(context_identifier: u32, apn: impl Into<String>, pdn_type: PdnType) -> Self {
        Self {
            context_identifier,
            apn_in_use: apn.into(),
            pdn_type,
            ..Default::default()
        }
    }

    pub fn default_ebi(&self) -> Option<Ebi> {
        self.default_ebi
    }

    /// Bearers owned by this PDN in EBI order
    pub fn bearers(&self) -> impl Iterator<Item = Ebi> + '_ {
        self.bearers.iter().copied()
    }

    pub fn owns(&self, ebi: Ebi) -> bool {
        self.bearers.contains(&ebi)
    }

    pub fn has_gateway_tunnel(&self) -> bool {
        self.s_gw_teid_s11_s4 != 0
    }
}

// ============================================================================
// Arenas
// ============================================================================

/// Fixed bearer arena indexed by EBI
#[derive(Debug, Clone, Default)]
pub struct BearerTable {
    slots: [Option<BearerContext>; BEARERS_PER_UE],
}

impl BearerTable {
    pub fn get(&self, ebi: Ebi) -> Option<&BearerContext> {
        self.slots[ebi.index()].as_ref()
    }

    fn get_mut(&mut self, ebi: Ebi) -> Option<&mut BearerContext> {
        self.slots[ebi.index()].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BearerContext> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_free(&self) -> Option<Ebi> {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .map(Ebi::from_index)
    }

    pub fn free_count(&self) -> usize {
        BEARERS_PER_UE - self.len()
    }
}

/// Fixed PDN arena
#[derive(Debug, Clone, Default)]
pub struct PdnTable {
    slots: [Option<PdnContext>; MAX_NUM_OF_SESS],
}

impl PdnTable {
    pub fn get(&self, cid: PdnCid) -> Option<&PdnContext> {
        self.slots[cid.value()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PdnCid, &PdnContext)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|pdn| (PdnCid(i), pdn)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_free(&self) -> Option<PdnCid> {
        self.slots.iter().position(|slot| slot.is_none()).map(PdnCid)
    }
}

// ============================================================================
// Mobility States
// ============================================================================

/// ECM state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcmState {
    #[default]
    Idle,
    Connected,
}

/// MM registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MmState {
    #[default]
    Unregistered,
    Registered,
}

/// Whether the subscriber passed authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImsiAuth {
    #[default]
    NotAuthenticated,
    Authenticated,
}

/// UE security capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeSecurityCapabilities {
    /// EEA bitmap (16 bits)
    pub encryption_algorithms: u16,
    /// EIA bitmap (16 bits)
    pub integrity_algorithms: u16,
}

/// Security context
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub kasme: [u8; 32],
    pub kenb: [u8; 32],
    /// Next hop for the next handover
    pub nh: [u8; 32],
    /// Next hop chaining count (3 bits)
    pub ncc: u8,
    pub capabilities: UeSecurityCapabilities,
}

// ============================================================================
// CSFB
// ============================================================================

/// CS fallback service requested by or for the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsfbServiceType {
    #[default]
    None,
    MoCall,
    MtCall,
    MtSms,
    MtCallOrSmsWithoutLai,
}

/// SGs association state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SgsState {
    #[default]
    Null,
    LaUpdateRequested,
    Associated,
}

/// CS fallback sub-context
#[derive(Debug, Clone, Default)]
pub struct SgsContext {
    pub csfb_service_type: CsfbServiceType,
    /// Service indicator of the last SGs paging
    pub service_indicator: ServiceIndicator,
    pub is_emergency_call: bool,
    /// MT call was cancelled by the MSC before the UE answered
    pub call_cancelled: bool,
    pub mt_call_in_progress: bool,
    /// EPS detach indication guard is running
    pub ts9_running: bool,
    pub state: SgsState,
}

impl SgsContext {
    pub fn reset_csfb(&mut self) {
        self.csfb_service_type = CsfbServiceType::None;
    }
}

// ============================================================================
// EMM Context
// ============================================================================

/// EMM state as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmmFsmState {
    #[default]
    Deregistered,
    CommonProcedureInitiated,
    Registered,
    DeregisteredInitiated,
}

/// EPS attach type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AttachType {
    #[default]
    Eps = 1,
    CombinedEpsImsi = 2,
    Emergency = 6,
}

/// EPS update type of a tracking area update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsUpdateType {
    #[default]
    TaUpdating = 0,
    CombinedTaLaUpdating = 1,
    CombinedTaLaUpdatingWithImsiAttach = 2,
    PeriodicUpdating = 3,
}

/// Subscription network access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkAccessMode {
    #[default]
    PacketAndCircuit,
    PacketOnly,
}

/// Additional update result of a combined registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AdditionalUpdateResult {
    #[default]
    NoAdditionalInformation = 0,
    CsFallbackNotPreferred = 1,
    SmsOnly = 2,
}

/// Mobile identity returned by the circuit domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileIdentity {
    Imsi(Imsi64),
    /// TMSI in network byte order
    Tmsi([u8; 4]),
}

/// Outcome of the last circuit-domain location update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationUpdateStatus {
    Success,
    Failure,
}

/// Preconditions gating an attach or TAU accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcceptPrecondition {
    PdnConnectivity,
    CsDomainLocationUpdate,
}

/// Pending attach procedure
#[derive(Debug, Clone)]
pub struct AttachProcedure {
    pub attach_type: AttachType,
    /// ESM message piggybacked on the accept
    pub esm_msg_out: Option<Bytes>,
    pub accept: Barrier<AcceptPrecondition>,
}

/// Pending tracking area update procedure
#[derive(Debug, Clone)]
pub struct TauProcedure {
    pub update_type: EpsUpdateType,
    pub accept: Barrier<AcceptPrecondition>,
}

impl AttachProcedure {
    /// The accept always waits for PDN connectivity; the circuit domain is added on demand
    pub fn new(attach_type: AttachType) -> Self {
        Self {
            attach_type,
            esm_msg_out: None,
            accept: Barrier::new([AcceptPrecondition::PdnConnectivity]),
        }
    }
}

impl TauProcedure {
    pub fn new(update_type: EpsUpdateType, combined: bool) -> Self {
        let required = combined.then_some(AcceptPrecondition::CsDomainLocationUpdate);
        Self {
            update_type,
            accept: Barrier::new(required),
        }
    }
}

/// E-UTRAN authentication vector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthVector {
    pub rand: [u8; 16],
    pub autn: [u8; 16],
    pub xres: Vec<u8>,
    pub kasme: [u8; 32],
}

/// Callbacks of an authentication-info sub-procedure
pub trait AuthInfoNotify: Send {
    /// Vectors received; returns the request to hand to the EMM procedures, if any
    fn success(
        &mut self,
        emm: &mut EmmContext,
        vectors: Vec<AuthVector>,
    ) -> MmeResult<Option<EmmProcRequest>>;

    fn failure(
        &mut self,
        emm: &mut EmmContext,
        cause: EmmCause,
    ) -> MmeResult<Option<EmmProcRequest>>;
}

/// Outstanding authentication-info retrieval
pub struct AuthInfoProcedure {
    pub notify: Box<dyn AuthInfoNotify>,
}

impl fmt::Debug for AuthInfoProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfoProcedure").finish_non_exhaustive()
    }
}

/// ESM data of the PDN connectivity in progress
#[derive(Debug, Clone, Default)]
pub struct EsmProcData {
    pub pti: Pti,
    pub request_type: u8,
    /// APN requested by the UE
    pub apn: Option<String>,
    pub pdn_type: PdnType,
    pub pdn_addr: Option<Paa>,
    pub bearer_qos: Qos,
    pub pco: Option<Bytes>,
    pub pdn_cid: Option<PdnCid>,
}

/// Circuit-domain registration parameters
#[derive(Debug, Clone, Default)]
pub struct CsfbParams {
    pub lai: Option<Lai>,
    pub mobile_identity: Option<MobileIdentity>,
    pub additional_update_result: Option<AdditionalUpdateResult>,
    pub sgs_loc_updt_status: Option<LocationUpdateStatus>,
    pub new_tmsi_allocated: bool,
    /// Default bearer activation held back until the LU completes
    pub esm_data: Option<Bytes>,
}

/// Subscribed APN configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApnConfiguration {
    pub context_identifier: u32,
    pub service_selection: String,
    pub pdn_type: PdnType,
    pub qci: u8,
    pub arp: Arp,
    pub ambr: Bitrate,
}

/// Subscribed APN configuration profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApnConfigProfile {
    /// Context identifier of the default APN
    pub context_identifier: u32,
    pub apn_configs: Vec<ApnConfiguration>,
}

impl ApnConfigProfile {
    /// Requested APN by name, otherwise the default configuration
    pub fn select(&self, requested: Option<&str>) -> Option<&ApnConfiguration> {
        match requested {
            Some(apn) if !apn.is_empty() => self
                .apn_configs
                .iter()
                .find(|c| c.service_selection.eq_ignore_ascii_case(apn)),
            _ => self
                .apn_configs
                .iter()
                .find(|c| c.context_identifier == self.context_identifier),
        }
    }
}

/// EMM part of the subscriber context
#[derive(Debug, Default)]
pub struct EmmContext {
    pub fsm_state: EmmFsmState,
    pub attach_type: AttachType,
    pub tau_update_type: EpsUpdateType,
    pub emm_cause: Option<EmmCause>,
    pub guti: Option<EpsGuti>,
    pub old_guti: Option<EpsGuti>,
    pub attach_proc: Option<AttachProcedure>,
    pub tau_proc: Option<TauProcedure>,
    pub auth_info_proc: Option<AuthInfoProcedure>,
    pub auth_vectors: Vec<AuthVector>,
    pub esm_proc_data: Option<EsmProcData>,
    pub csfb: CsfbParams,
    pub apn_profile: ApnConfigProfile,
    pub network_access_mode: NetworkAccessMode,
}

impl EmmContext {
    pub fn is_registered(&self) -> bool {
        self.fsm_state == EmmFsmState::Registered
    }
}

// ============================================================================
// Per-UE Timers
// ============================================================================

/// Timer slots of one subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct UeTimers {
    pub initial_context_setup_rsp: TimerSlot,
    pub paging: TimerSlot,
    pub mobile_reachability: TimerSlot,
    pub implicit_detach: TimerSlot,
    pub ulr_response: TimerSlot,
    pub ue_context_modification: TimerSlot,
}

impl UeTimers {
    pub fn slot_mut(&mut self, timer_id: crate::timer::MmeTimerId) -> &mut TimerSlot {
        use crate::timer::MmeTimerId;
        match timer_id {
            MmeTimerId::InitialContextSetupRsp => &mut self.initial_context_setup_rsp,
            MmeTimerId::Paging => &mut self.paging,
            MmeTimerId::MobileReachability => &mut self.mobile_reachability,
            MmeTimerId::ImplicitDetach => &mut self.implicit_detach,
            MmeTimerId::UlrResponse => &mut self.ulr_response,
            MmeTimerId::UeContextModification => &mut self.ue_context_modification,
        }
    }
}

// ============================================================================
// Path Switch
// ============================================================================

/// Path switch waiting for the gateway's modify bearer response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPathSwitch {
    /// Bearers absent from the target cell's list
    pub ebis_to_remove: Vec<Ebi>,
}

// ============================================================================
// UE Context
// ============================================================================

/// Subscriber context, the aggregate root
#[derive(Debug, Default)]
pub struct UeContext {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_key: Option<EnbUeKey>,
    pub imsi: Option<Imsi64>,
    pub msisdn: Option<String>,
    pub imsi_auth: ImsiAuth,
    /// Local S11 control tunnel
    pub mme_teid_s11: Teid,
    pub ecm_state: EcmState,
    pub mm_state: MmState,
    pub tai: EpsTai,
    pub ecgi: ECgi,
    pub ue_ambr: Bitrate,
    pub security: SecurityContext,
    pub ue_radio_capability: Option<Bytes>,
    /// Paging proceed flag
    pub ppf: bool,
    pub location_info_confirmed_in_hss: bool,
    pub send_purge_to_hss: bool,
    /// Network-initiated detach deferred until the paging response
    pub pending_detach: bool,
    /// Cause to use for the next UE context release
    pub release_cause: Option<S1apReleaseCause>,
    pub timers: UeTimers,
    pub pdns: PdnTable,
    pub bearers: BearerTable,
    pub create_bearer_proc: Option<CreateBearerProcedure>,
    /// Gateway delete bearer requests waiting for the UE
    pub delete_bearers: DeleteBearerQueue,
    pub path_switch: Option<PendingPathSwitch>,
    pub sgs: Option<SgsContext>,
    pub emm: EmmContext,
}

impl UeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.ecm_state == EcmState::Connected
    }

    pub fn is_registered(&self) -> bool {
        self.mm_state == MmState::Registered
    }

    pub fn bearer(&self, ebi: Ebi) -> MmeResult<&BearerContext> {
        self.bearers.get(ebi).ok_or_else(|| self.bearer_miss(ebi))
    }

    pub fn bearer_mut(&mut self, ebi: Ebi) -> MmeResult<&mut BearerContext> {
        let miss = self.bearer_miss(ebi);
        self.bearers.get_mut(ebi).ok_or(miss)
    }

    /// Look up a bearer by its raw wire id
    pub fn bearer_by_raw(&self, raw: u8) -> MmeResult<&BearerContext> {
        let ebi = Ebi::new(raw).ok_or_else(|| {
            MmeError::NotFound(Lookup::Bearer {
                ue_id: self.mme_ue_s1ap_id,
                ebi: raw,
            })
        })?;
        self.bearer(ebi)
    }

    pub fn pdn(&self, cid: PdnCid) -> MmeResult<&PdnContext> {
        self.pdns.get(cid).ok_or_else(|| self.pdn_miss(cid))
    }

    pub fn pdn_mut(&mut self, cid: PdnCid) -> MmeResult<&mut PdnContext> {
        let miss = self.pdn_miss(cid);
        self.pdns.slots[cid.value()].as_mut().ok_or(miss)
    }

    /// PDN owning `ebi`
    pub fn pdn_of(&self, ebi: Ebi) -> MmeResult<(PdnCid, &PdnContext)> {
        let cid = self.bearer(ebi)?.pdn_cid;
        Ok((cid, self.pdn(cid)?))
    }

    pub fn find_pdn_by_context_identifier(&self, context_identifier: u32) -> Option<PdnCid> {
        self.pdns
            .iter()
            .find(|(_, pdn)| pdn.context_identifier == context_identifier)
            .map(|(cid, _)| cid)
    }

    /// Install a PDN context in a free slot
    pub fn insert_pdn(&mut self, cid: PdnCid, mut pdn: PdnContext) -> MmeResult<()> {
        if self.pdns.get(cid).is_some() {
            return Err(MmeError::InvalidState(format!(
                "pdn slot {} of ue {} already in use",
                cid, self.mme_ue_s1ap_id
            )));
        }
        pdn.default_ebi = None;
        pdn.bearers.clear();
        self.pdns.slots[cid.value()] = Some(pdn);
        Ok(())
    }

    /// Create a bearer under `cid`. The first bearer of a PDN becomes its default bearer.
    pub fn add_bearer(&mut self, cid: PdnCid, ebi: Ebi, qos: Qos) -> MmeResult<&mut BearerContext> {
        let ue_id = self.mme_ue_s1ap_id;
        if self.bearers.get(ebi).is_some() {
            return Err(MmeError::InvalidState(format!(
                "bearer ebi={} of ue {} already exists",
                ebi, ue_id
            )));
        }
        let pdn = self.pdn_mut(cid)?;
        pdn.bearers.insert(ebi);
        if pdn.default_ebi.is_none() {
            pdn.default_ebi = Some(ebi);
        }
        let slot = &mut self.bearers.slots[ebi.index()];
        Ok(slot.insert(BearerContext::new(ebi, cid, qos)))
    }

    /// Remove a bearer. Removing a PDN's default bearer removes the whole PDN.
    pub fn remove_bearer(&mut self, ebi: Ebi) -> Option<BearerContext> {
        let cid = self.bearers.get(ebi)?.pdn_cid;
        let is_default = self
            .pdns
            .get(cid)
            .map(|pdn| pdn.default_ebi == Some(ebi))
            .unwrap_or(false);
        if is_default {
            let bearer = self.bearers.slots[ebi.index()].clone();
            self.remove_pdn(cid);
            return bearer;
        }
        if let Some(pdn) = self.pdns.slots[cid.value()].as_mut() {
            pdn.bearers.remove(&ebi);
        }
        self.bearers.slots[ebi.index()].take()
    }

    /// Remove a PDN together with all its bearers
    pub fn remove_pdn(&mut self, cid: PdnCid) -> Option<PdnContext> {
        let pdn = self.pdns.slots[cid.value()].take()?;
        for ebi in pdn.bearers.iter() {
            self.bearers.slots[ebi.index()] = None;
        }
        Some(pdn)
    }

    /// Pick a free bearer id, preferring `requested` when it is valid and free
    pub fn allocate_ebi(&self, requested: u8) -> Option<Ebi> {
        match Ebi::new(requested) {
            Some(ebi) if self.bearers.get(ebi).is_none() => Some(ebi),
            _ => self.bearers.first_free(),
        }
    }

    /// Mutable access to several bearers at once, in slot order
    pub fn bearers_mut(&mut self) -> impl Iterator<Item = &mut BearerContext> {
        self.bearers.slots.iter_mut().flatten()
    }

    /// Check the PDN/bearer linkage
    pub fn check_linkage(&self) -> MmeResult<()> {
        for bearer in self.bearers.iter() {
            let pdn = self.pdn(bearer.pdn_cid)?;
            if !pdn.owns(bearer.ebi) {
                return Err(MmeError::InvalidState(format!(
                    "bearer ebi={} not listed by pdn {}",
                    bearer.ebi, bearer.pdn_cid
                )));
            }
        }
        for (cid, pdn) in self.pdns.iter() {
            for ebi in pdn.bearers() {
                if self.bearer(ebi)?.pdn_cid != cid {
                    return Err(MmeError::InvalidState(format!(
                        "pdn {} lists bearer ebi={} owned elsewhere",
                        cid, ebi
                    )));
                }
            }
            if let Some(default_ebi) = pdn.default_ebi {
                if !pdn.owns(default_ebi) {
                    return Err(MmeError::InvalidState(format!(
                        "default bearer ebi={} of pdn {} missing",
                        default_ebi, cid
                    )));
                }
            }
        }
        Ok(())
    }

    fn bearer_miss(&self, ebi: Ebi) -> MmeError {
        MmeError::NotFound(Lookup::Bearer {
            ue_id: self.mme_ue_s1ap_id,
            ebi: ebi.value(),
        })
    }

    fn pdn_miss(&self, cid: PdnCid) -> MmeError {
        MmeError::NotFound(Lookup::Pdn {
            ue_id: self.mme_ue_s1ap_id,
            cid: cid.value(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ebi(v: u8) -> Ebi {
        Ebi::new(v).unwrap()
    }

    fn cid(v: usize) -> PdnCid {
        PdnCid::new(v).unwrap()
    }

    fn sgw() -> Fteid {
        Fteid::new(0x100, IpAddr::v4([10, 0, 0, 1]))
    }

    #[test]
    fn test_ebi_bounds() {
        assert!(Ebi::new(4).is_none());
        assert!(Ebi::new(16).is_none());
        assert_eq!(Ebi::new(5).unwrap().value(), 5);
        assert_eq!(Ebi::new(15).unwrap().value(), 15);
        assert!(PdnCid::new(MAX_NUM_OF_SESS).is_none());
    }

    #[test]
    fn test_plmn_id() {
        let plmn = PlmnId::new("001", "01");
        assert_eq!(plmn.to_string(), "00101");
        assert_eq!(plmn.encode(), [0x00, 0xf1, 0x10]);
    }

    #[test]
    fn test_ip_addr_from_slice() {
        assert_eq!(IpAddr::from_slice(&[1, 2, 3, 4]), Some(IpAddr::v4([1, 2, 3, 4])));
        assert!(IpAddr::from_slice(&[0; 16]).unwrap().ipv6.is_some());
        let dual = IpAddr::from_slice(&[1; 20]).unwrap();
        assert!(dual.ipv4.is_some() && dual.ipv6.is_some());
        assert!(IpAddr::from_slice(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_bearer_state_transitions() {
        let mut ue = UeContext::new();
        ue.insert_pdn(cid(0), PdnContext::new(1, "internet", PdnType::Ipv4)).unwrap();
        let bearer = ue.add_bearer(cid(0), ebi(5), Qos::default()).unwrap();

        assert!(bearer.mark_enb_created(sgw()).is_err());
        bearer.mark_mme_created().unwrap();
        bearer.mark_sgw_created(sgw(), None).unwrap();
        assert_eq!(bearer.state().sgw_s1u(), Some(&sgw()));
        assert!(bearer.state().enb_s1u().is_none());

        let enb = Fteid::new(0x200, IpAddr::v4([192, 168, 0, 1]));
        bearer.mark_enb_created(enb).unwrap();
        assert_eq!(bearer.state().enb_s1u(), Some(&enb));

        let err = bearer.mark_sgw_created(sgw(), None).unwrap_err();
        assert!(matches!(err, MmeError::IllegalBearerTransition { ebi: 5, .. }));

        bearer.release_enb();
        assert_eq!(bearer.state().name(), "SGW_CREATED");
        assert!(bearer.state().enb_s1u().is_none());

        bearer.reset();
        assert_eq!(*bearer.state(), BearerState::Uncreated);
        assert!(bearer.state().sgw_s1u().is_none());
    }

    #[test]
    fn test_first_bearer_is_default() {
        let mut ue = UeContext::new();
        ue.insert_pdn(cid(1), PdnContext::new(2, "ims", PdnType::Ipv4v6)).unwrap();
        ue.add_bearer(cid(1), ebi(6), Qos::default()).unwrap();
        ue.add_bearer(cid(1), ebi(7), Qos::default()).unwrap();

        let pdn = ue.pdn(cid(1)).unwrap();
        assert_eq!(pdn.default_ebi(), Some(ebi(6)));
        assert_eq!(pdn.bearers().collect::<Vec<_>>(), vec![ebi(6), ebi(7)]);
        ue.check_linkage().unwrap();
    }

    #[test]
    fn test_add_bearer_requires_pdn() {
        let mut ue = UeContext::new();
        let err = ue.add_bearer(cid(0), ebi(5), Qos::default()).unwrap_err();
        assert!(matches!(err, MmeError::NotFound(Lookup::Pdn { .. })));
        assert!(ue.bearers.is_empty());
    }

    #[test]
    fn test_duplicate_bearer_rejected() {
        let mut ue = UeContext::new();
        ue.insert_pdn(cid(0), PdnContext::new(1, "internet", PdnType::Ipv4)).unwrap();
        ue.add_bearer(cid(0), ebi(5), Qos::default()).unwrap();
        assert!(ue.add_bearer(cid(0), ebi(5), Qos::default()).is_err());
        assert_eq!(ue.bearers.len(), 1);
    }

    #[test]
    fn test_remove_dedicated_and_default_bearer() {
        let mut ue = UeContext::new();
        ue.insert_pdn(cid(0), PdnContext::new(1, "internet", PdnType::Ipv4)).unwrap();
        ue.add_bearer(cid(0), ebi(5), Qos::default()).unwrap();
        ue.add_bearer(cid(0), ebi(6), Qos::default()).unwrap();

        assert!(ue.remove_bearer(ebi(6)).is_some());
        assert!(!ue.pdn(cid(0)).unwrap().owns(ebi(6)));
        ue.check_linkage().unwrap();

        ue.add_bearer(cid(0), ebi(6), Qos::default()).unwrap();
        assert!(ue.remove_bearer(ebi(5)).is_some());
        assert!(ue.pdns.is_empty());
        assert!(ue.bearers.is_empty());
    }

    #[test]
    fn test_allocate_ebi() {
        let mut ue = UeContext::new();
        ue.insert_pdn(cid(0), PdnContext::new(1, "internet", PdnType::Ipv4)).unwrap();
        assert_eq!(ue.allocate_ebi(EBI_UNASSIGNED), Some(ebi(5)));
        ue.add_bearer(cid(0), ebi(5), Qos::default()).unwrap();
        assert_eq!(ue.allocate_ebi(5), Some(ebi(6)));
        assert_eq!(ue.allocate_ebi(9), Some(ebi(9)));
        assert_eq!(ue.bearers.free_count(), BEARERS_PER_UE - 1);
    }

    #[test]
    fn test_apn_profile_select() {
        let profile = ApnConfigProfile {
            context_identifier: 1,
            apn_configs: vec![
                ApnConfiguration {
                    context_identifier: 1,
                    service_selection: "internet".to_string(),
                    ..Default::default()
                },
                ApnConfiguration {
                    context_identifier: 2,
                    service_selection: "ims".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(profile.select(None).unwrap().context_identifier, 1);
        assert_eq!(profile.select(Some("IMS")).unwrap().context_identifier, 2);
        assert!(profile.select(Some("unknown")).is_none());
    }

    #[test]
    fn test_guti_display() {
        let gummei = Gummei {
            plmn_id: PlmnId::new("001", "01"),
            mme_gid: 2,
            mme_code: 1,
        };
        let guti = EpsGuti::from_s_tmsi(
            &gummei,
            &STmsi {
                mme_code: 1,
                m_tmsi: 0xc0000001,
            },
        );
        assert_eq!(guti.to_string(), "00101-0002-01-c0000001");
    }
}
