//! MME Session Configuration
//!
//! The `mme:` section of the YAML configuration file. Every key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{Gummei, PlmnId};
use crate::error::{MmeError, MmeResult};
use crate::timer::MmeTimerConfigs;

fn default_max_ue() -> usize {
    1024
}

/// PLMN ID as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlmnIdConfig {
    pub mcc: String,
    pub mnc: String,
}

impl Default for PlmnIdConfig {
    fn default() -> Self {
        Self {
            mcc: "001".to_string(),
            mnc: "01".to_string(),
        }
    }
}

/// Served GUMMEI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GummeiConfig {
    pub plmn_id: PlmnIdConfig,
    pub mme_gid: u16,
    pub mme_code: u8,
}

impl Default for GummeiConfig {
    fn default() -> Self {
        Self {
            plmn_id: PlmnIdConfig::default(),
            mme_gid: 2,
            mme_code: 1,
        }
    }
}

impl GummeiConfig {
    pub fn to_gummei(&self) -> Gummei {
        Gummei {
            plmn_id: PlmnId::new(&self.plmn_id.mcc, &self.plmn_id.mnc),
            mme_gid: self.mme_gid,
            mme_code: self.mme_code,
        }
    }
}

/// Which non-EPS services the MME offers over SGs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonEpsServiceControl {
    #[default]
    Off,
    Sms,
    CsfbSms,
}

impl NonEpsServiceControl {
    /// Combined attaches wait for the circuit domain
    pub fn uses_sgs(&self) -> bool {
        matches!(self, NonEpsServiceControl::Sms | NonEpsServiceControl::CsfbSms)
    }
}

/// Timer durations in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub initial_context_setup_rsp: u64,
    pub paging_response: u64,
    pub mobile_reachability: u64,
    pub implicit_detach: u64,
    pub ulr_response: u64,
    pub ue_context_modification: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_context_setup_rsp: 2,
            paging_response: 4,
            mobile_reachability: 3240,
            implicit_detach: 3240,
            ulr_response: 5,
            ue_context_modification: 2,
        }
    }
}

impl From<&TimerConfig> for MmeTimerConfigs {
    fn from(config: &TimerConfig) -> Self {
        Self {
            initial_context_setup_rsp: Duration::from_secs(config.initial_context_setup_rsp),
            paging_response: Duration::from_secs(config.paging_response),
            mobile_reachability: Duration::from_secs(config.mobile_reachability),
            implicit_detach: Duration::from_secs(config.implicit_detach),
            ulr_response: Duration::from_secs(config.ulr_response),
            ue_context_modification: Duration::from_secs(config.ue_context_modification),
        }
    }
}

/// The `mme:` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmeConfig {
    pub gummei: GummeiConfig,
    /// Upper bound on simultaneously allocated subscriber ids
    #[serde(default = "default_max_ue")]
    pub max_ue: usize,
    pub non_eps_service_control: NonEpsServiceControl,
    pub timer: TimerConfig,
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            gummei: GummeiConfig::default(),
            max_ue: default_max_ue(),
            non_eps_service_control: NonEpsServiceControl::default(),
            timer: TimerConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mme: Option<MmeConfig>,
}

impl MmeConfig {
    /// Parse a YAML document; a document without an `mme:` section yields defaults
    pub fn from_str(content: &str) -> MmeResult<Self> {
        let file: Option<ConfigFile> = serde_yaml::from_str(content)
            .map_err(|e| MmeError::Config(format!("failed to parse YAML config: {}", e)))?;
        let config = file.and_then(|f| f.mme).unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> MmeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MmeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    pub fn validate(&self) -> MmeResult<()> {
        if self.max_ue == 0 {
            return Err(MmeError::Config("max_ue must be positive".to_string()));
        }
        if self.gummei.plmn_id.mcc.len() != 3 {
            return Err(MmeError::Config(format!(
                "mcc '{}' must have 3 digits",
                self.gummei.plmn_id.mcc
            )));
        }
        if !(2..=3).contains(&self.gummei.plmn_id.mnc.len()) {
            return Err(MmeError::Config(format!(
                "mnc '{}' must have 2 or 3 digits",
                self.gummei.plmn_id.mnc
            )));
        }
        Ok(())
    }

    pub fn gummei(&self) -> Gummei {
        self.gummei.to_gummei()
    }

    pub fn timers(&self) -> MmeTimerConfigs {
        MmeTimerConfigs::from(&self.timer)
    }
}
