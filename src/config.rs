// =============================================================================
// Configuration — typed record for the execution substrate
// =============================================================================
//
// How the record is populated (env, files, deployment tooling) is the
// caller's concern; this module only defines the shape, defaults, and the
// JSON load/save used by the binary. Business-parameter switches default to
// the permissive profile; `StrategySwitches::conservative()` restores the
// strict one.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::engine::exposure::SectorExposureConfig;
use crate::engine::universe::UniverseFilterConfig;

/// One credential group (live or paper). Secrets are redacted from Debug
/// output.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub url: String,
    pub app_key: String,
    pub app_secret: String,
    #[serde(default)]
    pub account_number: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("account_number", &"<redacted>")
            .finish()
    }
}

/// Per-strategy tuning switches. Defaults maximize trade frequency; the
/// conservative profile restores strict thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySwitches {
    /// Require the acceptance pullback to hold above VWAP support.
    #[serde(default)]
    pub require_held_support: bool,
    /// Minimum quality score required to size a position at all.
    #[serde(default = "default_quality_min")]
    pub quality_min: u32,
    /// Maximum opening-range width as a fraction of OR mid.
    #[serde(default = "default_or_range_max")]
    pub or_range_max: f64,
    /// Surge-threshold decay slope per minute.
    #[serde(default = "default_min_surge_slope")]
    pub min_surge_slope: f64,
    /// Hard-gate RVol at the break instead of letting quality weight it.
    #[serde(default)]
    pub enable_rvol_hard_gate: bool,
    /// Allow reduced-size entries for tier-C leaders.
    #[serde(default)]
    pub allow_tier_c_reduced: bool,
    /// Leader tier A percentile boundary.
    #[serde(default = "default_leader_tier_a_pct")]
    pub leader_tier_a_pct: u32,
    /// Leader tier B percentile boundary.
    #[serde(default = "default_leader_tier_b_pct")]
    pub leader_tier_b_pct: u32,
    /// Minimum flow-persistence fraction for leader qualification.
    #[serde(default = "default_flow_persistence_min")]
    pub flow_persistence_min: f64,
    /// Confirmation bars required by slower strategies.
    #[serde(default = "default_confirm_bars")]
    pub confirm_bars: u32,
    /// Tolerance below VWAP still counted as held support.
    #[serde(default = "default_held_support_tolerance")]
    pub held_support_tolerance: f64,
}

fn default_quality_min() -> u32 {
    30
}
fn default_or_range_max() -> f64 {
    0.07
}
fn default_min_surge_slope() -> f64 {
    0.03
}
fn default_leader_tier_a_pct() -> u32 {
    70
}
fn default_leader_tier_b_pct() -> u32 {
    40
}
fn default_flow_persistence_min() -> f64 {
    0.6
}
fn default_confirm_bars() -> u32 {
    2
}
fn default_held_support_tolerance() -> f64 {
    0.005
}

impl Default for StrategySwitches {
    fn default() -> Self {
        Self {
            require_held_support: false,
            quality_min: default_quality_min(),
            or_range_max: default_or_range_max(),
            min_surge_slope: default_min_surge_slope(),
            enable_rvol_hard_gate: false,
            allow_tier_c_reduced: false,
            leader_tier_a_pct: default_leader_tier_a_pct(),
            leader_tier_b_pct: default_leader_tier_b_pct(),
            flow_persistence_min: default_flow_persistence_min(),
            confirm_bars: default_confirm_bars(),
            held_support_tolerance: default_held_support_tolerance(),
        }
    }
}

impl StrategySwitches {
    /// Strict profile: fewer, higher-conviction entries.
    pub fn conservative() -> Self {
        Self {
            require_held_support: true,
            quality_min: 40,
            or_range_max: 0.055,
            min_surge_slope: 0.04,
            enable_rvol_hard_gate: true,
            ..Self::default()
        }
    }
}

/// Full configuration surface of the substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KisConfig {
    /// Customer type (single character, e.g. "P").
    pub custtype: String,
    pub user_agent: String,
    pub hts_id: String,
    pub is_paper: bool,

    /// Live credentials. In paper mode these double as the real-endpoint
    /// fallback for operations the paper server does not cover.
    #[serde(default)]
    pub live: Option<Credentials>,
    #[serde(default)]
    pub paper: Option<Credentials>,

    #[serde(default)]
    pub websocket_url: String,

    /// Tracked universe (candidate tickers before filtering).
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Non-trading dates (ISO), ordered.
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,

    /// Symbol → sector tag. KIS does not reliably expose a sector taxonomy,
    /// so this arrives from configuration.
    #[serde(default)]
    pub sector_map: HashMap<String, String>,

    #[serde(default)]
    pub universe: UniverseFilterConfig,

    #[serde(default)]
    pub exposure: SectorExposureConfig,

    /// Endpoint-class budget overrides: class → (capacity, refill rate).
    #[serde(default)]
    pub rate_overrides: HashMap<String, (u32, f64)>,

    /// Strategy → half-open local-time priority windows.
    #[serde(default)]
    pub priority_windows: BTreeMap<String, Vec<(NaiveTime, NaiveTime)>>,

    #[serde(default)]
    pub switches: StrategySwitches,

    /// Live TR-ID → paper TR-ID. Injected, never hardcoded.
    #[serde(default)]
    pub paper_tr_id_map: HashMap<String, String>,
    /// Live TR-IDs usable unchanged in paper mode.
    #[serde(default)]
    pub paper_tr_id_passthrough: HashSet<String>,

    /// Shared rate-budget state file for cross-process coordination.
    #[serde(default)]
    pub shared_state_file: Option<PathBuf>,

    /// Identifier this process uses against the shared budget.
    #[serde(default = "default_strategy_id")]
    pub strategy_id: String,
}

fn default_strategy_id() -> String {
    "KMP".to_string()
}

impl Default for KisConfig {
    fn default() -> Self {
        Self {
            custtype: "P".into(),
            user_agent: "kis-nexus/1.0".into(),
            hts_id: String::new(),
            is_paper: true,
            live: None,
            paper: None,
            websocket_url: String::new(),
            symbols: Vec::new(),
            holidays: BTreeSet::new(),
            sector_map: HashMap::new(),
            universe: UniverseFilterConfig::default(),
            exposure: SectorExposureConfig::default(),
            rate_overrides: HashMap::new(),
            priority_windows: BTreeMap::new(),
            switches: StrategySwitches::default(),
            paper_tr_id_map: HashMap::new(),
            paper_tr_id_passthrough: HashSet::new(),
            shared_state_file: None,
            strategy_id: default_strategy_id(),
        }
    }
}

impl KisConfig {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Persist to a JSON file (pretty-printed).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config {}", path.display()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let sw = StrategySwitches::default();
        assert!(!sw.require_held_support);
        assert_eq!(sw.quality_min, 30);
        assert_eq!(sw.or_range_max, 0.07);
        assert_eq!(sw.min_surge_slope, 0.03);
    }

    #[test]
    fn conservative_profile_is_strict() {
        let sw = StrategySwitches::conservative();
        assert!(sw.require_held_support);
        assert_eq!(sw.quality_min, 40);
        assert_eq!(sw.or_range_max, 0.055);
        assert_eq!(sw.min_surge_slope, 0.04);
        assert!(sw.enable_rvol_hard_gate);
    }

    #[test]
    fn config_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = KisConfig::default();
        cfg.hts_id = "user1".into();
        cfg.sector_map.insert("005930".into(), "IT".into());
        cfg.paper_tr_id_map
            .insert("TTTC0802U".into(), "VTTC0802U".into());
        cfg.save(&path).unwrap();

        let loaded = KisConfig::load(&path).unwrap();
        assert_eq!(loaded.hts_id, "user1");
        assert_eq!(loaded.sector_map["005930"], "IT");
        assert_eq!(loaded.paper_tr_id_map["TTTC0802U"], "VTTC0802U");
        assert_eq!(loaded.strategy_id, "KMP");
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let cfg: KisConfig = serde_json::from_str(
            r#"{"custtype":"P","user_agent":"ua","hts_id":"h","is_paper":true}"#,
        )
        .unwrap();
        assert_eq!(cfg.switches.quality_min, 30);
        assert!(cfg.shared_state_file.is_none());
        assert_eq!(cfg.strategy_id, "KMP");
    }
}
