//! Runtime configuration, loaded from the environment via `envconfig`.
//!
//! Field names and defaults follow the "Configuration (recognized
//! options)" table; numeric defaults mirror the values actually used at
//! the original's call sites (`run.py`), not the separate and apparently
//! unused `constants.py` defaults.

use envconfig::Envconfig;

#[derive(Debug, Clone, Envconfig)]
pub struct SchedulerConfig {
    #[envconfig(from = "NIMBUS_INTERVAL_SEC", default = "120")]
    pub interval_sec: u64,

    #[envconfig(from = "NIMBUS_FULL_THRESHOLD", default = "0.95")]
    pub full_threshold: f64,

    #[envconfig(from = "NIMBUS_COOLDOWN_SEC", default = "240")]
    pub cooldown_sec: u64,

    #[envconfig(from = "NIMBUS_CREATION_BLOCK_SEC", default = "150")]
    pub creation_block_sec: u64,

    #[envconfig(from = "NIMBUS_CONSOLIDATE_SLEEP_SEC", default = "240")]
    pub consolidate_sleep_sec: u64,

    #[envconfig(from = "NIMBUS_CONSOLIDATE_LOW_THRESHOLD", default = "0.45")]
    pub consolidate_low_threshold: f64,

    #[envconfig(from = "NIMBUS_SA_N_ITER", default = "300")]
    pub sa_n_iter: u32,

    #[envconfig(from = "NIMBUS_SA_T0", default = "60.0")]
    pub sa_t0: f64,

    #[envconfig(from = "NIMBUS_SA_TMIN", default = "1.0")]
    pub sa_tmin: f64,

    #[envconfig(from = "NIMBUS_SA_ALPHA", default = "0.9")]
    pub sa_alpha: f64,

    #[envconfig(from = "NIMBUS_SA_INCREMENTAL_RESTRICTED", default = "true")]
    pub sa_incremental_ops_restricted: bool,

    #[envconfig(from = "NIMBUS_REUSE_SPEC_GAP", default = "0.05")]
    pub reuse_spec_gap: f64,

    #[envconfig(from = "NIMBUS_REUSE_PRICE_GAP", default = "0.05")]
    pub reuse_price_gap: f64,

    #[envconfig(from = "NIMBUS_PACK_COST_SLACK", default = "1.10")]
    pub pack_cost_slack: f64,

    #[envconfig(from = "NIMBUS_SPEC_JSON_PATH", default = "data/gcp/machine_types.json")]
    pub spec_json_path: String,

    #[envconfig(from = "NIMBUS_PRICE_JSON_PATH", default = "data/gcp/region_machine_prices.json")]
    pub price_json_path: String,

    #[envconfig(from = "NIMBUS_NODE_INFO_PATH", default = "node_info.json")]
    pub node_info_path: String,

    #[envconfig(from = "NIMBUS_HISTORY_PATH", default = "data/schedule_history.csv")]
    pub history_path: String,

    #[envconfig(from = "NIMBUS_GCP_PROJECT")]
    pub gcp_project: Option<String>,

    #[envconfig(from = "NIMBUS_GCP_DEFAULT_ZONE_SUFFIX", default = "-a")]
    pub gcp_default_zone_suffix: String,

    #[envconfig(from = "NIMBUS_GCP_STARTUP_SCRIPT_PATH", default = "config/worker_initial.sh")]
    pub gcp_startup_script_path: String,
}

impl SchedulerConfig {
    pub fn sa_config(&self) -> crate::sa::SaConfig {
        crate::sa::SaConfig {
            n_iter: self.sa_n_iter,
            t0: self.sa_t0,
            tmin: self.sa_tmin,
            alpha: self.sa_alpha,
            incremental_ops_restricted: self.sa_incremental_ops_restricted,
            ..crate::sa::SaConfig::default()
        }
    }

    pub fn postprocess_config(&self) -> crate::postprocess::PostprocessConfig {
        crate::postprocess::PostprocessConfig {
            reuse_spec_gap: self.reuse_spec_gap,
            reuse_price_gap: self.reuse_price_gap,
            pack_cost_slack: self.pack_cost_slack,
            ..crate::postprocess::PostprocessConfig::default()
        }
    }
}
