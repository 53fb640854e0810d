//! Policy configuration.
//!
//! Everything here is a policy knob of the device engine, not protocol
//! state. Fixed timings (disconnect grace, bonding retry backoff, the
//! post-pair discovery deferral) are constants in the modules that own
//! them.

use serde::Deserialize;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::Result;

/// Just-works re-pairing policy.
///
/// Applies when a confirmation request with the just-works hint arrives
/// for a device that is already paired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JustWorksRepairing {
    /// Reject the request without consulting the agent.
    #[strum(serialize = "never")]
    Never,
    /// Accept the request without consulting the agent.
    #[strum(serialize = "always")]
    Always,
    /// Forward the request to the agent.
    #[strum(serialize = "ask")]
    Ask,
}

/// Device engine policy configuration.
///
/// All fields have defaults; a configuration file only needs to name the
/// values it changes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// How long a temporary device stays registered without activity.
    #[serde(with = "duration_secs")]
    pub temporary_timeout: Duration,
    /// Minimum delay between remote-name resolution attempts after a
    /// failure.
    #[serde(with = "duration_secs")]
    pub name_resolve_retry_delay: Duration,
    /// Policy for just-works requests on already-paired devices.
    pub just_works_repairing: JustWorksRepairing,
    /// Fixed PIN fallbacks tried in order when a legacy device requests a
    /// PIN code before the agent is consulted.
    pub legacy_pins: Vec<String>,
    /// Open the ATT channel before bonding an LE device, so that key
    /// exchange can ride on it.
    pub le_connect_before_bonding: bool,
    /// Trigger SMP by elevating ATT link security instead of requesting
    /// bond creation from the management layer.
    pub le_elevate_security: bool,
    /// Upper bound on bonding attempts for one pair request, including
    /// retries after transient failures.
    pub max_bonding_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temporary_timeout: Duration::from_secs(30),
            name_resolve_retry_delay: Duration::from_secs(300),
            just_works_repairing: JustWorksRepairing::Never,
            legacy_pins: vec!["0000".to_string(), "1234".to_string()],
            le_connect_before_bonding: true,
            le_elevate_security: true,
            max_bonding_attempts: 3,
        }
    }
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.temporary_timeout, Duration::from_secs(30));
        assert_eq!(config.just_works_repairing, JustWorksRepairing::Never);
        assert!(config.le_connect_before_bonding);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = Config::from_toml(
            "temporary_timeout = 60\njust_works_repairing = \"ask\"\nlegacy_pins = [\"9999\"]\n",
        )
        .unwrap();
        assert_eq!(config.temporary_timeout, Duration::from_secs(60));
        assert_eq!(config.just_works_repairing, JustWorksRepairing::Ask);
        assert_eq!(config.legacy_pins, vec!["9999".to_string()]);
        assert_eq!(config.max_bonding_attempts, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_toml("no_such_knob = true\n").is_err());
    }
}
