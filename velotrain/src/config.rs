//! Operational configuration, overlaid on defaults.
//!
//! A real deployment loads this from `velotrain.json`; the JSON parsing and
//! file-merge step are treated as an ambient collaborator concern and are
//! not this module's job — `Config` only owns validated, already-decoded
//! settings. Callers get there with `serde_json::from_value` /
//! `from_reader` over a `Config::default()` baseline via `#[serde(default)]`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PASS_LEVEL: u8 = 40;
pub const DEFAULT_LAP_LEN: f64 = 250.0;
pub const DEFAULT_SEQUENCE: &[&str] = &["C1", "C9", "C4", "C6", "C3", "C5", "C7", "C8", "C2"];

fn default_trig() -> String {
    "255".to_string()
}
fn default_passlevel() -> u8 {
    DEFAULT_PASS_LEVEL
}
fn default_bcast() -> String {
    "255.255.255.255".to_string()
}
fn default_basetopic() -> String {
    "velotrain".to_string()
}
fn default_uport() -> u16 {
    2008
}
fn default_minspeed() -> f64 {
    30.0
}
fn default_maxspeed() -> f64 {
    90.0
}
fn default_mingate() -> f64 {
    9.0
}
fn default_maxgate() -> f64 {
    22.5
}
fn default_gatedelay() -> f64 {
    0.075
}
fn default_dhiencoding() -> String {
    "utf-8".to_string()
}
fn default_laplen() -> f64 {
    DEFAULT_LAP_LEN
}
fn default_mpseq() -> Vec<String> {
    DEFAULT_SEQUENCE.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MpConfig {
    pub ip: Option<String>,
    pub name: Option<String>,
    pub active: bool,
    pub offset: Option<f64>,
    pub half: Option<String>,
    pub qtr: Option<String>,
    #[serde(rename = "200")]
    pub split_200: Option<String>,
    #[serde(rename = "100")]
    pub split_100: Option<String>,
    #[serde(rename = "50")]
    pub split_50: Option<String>,
}

impl Default for MpConfig {
    fn default() -> Self {
        MpConfig {
            ip: None,
            name: None,
            active: false,
            offset: None,
            half: None,
            qtr: None,
            split_200: None,
            split_100: None,
            split_50: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DhiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub gate: Option<String>,
    #[serde(default = "default_gatedelay")]
    pub gatedelay: f64,
    pub gatesrc: Option<String>,
    pub moto: Vec<String>,
    #[serde(default = "default_trig")]
    pub trig: String,
    #[serde(default = "default_passlevel")]
    pub passlevel: u8,
    pub uaddr: String,
    #[serde(default = "default_uport")]
    pub uport: u16,
    #[serde(default = "default_bcast")]
    pub bcast: String,
    #[serde(default = "default_basetopic")]
    pub basetopic: String,
    pub sync: Option<String>,
    pub authkey: Option<String>,
    #[serde(default = "default_minspeed")]
    pub minspeed: f64,
    #[serde(default = "default_maxspeed")]
    pub maxspeed: f64,
    #[serde(default = "default_mingate")]
    pub mingate: f64,
    #[serde(default = "default_maxgate")]
    pub maxgate: f64,
    pub dhi: Option<DhiConfig>,
    #[serde(default = "default_dhiencoding")]
    pub dhiencoding: String,
    #[serde(default = "default_laplen")]
    pub laplen: f64,
    #[serde(default = "default_mpseq")]
    pub mpseq: Vec<String>,
    pub mps: HashMap<String, MpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gate: None,
            gatedelay: default_gatedelay(),
            gatesrc: None,
            moto: Vec::new(),
            trig: default_trig(),
            passlevel: default_passlevel(),
            uaddr: String::new(),
            uport: default_uport(),
            bcast: default_bcast(),
            basetopic: default_basetopic(),
            sync: None,
            authkey: None,
            minspeed: default_minspeed(),
            maxspeed: default_maxspeed(),
            mingate: default_mingate(),
            maxgate: default_maxgate(),
            dhi: None,
            dhiencoding: default_dhiencoding(),
            laplen: default_laplen(),
            mpseq: default_mpseq(),
            mps: HashMap::new(),
        }
    }
}

impl Config {
    /// Returns the set of measurement points with an IP configured, i.e. the
    /// ones actually wired up to a decoder.
    pub fn configured_mps(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        for chan in DEFAULT_SEQUENCE {
            if let Some(mp) = self.mps.get(*chan) {
                if let Some(ip) = mp.ip.as_deref() {
                    out.push((*chan, ip));
                }
            }
        }
        out
    }

    /// Picks a top-of-minute trigger source: any configured mp other than
    /// the sync master.
    pub fn top_of_minute_source(&self) -> Option<String> {
        self.configured_mps()
            .into_iter()
            .map(|(chan, _)| chan.to_string())
            .find(|chan| Some(chan.as_str()) != self.sync.as_deref())
    }

    /// Validates the two fatal-at-startup conditions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.basetopic.trim().is_empty() {
            return Err(ConfigError::EmptyBaseTopic);
        }
        if self.top_of_minute_source().is_none() {
            return Err(ConfigError::NoTopOfMinuteSource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cf = Config::default();
        assert_eq!(cf.trig, "255");
        assert_eq!(cf.passlevel, DEFAULT_PASS_LEVEL);
        assert_eq!(cf.laplen, DEFAULT_LAP_LEN);
        assert_eq!(cf.mpseq, default_mpseq());
    }

    #[test]
    fn validate_rejects_empty_basetopic() {
        let mut cf = Config::default();
        cf.basetopic = "".into();
        assert!(matches!(cf.validate(), Err(ConfigError::EmptyBaseTopic)));
    }

    #[test]
    fn validate_rejects_missing_tom_source() {
        let cf = Config::default();
        assert!(matches!(cf.validate(), Err(ConfigError::NoTopOfMinuteSource)));
    }

    #[test]
    fn validate_passes_with_one_configured_mp() {
        let mut cf = Config::default();
        cf.mps.insert(
            "C1".to_string(),
            MpConfig {
                ip: Some("10.0.0.1".into()),
                ..Default::default()
            },
        );
        assert!(cf.validate().is_ok());
    }
}
