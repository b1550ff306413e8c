//! Passing record types shared between the decoder link, the engine and the
//! pub/sub payloads.

use serde::{Deserialize, Serialize};

use crate::tod::Tod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    C0,
    C1,
    C2,
    Batt,
    Sts,
}

impl Channel {
    pub fn from_tag(tag: &str) -> Option<Channel> {
        match tag {
            "STA" => Some(Channel::C1),
            "BOX" => Some(Channel::C2),
            "MAN" => Some(Channel::C0),
            _ => None,
        }
    }
}

/// A raw passing as decoded off the wire, before drift correction or
/// sync/gate interpretation. `source = None` represents the synthetic idle
/// tick emitted by the hub when nothing has arrived for a while.
#[derive(Debug, Clone)]
pub struct RawPassing {
    pub source: Option<String>,
    pub channel: Channel,
    pub refid: String,
    pub tod: Tod,
    pub index: String,
    pub low_battery: bool,
    pub faulty_battery: bool,
}

impl RawPassing {
    pub fn idle_tick(now: Tod) -> Self {
        RawPassing {
            source: None,
            channel: Channel::C0,
            refid: String::new(),
            tod: now,
            index: String::new(),
            low_battery: false,
            faulty_battery: false,
        }
    }
}

/// A status frame reported by a decoder (noise level, battery, flags echo).
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub source: String,
    pub refid: String,
    pub tod: Tod,
}

/// A fully processed, emittable passing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedPassing {
    pub index: u64,
    pub date: String,
    pub time: String,
    pub mpid: String,
    pub refid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<(f64, f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moto: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qtr: Option<String>,
    #[serde(rename = "200", skip_serializing_if = "Option::is_none")]
    pub split_200: Option<String>,
    #[serde(rename = "100", skip_serializing_if = "Option::is_none")]
    pub split_100: Option<String>,
    #[serde(rename = "50", skip_serializing_if = "Option::is_none")]
    pub split_50: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
