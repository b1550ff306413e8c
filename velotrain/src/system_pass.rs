//! System passing handling (C5): the three reserved refids that never enter
//! the per-rider passing queue — the top-of-minute trigger, gate-start
//! transponders and camera-moto proximity markers. Grounded line-for-line on
//! `_systempass` in the reference implementation.

use tracing::{debug, info, warn};

use velotrain_proto::{ProcessedPassing, RawPassing};

use crate::engine::{App, LOGDRIFT_MS};

impl App {
    pub async fn system_pass(&mut self, t: &RawPassing, chan: &str) {
        if t.refid == self.cf.trig {
            let tom = t.tod.round60();
            let drift = tom - t.tod;
            self.drifts.insert(chan.to_string(), drift);
            if drift.abs().as_millis() > LOGDRIFT_MS {
                info!(mp = chan, drift = %drift, "clock offset exceeds threshold");
            }
            if Some(chan) == self.tomsrc.as_deref() {
                self.timeout_tick().await;
                self.publish_status().await;
                if let Some(dhi) = self.dhi.clone() {
                    if let Some((t, h, p)) = self.publish_env().await {
                        dhi.emit_env(t, h, p).await;
                    } else {
                        debug!("environment data not available");
                    }
                }
            }
        } else if self.cf.moto.contains(&t.refid) {
            debug!(mp = chan, t = %t.tod, "moto marker");
            self.motos.insert(chan.to_string(), t.tod.truncate_places(3));
        } else if Some(&t.refid) == self.cf.gate.as_ref() {
            if Some(chan) == self.gatesrc.as_deref() {
                self.cleanqueues().await;
                debug!(mp = chan, t = %t.tod, "gate trigger");

                let gate = t.tod - self.gatedelay;
                self.gate = Some(gate);
                self.runstart = Some(gate);
                if self.lastpass.is_none() || gate > self.lastpass.unwrap() {
                    self.lastpass = Some(gate);
                }

                let env = self.publish_env().await;
                let po = ProcessedPassing {
                    index: 0,
                    date: Self::now_date(),
                    time: gate.to_string(),
                    mpid: "0".to_string(),
                    refid: "gate".to_string(),
                    env,
                    moto: None,
                    elap: Some("0.00".to_string()),
                    lap: None,
                    half: None,
                    qtr: None,
                    split_200: None,
                    split_100: None,
                    split_50: None,
                    text: Some("Start Gate".to_string()),
                };
                self.emit_passing(po).await;
            } else {
                warn!(mp = chan, t = %t.tod, "spurious gate trigger");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use velotrain_proto::{Channel, RawPassing, Tod};

    use crate::bus::LoggingBus;
    use crate::config::{Config, MpConfig};
    use crate::env::NoEnv;
    use crate::net_hub::HubCommand;
    use crate::sector_map::SectorMap;

    use super::*;

    fn test_app(cf: Config) -> App {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<HubCommand>();
        let sector_map = SectorMap::build(&cf);
        let mut mp_names = HashMap::new();
        for (chan, _) in cf.configured_mps() {
            mp_names.insert(chan.to_string(), chan.to_string());
        }
        App {
            cf,
            bus: Arc::new(LoggingBus),
            env: Arc::new(NoEnv),
            dhi: None,
            hub: tx,
            mp_names,
            sector_map,
            passq: HashMap::new(),
            session_log: Vec::new(),
            batteries: HashMap::new(),
            dstat: HashMap::new(),
            drifts: HashMap::new(),
            motos: HashMap::new(),
            gatesrc: None,
            gatedelay: Tod::from_secs_f64(0.075),
            tomsrc: None,
            syncmaster: None,
            gate: None,
            runstart: None,
            lastpass: None,
            offset: Tod::ZERO,
            resetting: false,
            reset_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn base_config() -> Config {
        let mut cf = Config::default();
        cf.gate = Some("90000".into());
        cf.gatesrc = Some("C4".into());
        cf.mps.insert(
            "C4".to_string(),
            MpConfig { ip: Some("10.0.0.1".into()), ..Default::default() },
        );
        cf
    }

    #[tokio::test]
    async fn gate_trigger_from_configured_source_overrides_runstart() {
        let cf = base_config();
        let mut app = test_app(cf);
        app.gatesrc = Some("C4".into());
        app.system_pass(
            &RawPassing {
                source: Some("C4".into()), channel: Channel::C1, refid: "90000".into(),
                tod: Tod::from_secs_f64(10.075), index: String::new(), low_battery: false, faulty_battery: false,
            },
            "C4",
        ).await;
        assert_eq!(app.gate, Some(Tod::from_secs_f64(10.0)));
        assert_eq!(app.runstart, Some(Tod::from_secs_f64(10.0)));
        assert_eq!(app.session_log.len(), 1);
        assert_eq!(app.session_log[0].refid, "gate");
        assert_eq!(app.session_log[0].elap.as_deref(), Some("0.00"));
    }

    #[tokio::test]
    async fn gate_trigger_from_wrong_source_is_ignored() {
        let cf = base_config();
        let mut app = test_app(cf);
        app.gatesrc = Some("C4".into());
        app.system_pass(
            &RawPassing {
                source: Some("C6".into()), channel: Channel::C1, refid: "90000".into(),
                tod: Tod::from_secs_f64(10.0), index: String::new(), low_battery: false, faulty_battery: false,
            },
            "C6",
        ).await;
        assert!(app.gate.is_none());
        assert!(app.session_log.is_empty());
    }

    #[tokio::test]
    async fn moto_marker_is_truncated_to_three_places() {
        let cf = base_config();
        let mut app = test_app(cf);
        app.cf.moto = vec!["90005".into()];
        app.system_pass(
            &RawPassing {
                source: Some("C4".into()), channel: Channel::C1, refid: "90005".into(),
                tod: Tod::from_secs_f64(10.12349), index: String::new(), low_battery: false, faulty_battery: false,
            },
            "C4",
        ).await;
        assert_eq!(app.motos["C4"], Tod::from_secs_f64(10.123));
    }
}
