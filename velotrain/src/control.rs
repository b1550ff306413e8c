//! Control-plane command dispatch (C8): the `marker`/`request`/`reset`/
//! `resetunit`/`timer` topics plus the foreign-timer line parser. Grounded
//! on `_command`/`_marker`/`_foreigntimer` in the reference implementation.

use tracing::{debug, warn};

use velotrain_proto::{Channel, ProcessedPassing, RawPassing, Tod};

use crate::engine::App;

const DEFAULT_MARKER: &str = "Manual Marker";

/// Strips control characters and trims surrounding whitespace, standing in
/// for the reference implementation's printable-character translation table.
fn sanitize_marker(msg: &str) -> String {
    msg.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

impl App {
    /// Dispatches a command received on a control topic, keyed by the
    /// topic's last path segment.
    pub async fn handle_command(&mut self, topic: &str, msg: &str) {
        let req = topic.rsplit('/').next().unwrap_or(topic).to_lowercase();
        debug!(command = %req, "command");
        match req.as_str() {
            "request" => self.check_request(msg).await,
            "marker" => {
                let mark = sanitize_marker(msg);
                let mark = if mark.is_empty() { DEFAULT_MARKER.to_string() } else { mark };
                self.marker(&mark).await;
            }
            "reset" => {
                let authorised = match &self.cf.authkey {
                    Some(key) => msg == key,
                    None => true,
                };
                if authorised {
                    self.full_reset().await;
                } else {
                    warn!("invalid reset authorisation key");
                }
            }
            "resetunit" => self.reset_unit(msg.trim()).await,
            "timer" => self.foreign_timer(msg).await,
            _ => debug!("ignored invalid command"),
        }
    }

    /// Inserts a manual marker into the session log without extending the
    /// shared run-start/run-idle state.
    pub async fn marker(&mut self, text: &str) {
        self.cleanqueues().await;
        let nt = Tod::now();
        let elap = if let (Some(runstart), Some(lastpass)) = (self.runstart, self.lastpass) {
            if nt >= runstart && nt >= lastpass && (nt - lastpass).as_millis() < crate::engine::RUNIDLE {
                Some(format!("{:.2}", (nt - runstart).rounded_secs(2)))
            } else {
                None
            }
        } else {
            None
        };
        let env = self.publish_env().await;
        let po = ProcessedPassing {
            index: 0,
            date: Self::now_date(),
            time: nt.to_string(),
            mpid: "0".to_string(),
            refid: "marker".to_string(),
            env,
            moto: None,
            elap,
            lap: None,
            half: None,
            qtr: None,
            split_200: None,
            split_100: None,
            split_50: None,
            text: Some(text.to_string()),
        };
        self.emit_passing(po).await;
    }

    /// Parses a `INDEX;SOURCE;CHANNEL;REFID;TIMEOFDAY` telegraphed line into
    /// a raw passing and feeds it through the normal passing pipeline.
    pub async fn foreign_timer(&mut self, msg: &str) {
        let fields: Vec<&str> = msg.split(';').collect();
        if fields.len() != 5 {
            warn!(msg, "ignored invalid foreign timer");
            return;
        }
        let tod: Result<Tod, _> = fields[4].parse();
        match tod {
            Ok(tod) => {
                let channel = Channel::from_tag(fields[2]).unwrap_or(Channel::C1);
                let t = RawPassing {
                    source: Some(fields[1].to_string()),
                    channel,
                    refid: fields[3].to_string(),
                    tod,
                    index: fields[0].to_string(),
                    low_battery: false,
                    faulty_battery: false,
                };
                self.raw_passing(t).await;
            }
            Err(_) => warn!(msg, "ignored invalid foreign timer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::bus::LoggingBus;
    use crate::config::Config;
    use crate::env::NoEnv;
    use crate::sector_map::SectorMap;

    use super::*;

    fn test_app() -> App {
        let cf = Config::default();
        let sector_map = SectorMap::build(&cf);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        App {
            cf,
            bus: Arc::new(LoggingBus),
            env: Arc::new(NoEnv),
            dhi: None,
            hub: tx,
            mp_names: HashMap::new(),
            sector_map,
            passq: HashMap::new(),
            session_log: Vec::new(),
            batteries: HashMap::new(),
            dstat: HashMap::new(),
            drifts: HashMap::new(),
            motos: HashMap::new(),
            gatesrc: None,
            gatedelay: Tod::ZERO,
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

    #[tokio::test]
    async fn marker_with_blank_text_falls_back_to_default() {
        let mut app = test_app();
        app.handle_command("velotrain/marker", "   ").await;
        assert_eq!(app.session_log[0].text.as_deref(), Some(DEFAULT_MARKER));
    }

    #[tokio::test]
    async fn marker_uses_sanitised_text() {
        let mut app = test_app();
        app.handle_command("velotrain/marker", " Lap 3 Crash \n").await;
        assert_eq!(app.session_log[0].text.as_deref(), Some("Lap 3 Crash"));
    }

    #[tokio::test]
    async fn reset_rejects_wrong_authkey() {
        let mut app = test_app();
        app.cf.authkey = Some("secret".into());
        app.handle_command("velotrain/reset", "wrong").await;
        assert!(!app.resetting);
    }

    #[tokio::test]
    async fn foreign_timer_rejects_malformed_line() {
        let mut app = test_app();
        app.handle_command("velotrain/timer", "only;two").await;
        assert!(app.session_log.is_empty());
    }

    #[tokio::test]
    async fn foreign_timer_feeds_a_synthetic_passing() {
        let mut app = test_app();
        app.mp_names.insert("C4".into(), "C4".into());
        app.cf.mps.insert(
            "C4".into(),
            crate::config::MpConfig { ip: Some("10.0.0.1".into()), ..Default::default() },
        );
        app.handle_command("velotrain/timer", "1;C4;STA;90001;00:00:10.000").await;
        assert_eq!(app.session_log.len(), 1);
        assert_eq!(app.session_log[0].refid, "90001");
    }
}
