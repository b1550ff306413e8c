//! Full and single-unit decoder reset (C6). Grounded on `_resethub`/
//! `_resetunit` in the reference implementation. The non-reentrant guard
//! (`_rlock.acquire(False)`) becomes `Mutex::try_lock`; the command-queue
//! drain (`cqueue.join()`) becomes a [`crate::net_hub::HubCommand::Barrier`]
//! round trip.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use velotrain_proto::{wire, Tod};

use crate::engine::App;
use crate::net_hub::HubCommand;
use crate::sector_map::SectorMap;

fn decoder_sane() -> BTreeMap<u8, u32> {
    let mut m = BTreeMap::new();
    m.insert(wire::CONFIG_TOD, 1);
    m.insert(wire::CONFIG_GPS, 0);
    m.insert(wire::CONFIG_ACTIVE_LOOP, 0);
    m.insert(wire::CONFIG_MAX, 1);
    m.insert(wire::CONFIG_PROT, 0);
    m.insert(wire::CONFIG_CELLSYNC, 0);
    m.insert(wire::CONFIG_PULSE, 0);
    m.insert(wire::CONFIG_PRINT, 0);
    m.insert(wire::CONFIG_TZ_HOUR, 0);
    m.insert(wire::CONFIG_TZ_MIN, 0);
    m
}

impl App {
    fn send(&self, cmd: HubCommand) {
        let _ = self.hub.send(cmd);
    }

    /// Blocks until every command queued on the hub ahead of this call has
    /// been dispatched.
    async fn hub_wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.hub.send(HubCommand::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn ip_of(&self, chan: &str) -> Option<String> {
        self.cf.mps.get(chan).and_then(|m| m.ip.clone())
    }

    /// Stops, reconfigures and restarts a single unit without touching the
    /// session log. No-op on the sync master, which must always be reset as
    /// part of a full reset.
    pub async fn reset_unit(&mut self, unit: &str) {
        let ip = match self.ip_of(unit) {
            Some(ip) if Some(unit) != self.syncmaster.as_deref() => ip,
            _ => {
                info!(mp = unit, "unable to reset unit");
                return;
            }
        };
        debug!(mp = unit, ip, "stop and reset unit");
        self.send(HubCommand::Write { cmd: wire::QUE_CMD.to_vec(), ip: ip.clone() });
        self.hub_wait().await;
        self.send(HubCommand::Config { ip: ip.clone(), updates: decoder_sane() });
        self.send(HubCommand::Write { cmd: wire::STOP_CMD.to_vec(), ip: ip.clone() });
        self.send(HubCommand::Write { cmd: wire::START_CMD.to_vec(), ip: ip.clone() });
        self.hub_wait().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.send(HubCommand::Sync { ip: Some(ip) });
        debug!(mp = unit, "unit restarted");
    }

    /// Clears the session log and resets every attached decoder to a
    /// common sync point at the next top of minute. Returns `false` if a
    /// reset is already in progress, or if no sync master is configured
    /// (rough sync only).
    pub async fn full_reset(&mut self) -> bool {
        let guard = match self.reset_lock.clone().try_lock_owned() {
            Ok(g) => g,
            Err(_) => {
                info!("clear/reset already in progress");
                return false;
            }
        };
        let ret = self.run_full_reset().await;
        drop(guard);
        ret
    }

    async fn run_full_reset(&mut self) -> bool {
        info!("starting reset procedure, operation paused");
        self.resetting = true;

        let chans: Vec<String> = self.mp_names.keys().cloned().collect();
        for chan in &chans {
            let ip = match self.ip_of(chan) {
                Some(ip) => ip,
                None => continue,
            };
            debug!(mp = chan, ip, "stop and reset");
            self.send(HubCommand::Write { cmd: wire::STOP_CMD.to_vec(), ip: ip.clone() });
            self.hub_wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.send(HubCommand::Write { cmd: wire::QUE_CMD.to_vec(), ip: ip.clone() });
            self.hub_wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.send(HubCommand::Config { ip, updates: decoder_sane() });
            self.hub_wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.session_log.clear();
        self.batteries.clear();
        self.sector_map = SectorMap::build(&self.cf);

        let mut resid = Tod::now().as_millis() / 1000 % 60;
        while resid > 40 {
            debug!(resid, "reset waiting for top of minute");
            tokio::time::sleep(Duration::from_secs((62 - resid) as u64)).await;
            resid = Tod::now().as_millis() / 1000 % 60;
        }
        let now_secs = Tod::now().as_millis() / 1000;
        let next_minute_secs = 60 + 60 * (now_secs / 60);
        let nt = Tod::from_millis(next_minute_secs * 1000);
        let hr = nt.as_millis() / (3_600 * 1000);
        let mn = (nt.as_millis() / (60 * 1000)) % 60;
        info!(hr, mn, "reset sync time");

        for chan in &chans {
            if Some(chan.as_str()) == self.syncmaster.as_deref() {
                continue;
            }
            let ip = match self.ip_of(chan) {
                Some(ip) => ip,
                None => continue,
            };
            let active = self.cf.mps.get(chan).map(|m| m.active).unwrap_or(false);
            let mut confchg = BTreeMap::new();
            confchg.insert(wire::CONFIG_PULSE, 0);
            confchg.insert(wire::CONFIG_ACTIVE_LOOP, active as u32);
            confchg.insert(wire::CONFIG_CELLTOD_HOUR, hr as u32);
            confchg.insert(wire::CONFIG_CELLTOD_MIN, mn as u32);
            confchg.insert(wire::CONFIG_CELLSYNC, 1);
            debug!(mp = chan, active, "updating sync time on unit");
            self.send(HubCommand::Config { ip, updates: confchg });
        }

        let ret = if let Some(master) = self.syncmaster.clone() {
            if let Some(ip) = self.ip_of(&master) {
                debug!(mp = master, "starting sync master");
                self.send(HubCommand::Write { cmd: wire::START_CMD.to_vec(), ip: ip.clone() });
                self.hub_wait().await;
                self.send(HubCommand::Sync { ip: None });
                self.hub_wait().await;
                let mut confchg = BTreeMap::new();
                confchg.insert(wire::CONFIG_PULSE, 1);
                confchg.insert(wire::CONFIG_ACTIVE_LOOP, 0);
                self.send(HubCommand::Config { ip, updates: confchg });
                self.hub_wait().await;
                true
            } else {
                error!(mp = master, "sync master has no configured ip");
                false
            }
        } else {
            warn!("no sync master set, using rough sync");
            self.send(HubCommand::Write { cmd: wire::START_CMD.to_vec(), ip: self.cf.bcast.clone() });
            self.hub_wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.send(HubCommand::Sync { ip: None });
            self.hub_wait().await;
            false
        };

        self.resetting = false;
        ret
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use velotrain_proto::Tod;

    use crate::bus::LoggingBus;
    use crate::config::{Config, MpConfig};
    use crate::env::NoEnv;
    use crate::sector_map::SectorMap;

    use super::*;

    fn test_app(cf: Config) -> (App, tokio::sync::mpsc::UnboundedReceiver<HubCommand>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<HubCommand>();
        let sector_map = SectorMap::build(&cf);
        let mut mp_names = HashMap::new();
        for (chan, _) in cf.configured_mps() {
            mp_names.insert(chan.to_string(), chan.to_string());
        }
        let app = App {
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
            gatedelay: Tod::ZERO,
            tomsrc: None,
            syncmaster: None,
            gate: None,
            runstart: None,
            lastpass: None,
            offset: Tod::ZERO,
            resetting: false,
            reset_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        (app, rx)
    }

    fn base_config() -> Config {
        let mut cf = Config::default();
        cf.mps.insert(
            "C1".to_string(),
            MpConfig { ip: Some("10.0.0.1".into()), ..Default::default() },
        );
        cf
    }

    #[tokio::test]
    async fn reset_unit_is_refused_for_the_sync_master() {
        let cf = base_config();
        let (mut app, mut rx) = test_app(cf);
        app.syncmaster = Some("C1".into());
        app.reset_unit("C1").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_reset_refuses_to_run_concurrently() {
        let cf = base_config();
        let (mut app, _rx) = test_app(cf);
        let _held = app.reset_lock.clone().try_lock_owned().unwrap();
        assert!(!app.full_reset().await);
    }
}
