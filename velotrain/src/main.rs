mod bus;
mod config;
mod control;
mod decoder_link;
mod dhi;
mod engine;
mod env;
mod error;
mod net_hub;
mod queue_state;
mod replay;
mod reset;
mod sector_map;
mod system_pass;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use bus::LoggingBus;
use config::Config;
use dhi::DhiSink;
use engine::App;
use env::NoEnv;
use net_hub::{AppEvent, HubCommand, NetHub};
use velotrain_proto::{Channel, RawPassing};

const CONFIG_ENV: &str = "VELOTRAIN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "velotrain.json";

async fn load_config() -> Result<Config> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cf = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path))?,
        Err(e) => {
            warn!(path, error = %e, "no config file found, using defaults");
            Config::default()
        }
    };
    cf.validate().context("configuration is invalid")?;
    Ok(cf)
}

fn build_app(cf: Config, hub: tokio::sync::mpsc::UnboundedSender<HubCommand>) -> App {
    let sector_map = sector_map::SectorMap::build(&cf);
    let mut mp_names = HashMap::new();
    for (chan, _) in cf.configured_mps() {
        let name = cf
            .mps
            .get(chan)
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| chan.to_string());
        mp_names.insert(chan.to_string(), name);
    }
    let gatesrc = cf.gatesrc.clone();
    let gatedelay = velotrain_proto::Tod::from_secs_f64(cf.gatedelay);
    let tomsrc = cf.top_of_minute_source();
    let syncmaster = cf
        .sync
        .clone()
        .filter(|s| cf.mps.get(s).and_then(|m| m.ip.as_ref()).is_some());
    let dhi = cf.dhi.as_ref().map(|d| DhiSink::new(d.host.clone(), d.port, &cf.dhiencoding));

    App {
        cf,
        bus: Arc::new(LoggingBus),
        env: Arc::new(NoEnv),
        dhi,
        hub,
        mp_names,
        sector_map,
        passq: HashMap::new(),
        session_log: Vec::new(),
        batteries: HashMap::new(),
        dstat: HashMap::new(),
        drifts: HashMap::new(),
        motos: HashMap::new(),
        gatesrc,
        gatedelay,
        tomsrc,
        syncmaster,
        gate: None,
        runstart: None,
        lastpass: None,
        offset: velotrain_proto::Tod::ZERO,
        resetting: false,
        reset_lock: Arc::new(tokio::sync::Mutex::new(())),
    }
}

async fn publish_offline(app: &App) {
    let offline = serde_json::json!({
        "date": null,
        "time": null,
        "offset": null,
        "env": null,
        "count": null,
        "gate": null,
        "battery": null,
        "units": null,
        "info": "offline",
    });
    app.bus
        .publish_json(&format!("{}/status", app.cf.basetopic), offline, true)
        .await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "velotrain=info".into()),
        )
        .init();

    info!("velotrain v{} starting", env!("CARGO_PKG_VERSION"));

    let cf = load_config().await?;

    let (hub_tx, hub_rx) = tokio::sync::mpsc::unbounded_channel::<HubCommand>();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<AppEvent>();

    let mut app = build_app(cf, hub_tx.clone());

    let hub = NetHub::bind(&app.cf.uaddr, app.cf.uport, &app.cf.bcast, event_tx, hub_rx)
        .await
        .context("binding decoder hub socket")?;

    for (chan, ip) in app.cf.configured_mps() {
        let _ = hub_tx.send(HubCommand::Add { mpid: chan.to_string(), ip: ip.to_string() });
    }

    tokio::spawn(hub.run());

    for topic in ["marker", "request", "reset", "resetunit", "timer"] {
        app.bus.subscribe(&format!("{}/{}", app.cf.basetopic, topic)).await;
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    info!("velotrain running, base topic {}", app.cf.basetopic);
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(AppEvent::Passing(p)) => app.raw_passing(p).await,
                    Some(AppEvent::Status { source, refid, tod }) => {
                        app.raw_status(&source, &refid, Channel::Sts);
                        let _ = tod;
                    }
                    Some(AppEvent::Ack { mpid }) => app.publish_ack(&mpid).await,
                    Some(AppEvent::IdleTick(now)) => {
                        app.raw_passing(RawPassing::idle_tick(now)).await;
                    }
                    None => {
                        warn!("hub event channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                let _ = hub_tx.send(HubCommand::Shutdown);
                break;
            }
        }
    }

    publish_offline(&app).await;
    Ok(())
}
