//! Network hub (C2): owns the one UDP socket shared by all decoder units.
//!
//! Runs as its own tokio task, reading with a 200 ms timeout and draining a
//! command queue between reads. Never touches application state directly —
//! everything flows out as an [`AppEvent`] on a channel consumed by the app
//! worker. Structurally this is `uwb_hub::start_uwb_hub` generalised to the
//! reference implementation's `prohub.run`/`prohub._command`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use velotrain_proto::{wire, RawPassing, Tod};

use crate::decoder_link::{DecoderEvent, DecoderLink};

const RECV_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_TICK_AFTER: u32 = 100;
const SYNC_TOLERANCE_MS: i64 = 20;

#[derive(Debug)]
pub enum HubCommand {
    Add { mpid: String, ip: String },
    Remove { ip: String },
    Write { cmd: Vec<u8>, ip: String },
    Sync { ip: Option<String> },
    AllStat,
    /// Merge the given flag updates into the unit's stored config and push it.
    Config { ip: String, updates: BTreeMap<u8, u32> },
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug)]
pub enum AppEvent {
    Passing(RawPassing),
    /// A bracket-frame noise-level status. Battery telemetry rides on
    /// [`AppEvent::Passing`]'s `low_battery`/`faulty_battery` flags instead,
    /// mirroring the reference implementation's separate passing-parser path.
    Status { source: String, refid: String, tod: Tod },
    /// An ack nudge was sent back to a decoder; surfaced so the app worker
    /// can publish it on the `<base>/ack` external interface.
    Ack { mpid: String },
    IdleTick(Tod),
}

pub struct NetHub {
    socket: UdpSocket,
    broadcast: SocketAddr,
    links: HashMap<String, DecoderLink>,
    events: mpsc::UnboundedSender<AppEvent>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    idle_ticks: u32,
}

impl NetHub {
    pub async fn bind(
        addr: &str,
        port: u16,
        bcast: &str,
        events: mpsc::UnboundedSender<AppEvent>,
        commands: mpsc::UnboundedReceiver<HubCommand>,
    ) -> std::io::Result<Self> {
        let bind_addr = format!("{}:{}", addr, port);
        let socket = UdpSocket::bind(&bind_addr).await?;
        socket.set_broadcast(true)?;
        info!("decoder hub listening on {}", bind_addr);
        let broadcast: SocketAddr = format!("{}:{}", bcast, port)
            .parse()
            .unwrap_or_else(|_| format!("255.255.255.255:{}", port).parse().unwrap());
        Ok(NetHub {
            socket,
            broadcast,
            links: HashMap::new(),
            events,
            commands,
            idle_ticks: 0,
        })
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) => {
                    self.idle_ticks = 0;
                    self.on_datagram(src, &buf[..len]);
                }
                Ok(Err(e)) => {
                    error!("decoder hub socket error: {}", e);
                }
                Err(_timeout) => {
                    self.idle_ticks += 1;
                    if self.idle_ticks > IDLE_TICK_AFTER {
                        self.idle_ticks = 0;
                        let _ = self.events.send(AppEvent::IdleTick(Tod::now()));
                    }
                }
            }

            while let Ok(cmd) = self.commands.try_recv() {
                if self.dispatch(cmd).await {
                    return;
                }
            }
        }
    }

    fn on_datagram(&mut self, src: SocketAddr, data: &[u8]) {
        let ip = src.ip().to_string();
        let mpid = match self.links.get(&ip) {
            Some(link) => link.mpid.clone(),
            None => {
                debug!("datagram from unassociated unit {}", ip);
                return;
            }
        };
        let link = self.links.get_mut(&ip).unwrap();
        for event in link.feed(data) {
            match event {
                DecoderEvent::Passing(mut p) => {
                    p.source = Some(mpid.clone());
                    let _ = self.events.send(AppEvent::Passing(p));
                }
                DecoderEvent::Status { tod, refid } => {
                    let _ = self.events.send(AppEvent::Status {
                        source: mpid.clone(),
                        refid,
                        tod,
                    });
                }
                DecoderEvent::Config(_cfg) => {
                    // configuration is read back via the link; app layer
                    // only needs the decoder event path for passings/status.
                }
                DecoderEvent::NeedsAck => {
                    self.write(wire::ACK_CMD.to_vec(), &ip);
                    let _ = self.events.send(AppEvent::Ack { mpid: mpid.clone() });
                }
            }
        }
    }

    fn write(&self, cmd: Vec<u8>, ip: &str) {
        if let Ok(addr) = format!("{}:{}", ip, self.broadcast.port()).parse::<SocketAddr>() {
            if let Err(e) = self.socket.try_send_to(&cmd, addr) {
                warn!("decoder hub write to {} failed: {}", addr, e);
            }
        }
    }

    fn broadcast_write(&self, cmd: Vec<u8>) {
        if let Err(e) = self.socket.try_send_to(&cmd, self.broadcast) {
            warn!("decoder hub broadcast write failed: {}", e);
        }
    }

    /// Returns `true` if the hub should stop running.
    async fn dispatch(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Add { mpid, ip } => {
                self.links.insert(ip.clone(), DecoderLink::new(mpid, ip.clone()));
                self.write(wire::QUE_CMD.to_vec(), &ip);
            }
            HubCommand::Remove { ip } => {
                self.links.remove(&ip);
            }
            HubCommand::Write { cmd, ip } => {
                self.write(cmd, &ip);
            }
            HubCommand::Sync { ip } => {
                let mut now = Tod::now();
                while (now - now.truncate()).as_millis().abs() > SYNC_TOLERANCE_MS {
                    now = Tod::now();
                }
                let cmd = wire::set_time_command(now);
                match ip {
                    Some(ip) => self.write(cmd, &ip),
                    None => self.broadcast_write(cmd),
                }
            }
            HubCommand::AllStat => {
                self.broadcast_write(wire::STAT_CMD.to_vec());
            }
            HubCommand::Config { ip, updates } => {
                if let Some(link) = self.links.get_mut(&ip) {
                    link.config.extend(updates);
                    let block = link.serialise_config();
                    let mut cmd = vec![0x08, 0x08];
                    cmd.extend_from_slice(&block);
                    let framed = wire::frame_v3_command(&cmd);
                    let (sta, bxx) = link.level_commands();
                    self.write(framed, &ip);
                    self.write(sta, &ip);
                    self.write(bxx, &ip);
                } else {
                    warn!("config requested for unknown unit {}", ip);
                }
            }
            HubCommand::Barrier(tx) => {
                let _ = tx.send(());
            }
            HubCommand::Shutdown => {
                return true;
            }
        }
        false
    }
}
