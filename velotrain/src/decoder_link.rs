//! Per-unit byte accumulator and frame dispatch (C1).
//!
//! One `DecoderLink` exists per configured measurement point. It owns the
//! unit's read buffer, its last-known configuration, and the running
//! checksum-error count used to detect a stuck decoder.

use std::collections::BTreeMap;

use velotrain_proto::wire::{self, DecoderConfigFrame, ParsedFrame, WireError};
use velotrain_proto::RawPassing;

use crate::config::DEFAULT_PASS_LEVEL;

#[derive(Debug)]
pub enum DecoderEvent {
    Passing(RawPassing),
    Status { tod: velotrain_proto::Tod, refid: String },
    Config(DecoderConfigFrame),
    /// Decoder needs an ack nudge (either a good passing, or 3+ consecutive
    /// checksum failures).
    NeedsAck,
}

pub struct DecoderLink {
    pub mpid: String,
    pub ip: String,
    pub passlevel: u8,
    pub config: BTreeMap<u8, u32>,
    pub unit_no: Option<String>,
    pub version: Option<u8>,
    readbuf: Vec<u8>,
    cksum_err: u32,
}

impl DecoderLink {
    pub fn new(mpid: String, ip: String) -> Self {
        DecoderLink {
            mpid,
            ip,
            passlevel: DEFAULT_PASS_LEVEL,
            config: BTreeMap::new(),
            unit_no: None,
            version: None,
            readbuf: Vec::new(),
            cksum_err: 0,
        }
    }

    /// Appends newly-received bytes and parses as many complete frames as
    /// are available, returning the events they produced in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecoderEvent> {
        self.readbuf.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            let (parsed, rest) = wire::take_frame(&self.readbuf);
            let consumed = self.readbuf.len() - rest.len();
            match parsed {
                None => break,
                Some(result) => {
                    self.readbuf.drain(..consumed);
                    match result {
                        Ok(ParsedFrame::Passing(p)) => {
                            self.cksum_err = 0;
                            events.push(DecoderEvent::Passing(p));
                            events.push(DecoderEvent::NeedsAck);
                        }
                        Ok(ParsedFrame::SpuriousPassing) => {
                            events.push(DecoderEvent::NeedsAck);
                        }
                        Ok(ParsedFrame::Status { tod, refid }) => {
                            events.push(DecoderEvent::Status { tod, refid });
                        }
                        Ok(ParsedFrame::Config(bytes)) => {
                            if let Ok(cfg) = wire::parse_config_frame(&bytes) {
                                self.unit_no = Some(cfg.unit_no.clone());
                                self.version = Some(cfg.version);
                                self.config = cfg.flags.clone();
                                events.push(DecoderEvent::Config(cfg));
                            }
                        }
                        Ok(ParsedFrame::Ignored) => {}
                        Err(WireError::Checksum { .. }) => {
                            self.cksum_err += 1;
                            if self.cksum_err > 3 {
                                events.push(DecoderEvent::NeedsAck);
                            }
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        events
    }

    /// Serialises the current config map into the 27-byte wire block.
    pub fn serialise_config(&self) -> [u8; wire::CONFIG_LEN] {
        wire::serialise_config(&self.config)
    }

    pub fn level_commands(&self) -> (Vec<u8>, Vec<u8>) {
        (
            wire::level_command(wire::STA_LVL, self.passlevel),
            wire::level_command(wire::BOX_LVL, self.passlevel),
        )
    }
}
