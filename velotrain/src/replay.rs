//! Replay and query (C7). Grounded on `_replay`/`_checkrequest` and the
//! `val2*` filter parsers in the reference implementation.

use serde_json::Value;
use tracing::{debug, info, warn};

use velotrain_proto::ProcessedPassing;

use crate::engine::App;

#[derive(Debug, Default, Clone)]
pub struct ReplayFilter {
    pub index: Option<(Option<u64>, Option<u64>)>,
    pub time: Option<(Option<String>, Option<String>)>,
    pub mpid: Option<Vec<String>>,
    pub refid: Option<Vec<String>>,
    pub marker: Option<Vec<String>>,
}

fn val2strset(val: &Value) -> Option<Vec<String>> {
    let mut out = Vec::new();
    match val {
        Value::Array(items) => {
            for item in items {
                let s = value_to_string(item);
                if !s.is_empty() {
                    out.push(s);
                }
            }
        }
        other => {
            let s = value_to_string(other);
            if !s.is_empty() {
                out.push(s);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn val2mpidset(val: &Value) -> Option<Vec<String>> {
    let to_mpid = |v: &Value| -> Option<String> {
        let s = value_to_string(v);
        let digits = s.trim_start_matches(['C', 'c']).to_string();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            None
        } else {
            Some(digits)
        }
    };
    let mut out = Vec::new();
    match val {
        Value::Array(items) => {
            for item in items {
                if let Some(m) = to_mpid(item) {
                    out.push(m);
                }
            }
        }
        other => {
            if let Some(m) = to_mpid(other) {
                out.push(m);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn val2indexrange(val: &Value) -> Option<(Option<u64>, Option<u64>)> {
    let to_posint = |v: &Value| -> Option<u64> {
        match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    };
    match val {
        Value::Array(items) => match items.len() {
            1 => to_posint(&items[0]).map(|s| (Some(s), None)),
            2 => {
                let mut sid = to_posint(&items[0]);
                let mut fid = to_posint(&items[1]);
                if let (Some(s), Some(f)) = (sid, fid) {
                    if s > f {
                        std::mem::swap(&mut sid, &mut fid);
                    }
                }
                if sid.is_some() || fid.is_some() {
                    Some((sid, fid))
                } else {
                    None
                }
            }
            _ => {
                debug!(?val, "invalid index range ignored");
                None
            }
        },
        other => to_posint(other).map(|s| (Some(s), Some(s))),
    }
}

fn val2timerange(val: &Value) -> Option<(Option<String>, Option<String>)> {
    let parse = |v: &Value| -> Option<String> {
        value_to_string(v).parse::<velotrain_proto::Tod>().ok().map(|t| t.to_string())
    };
    match val {
        Value::Array(items) => match items.len() {
            1 => parse(&items[0]).map(|s| (Some(s), None)),
            2 => {
                let mut stime = parse(&items[0]);
                let mut ftime = parse(&items[1]);
                if let (Some(s), Some(f)) = (&stime, &ftime) {
                    if s > f {
                        std::mem::swap(&mut stime, &mut ftime);
                    }
                }
                if stime.is_some() || ftime.is_some() {
                    Some((stime, ftime))
                } else {
                    None
                }
            }
            _ => {
                debug!(?val, "invalid time range ignored");
                None
            }
        },
        other => parse(other).map(|s| (Some(s), None)),
    }
}

impl App {
    /// Parses a `request` command body into a replay filter and runs it.
    /// Always attempts to emit *something*, even on a malformed body.
    pub async fn check_request(&mut self, msg: &str) {
        let mut serial = None;
        let mut filter = ReplayFilter::default();

        match serde_json::from_str::<Value>(msg) {
            Ok(Value::Object(req)) => {
                if let Some(s) = req.get("serial") {
                    serial = Some(value_to_string(s));
                    debug!(serial, "requested replay to serial");
                }
                if let Some(v) = req.get("refid") {
                    filter.refid = val2strset(v);
                }
                if let Some(v) = req.get("marker") {
                    filter.marker = val2strset(v);
                }
                if let Some(v) = req.get("mpid") {
                    filter.mpid = val2mpidset(v);
                }
                if let Some(v) = req.get("time") {
                    filter.time = val2timerange(v);
                }
                if let Some(v) = req.get("index") {
                    filter.index = val2indexrange(v);
                }
                debug!(?filter, "request filter");
            }
            Ok(other) => warn!(?other, "invalid request object"),
            Err(e) => warn!(error = %e, "error reading request"),
        }
        self.replay(serial.as_deref(), &filter).await;
    }

    pub async fn replay(&mut self, serial: Option<&str>, filters: &ReplayFilter) {
        let log = &self.session_log;
        let plen = log.len();
        let mut rep: Vec<ProcessedPassing> = Vec::new();
        let mut i = 0usize;
        while i < plen {
            let mut sid = i;
            let mut fid = plen;

            if let Some(markers) = &filters.marker {
                while i < plen {
                    let r = &log[i];
                    i += 1;
                    if r.refid == "marker" && r.text.as_deref().is_some_and(|t| markers.iter().any(|m| m == t)) {
                        break;
                    } else {
                        sid = i;
                    }
                }
                while i < plen {
                    let r = &log[i];
                    if r.refid == "marker" {
                        fid = i;
                        break;
                    } else {
                        i += 1;
                        fid = i;
                    }
                }
            }

            if sid < fid {
                let mut rs = sid as u64;
                let mut rf = fid as u64;
                if let Some((lo, hi)) = filters.index {
                    if let Some(lo) = lo {
                        if lo > rs {
                            rs = lo.min(plen as u64);
                        }
                    }
                    if let Some(hi) = hi {
                        if hi < rf {
                            rf = (hi + 1).min(plen as u64);
                        }
                    }
                }
                if rs < rf {
                    debug!(rs, rf, plen, "replay range");
                    let mut j = rs as usize;
                    while j < rf as usize {
                        let r = &log[j];
                        let mut ok = true;
                        if let Some((lo, hi)) = &filters.time {
                            if let Some(lo) = lo {
                                if &r.time < lo {
                                    ok = false;
                                }
                            }
                            if let Some(hi) = hi {
                                if &r.time > hi {
                                    ok = false;
                                }
                            }
                        }
                        if let Some(mpids) = &filters.mpid {
                            if !mpids.contains(&r.mpid) {
                                ok = false;
                            }
                        } else if let Some(refids) = &filters.refid {
                            if !refids.contains(&r.refid) {
                                ok = false;
                            }
                        }
                        if ok {
                            rep.push(log[j].clone());
                        }
                        j += 1;
                    }
                }
            }
            i = fid;
        }

        let topic = match serial {
            Some(s) => format!("{}/replay/{}", self.cf.basetopic, s),
            None => format!("{}/replay", self.cf.basetopic),
        };
        info!(count = rep.len(), topic, "replaying passings");
        let payload = serde_json::to_value(&rep).unwrap_or_else(|_| Value::Array(Vec::new()));
        self.bus.publish_json(&topic, payload, false).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use velotrain_proto::Tod;

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

    fn record(refid: &str, text: Option<&str>) -> ProcessedPassing {
        ProcessedPassing {
            index: 0,
            date: "2026-08-01".into(),
            time: Tod::ZERO.to_string(),
            mpid: "1".into(),
            refid: refid.into(),
            env: None,
            moto: None,
            elap: None,
            lap: None,
            half: None,
            qtr: None,
            split_200: None,
            split_100: None,
            split_50: None,
            text: text.map(|s| s.to_string()),
        }
    }

    fn record_at(refid: &str, time: &str) -> ProcessedPassing {
        ProcessedPassing { time: time.to_string(), ..record(refid, None) }
    }

    #[derive(Default)]
    struct CapturingBus {
        last: std::sync::Mutex<Option<Value>>,
    }

    #[async_trait::async_trait]
    impl crate::bus::Bus for CapturingBus {
        async fn publish_json(&self, _topic: &str, obj: Value, _retain: bool) {
            *self.last.lock().unwrap() = Some(obj);
        }
        async fn subscribe(&self, _topic: &str) {}
    }

    #[tokio::test]
    async fn marker_filter_returns_only_the_bracketed_run() {
        let bus = Arc::new(CapturingBus::default());
        let mut app = test_app();
        app.bus = bus.clone();
        for i in 0..10u32 {
            let r = match i {
                3 => record("marker", Some("A")),
                7 => record("marker", Some("B")),
                _ => record(&format!("{}", 90000 + i), None),
            };
            app.session_log.push(r);
        }
        let filter = ReplayFilter {
            marker: Some(vec!["A".to_string()]),
            ..Default::default()
        };
        app.replay(None, &filter).await;
        let payload = bus.last.lock().unwrap().clone().unwrap();
        let entries = payload.as_array().unwrap();
        // the bracketing "A" marker itself is index 3; the range runs up to
        // (but excluding) the next marker at index 7.
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["refid"], "marker");
        assert_eq!(entries[1]["refid"], "90004");
        assert_eq!(entries[3]["refid"], "90006");
    }

    #[tokio::test]
    async fn two_sided_time_range_excludes_records_past_the_upper_bound() {
        let bus = Arc::new(CapturingBus::default());
        let mut app = test_app();
        app.bus = bus.clone();
        app.session_log.push(record_at("90001", "10:00:00.000"));
        app.session_log.push(record_at("90002", "10:30:00.000"));
        app.session_log.push(record_at("90003", "15:00:00.000"));
        let filter = ReplayFilter {
            time: Some((Some("10:00:00.000".to_string()), Some("11:00:00.000".to_string()))),
            ..Default::default()
        };
        app.replay(None, &filter).await;
        let payload = bus.last.lock().unwrap().clone().unwrap();
        let entries = payload.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["refid"], "90001");
        assert_eq!(entries[1]["refid"], "90002");
    }

    #[test]
    fn val2strset_collapses_empty_to_none() {
        assert!(val2strset(&Value::Array(vec![])).is_none());
        assert_eq!(val2strset(&Value::String("A".into())), Some(vec!["A".to_string()]));
    }

    #[test]
    fn val2indexrange_swaps_out_of_order_bounds() {
        let v = serde_json::json!([5, 2]);
        assert_eq!(val2indexrange(&v), Some((Some(2), Some(5))));
    }
}
