//! Static per-session sector geometry (C3): a ring of measurement points
//! with sector lengths and min/max transit times, plus named splits.

use std::collections::HashMap;

use velotrain_proto::Tod;

use crate::config::Config;

/// distance (m) / rate (km/h) -> time
fn dr2t(dist: f64, rate_kmh: f64) -> Tod {
    let rate_ms = rate_kmh / 3.6;
    Tod::from_secs_f64(dist / rate_ms)
}

#[derive(Debug, Clone)]
pub struct SplitEntry {
    pub src: String,
    pub min: Tod,
    pub max: Tod,
    pub len: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MpEntry {
    pub prev: Option<String>,
    pub next: Option<String>,
    pub slen: Option<f64>,
    pub mintime: Option<Tod>,
    pub maxtime: Option<Tod>,
    pub lap: Option<SplitEntry>,
    pub half: Option<SplitEntry>,
    pub qtr: Option<SplitEntry>,
    pub split_200: Option<SplitEntry>,
    pub split_100: Option<SplitEntry>,
    pub split_50: Option<SplitEntry>,
}

impl MpEntry {
    /// Looks up a named split by the same key used in the processed-passing
    /// payload (`"lap"`, `"half"`, `"qtr"`, `"200"`, `"100"`, `"50"`).
    pub fn split(&self, name: &str) -> Option<&SplitEntry> {
        match name {
            "lap" => self.lap.as_ref(),
            "half" => self.half.as_ref(),
            "qtr" => self.qtr.as_ref(),
            "200" => self.split_200.as_ref(),
            "100" => self.split_100.as_ref(),
            "50" => self.split_50.as_ref(),
            _ => None,
        }
    }
}

pub const SPLIT_NAMES: &[&str] = &["lap", "half", "qtr", "200", "100", "50"];

#[derive(Debug, Clone, Default)]
pub struct SectorMap {
    pub mps: HashMap<String, MpEntry>,
    pub gate: Option<MpEntry>,
}

impl SectorMap {
    pub fn get(&self, mpid: &str) -> Option<&MpEntry> {
        self.mps.get(mpid)
    }

    /// Rebuilds the full sector map from configuration. Mirrors the
    /// reference implementation's two-pass approach: first a full
    /// pairwise sector-length table, then a ring walk over the declared
    /// sequence wiring `prev`/`next`/`slen`/`mintime`/`maxtime` and named
    /// splits.
    pub fn build(cf: &Config) -> SectorMap {
        let configured: Vec<&str> = cf
            .mpseq
            .iter()
            .filter(|d| cf.mps.get(d.as_str()).map(|m| m.ip.is_some()).unwrap_or(false))
            .map(|s| s.as_str())
            .collect();

        // pairwise sector lengths, keyed by (src, dst)
        let mut seclen: HashMap<(String, String), f64> = HashMap::new();
        for &sc in &configured {
            for &dc in &configured {
                if sc == dc {
                    seclen.insert((sc.to_string(), dc.to_string()), cf.laplen);
                    continue;
                }
                let smp = &cf.mps[sc];
                let dmp = &cf.mps[dc];
                if let (Some(soft), Some(doft)) = (smp.offset, dmp.offset) {
                    let len = if soft < doft {
                        doft - soft
                    } else {
                        cf.laplen - soft + doft
                    };
                    seclen.insert((sc.to_string(), dc.to_string()), len);
                }
            }
        }

        let mut map = SectorMap::default();
        let mut first: Option<String> = None;
        let mut last: Option<String> = None;
        let mut prev: Option<String> = None;

        for d in &configured {
            let d = d.to_string();
            let mut entry = MpEntry::default();
            let mdef = &cf.mps[&d];

            for &split in SPLIT_NAMES {
                let spid = if split == "lap" {
                    Some(d.clone())
                } else {
                    match split {
                        "half" => mdef.half.clone(),
                        "qtr" => mdef.qtr.clone(),
                        "200" => mdef.split_200.clone(),
                        "100" => mdef.split_100.clone(),
                        "50" => mdef.split_50.clone(),
                        _ => None,
                    }
                };
                if let Some(spid) = spid {
                    if configured.contains(&spid.as_str()) {
                        if let Some(&len) = seclen.get(&(spid.clone(), d.clone())) {
                            let sm = SplitEntry {
                                src: spid,
                                min: dr2t(len, cf.maxspeed),
                                max: dr2t(len, cf.minspeed),
                                len,
                            };
                            match split {
                                "lap" => entry.lap = Some(sm),
                                "half" => entry.half = Some(sm),
                                "qtr" => entry.qtr = Some(sm),
                                "200" => entry.split_200 = Some(sm),
                                "100" => entry.split_100 = Some(sm),
                                "50" => entry.split_50 = Some(sm),
                                _ => {}
                            }
                        }
                    }
                }
            }

            if first.is_none() {
                first = Some(d.clone());
            }
            last = Some(d.clone());

            if let Some(p) = &prev {
                let len = seclen[&(p.clone(), d.clone())];
                entry.prev = Some(p.clone());
                entry.slen = Some(len);
                entry.mintime = Some(dr2t(len, cf.maxspeed));
                entry.maxtime = Some(dr2t(len, cf.minspeed));
                map.mps.get_mut(p).unwrap().next = Some(d.clone());
            }

            map.mps.insert(d.clone(), entry);
            prev = Some(d);
        }

        if let (Some(first), Some(last)) = (&first, &last) {
            if first != last {
                let len = seclen[&(last.clone(), first.clone())];
                map.mps.get_mut(last).unwrap().next = Some(first.clone());
                let first_entry = map.mps.get_mut(first).unwrap();
                first_entry.prev = Some(last.clone());
                first_entry.slen = Some(len);
                first_entry.mintime = Some(dr2t(len, cf.maxspeed));
                first_entry.maxtime = Some(dr2t(len, cf.minspeed));
            }
        }

        if let Some(gatesrc) = &cf.gatesrc {
            if configured.contains(&gatesrc.as_str()) {
                if let Some(next) = map.mps.get(gatesrc).and_then(|e| e.next.clone()) {
                    if let Some(&len) = seclen.get(&(gatesrc.clone(), next.clone())) {
                        map.gate = Some(MpEntry {
                            prev: None,
                            next: Some(next),
                            slen: Some(len),
                            mintime: Some(dr2t(len, cf.maxgate)),
                            maxtime: Some(dr2t(len, cf.mingate)),
                            ..Default::default()
                        });
                    }
                }
            }
        }

        map
    }
}
