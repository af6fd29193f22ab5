//! Derived statistics recomputed after every merge that changes the collection.

use serde::Serialize;
use std::collections::BTreeMap;
use threatwatch_core::{Severity, ThreatRecord};

/// Risk score at or above which a record counts as high risk.
pub const HIGH_RISK_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreatStats {
    pub total: usize,
    pub malicious: usize,
    pub benign: usize,
    pub unclassified: usize,
    pub high_risk: usize,
    pub mean_risk_score: Option<f64>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_attack_type: BTreeMap<String, usize>,
    pub by_action: BTreeMap<String, usize>,
    pub by_protocol: BTreeMap<String, usize>,
    pub geo: GeoIndex,
}

impl ThreatStats {
    pub fn from_records(records: &[ThreatRecord]) -> ThreatStats {
        let mut s = ThreatStats { total: records.len(), ..ThreatStats::default() };
        let mut risk_sum = 0.0;
        let mut risk_n = 0usize;
        for r in records {
            match r.is_malicious() {
                Some(true) => s.malicious += 1,
                Some(false) => s.benign += 1,
                None => s.unclassified += 1,
            }
            if let Some(score) = r.risk_score {
                risk_sum += score;
                risk_n += 1;
                if score >= HIGH_RISK_THRESHOLD { s.high_risk += 1; }
            }
            *s.by_severity.entry(r.severity()).or_default() += 1;
            bump(&mut s.by_attack_type, r.attack_type.as_deref());
            bump(&mut s.by_action, r.action_taken.as_deref());
            bump(&mut s.by_protocol, r.protocol.as_deref());
            s.geo.insert(r.geo_location.as_deref());
        }
        if risk_n > 0 { s.mean_risk_score = Some(risk_sum / risk_n as f64); }
        s
    }
}

fn bump(map: &mut BTreeMap<String, usize>, key: Option<&str>) {
    let key = key.unwrap_or(threatwatch_core::UNKNOWN);
    *map.entry(key.to_string()).or_default() += 1;
}

/// Event counts per location, keyed on the city part of `"City, Region"` strings.
///
/// Built once per collection change and owned by the stats value that produced it; no
/// process-wide lookup table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GeoIndex {
    counts: BTreeMap<String, usize>,
}

impl GeoIndex {
    pub fn insert(&mut self, location: Option<&str>) {
        if let Some(city) = location.and_then(city_of) {
            *self.counts.entry(city).or_default() += 1;
        }
    }

    pub fn count(&self, location: &str) -> usize {
        city_of(location).and_then(|c| self.counts.get(&c).copied()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Busiest locations first; ties broken alphabetically.
    pub fn top(&self, n: usize) -> Vec<(&str, usize)> {
        let mut v: Vec<(&str, usize)> = self.counts.iter().map(|(k, c)| (k.as_str(), *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        v.truncate(n);
        v
    }
}

fn city_of(location: &str) -> Option<String> {
    let city = location.split(',').next()?.trim();
    if city.is_empty() { return None; }
    let mut out = String::with_capacity(city.len());
    for (i, word) in city.split_whitespace().enumerate() {
        if i > 0 { out.push(' '); }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
        }
    }
    Some(out)
}
