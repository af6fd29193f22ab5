//! Threat records as emitted by the classification workflow.
//!
//! Upstream payloads are loosely typed: fields go missing, ports arrive as strings and
//! the occasional entry is not an object at all. Decoding never rejects a record; a field
//! that cannot be read is simply absent and renders as [`UNKNOWN`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder rendered for any field the upstream did not supply.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatRecord {
    #[serde(alias = "uniqueId", alias = "Unique ID", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(alias = "Source IP Address", alias = "sourceIp", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(alias = "Destination IP Address", alias = "destinationIp", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    #[serde(alias = "Source Port", alias = "sourcePort", deserialize_with = "lenient::port", skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(alias = "Destination Port", alias = "destinationPort", deserialize_with = "lenient::port", skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(alias = "Protocol", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(alias = "Attack Type", alias = "attackType", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<String>,
    #[serde(alias = "Severity Level", alias = "severityLevel", alias = "severity", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<String>,
    #[serde(alias = "Attack Signature", alias = "attackSignature", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub attack_signature: Option<String>,
    #[serde(alias = "Action Taken", alias = "actionTaken", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,

    #[serde(alias = "riskScore", deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(alias = "reputationScore", alias = "abuseConfidenceScore", deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub reputation_score: Option<f64>,
    #[serde(alias = "isMalicious", deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub malicious: Option<bool>,
    #[serde(alias = "Classification", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(alias = "Confidence", deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(alias = "Timestamp", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(alias = "Geo-location Data", alias = "geoLocation", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub geo_location: Option<String>,
    #[serde(alias = "User Information", alias = "userInfo", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub user_info: Option<String>,
    #[serde(alias = "Device Information", alias = "deviceInfo", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    #[serde(alias = "Payload Data", alias = "payload", deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub payload_snippet: Option<String>,

    /// Fields this model does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Identity used for deduplication. Positional identity is stable only because the
/// accumulated list is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Id(String),
    Position(usize),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => write!(f, "{}", id),
            RecordKey::Position(i) => write!(f, "#{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    pub fn parse(s: &str) -> Severity {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" | "med" => Severity::Medium,
            "low" | "info" | "informational" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unknown => UNKNOWN,
        }
    }
}

impl ThreatRecord {
    /// Decode one entry of an accumulated result list. Non-object entries become an empty
    /// record carrying the raw value under `raw`, so list positions are preserved.
    ///
    /// Keys are folded onto their field names first. When a payload carries a field under
    /// two names (a dataset header and an enrichment key, say) the canonical name wins,
    /// then the first non-null alias.
    pub fn from_value(value: Value) -> ThreatRecord {
        match value {
            Value::Object(map) => {
                let folded = Value::Object(fold_aliases(map));
                serde_json::from_value(folded.clone()).unwrap_or_else(|_| ThreatRecord::raw(folded))
            }
            other => ThreatRecord::raw(other),
        }
    }

    fn raw(value: Value) -> ThreatRecord {
        let mut extra = BTreeMap::new();
        extra.insert("raw".to_string(), value);
        ThreatRecord { extra, ..ThreatRecord::default() }
    }

    pub fn key(&self, position: usize) -> RecordKey {
        match &self.unique_id {
            Some(id) => RecordKey::Id(id.clone()),
            None => RecordKey::Position(position),
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity_level.as_deref().map(Severity::parse).unwrap_or(Severity::Unknown)
    }

    pub fn is_malicious(&self) -> Option<bool> {
        self.malicious.or_else(|| {
            let label = self.classification.as_deref()?.to_ascii_lowercase();
            if label.contains("benign") || label.contains("false positive") || label.contains("clean") {
                Some(false)
            } else if label.contains("malicious") || label.contains("true positive") {
                Some(true)
            } else {
                None
            }
        })
    }

    /// Render one column, substituting [`UNKNOWN`] for absent values.
    pub fn render(&self, column: Column) -> String {
        let v = match column {
            Column::UniqueId => self.unique_id.clone(),
            Column::Timestamp => self.timestamp.clone(),
            Column::SourceIp => self.source_ip.clone(),
            Column::SourcePort => self.source_port.map(|p| p.to_string()),
            Column::DestinationIp => self.destination_ip.clone(),
            Column::DestinationPort => self.destination_port.map(|p| p.to_string()),
            Column::Protocol => self.protocol.clone(),
            Column::AttackType => self.attack_type.clone(),
            Column::Severity => self.severity_level.clone(),
            Column::Signature => self.attack_signature.clone(),
            Column::Action => self.action_taken.clone(),
            Column::RiskScore => self.risk_score.map(|v| format!("{:.1}", v)),
            Column::ReputationScore => self.reputation_score.map(|v| format!("{:.1}", v)),
            Column::Malicious => self.is_malicious().map(|b| b.to_string()),
            Column::Classification => self.classification.clone(),
            Column::Confidence => self.confidence.map(|v| format!("{:.2}", v)),
            Column::GeoLocation => self.geo_location.clone(),
            Column::UserInfo => self.user_info.clone(),
            Column::DeviceInfo => self.device_info.clone(),
            Column::Payload => self.payload_snippet.clone(),
        };
        v.unwrap_or_else(|| UNKNOWN.to_string())
    }
}

/// Every alternate name a field is accepted under. Mirrors the `alias` attributes above.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("unique_id", &["uniqueId", "Unique ID"]),
    ("source_ip", &["Source IP Address", "sourceIp"]),
    ("destination_ip", &["Destination IP Address", "destinationIp"]),
    ("source_port", &["Source Port", "sourcePort"]),
    ("destination_port", &["Destination Port", "destinationPort"]),
    ("protocol", &["Protocol"]),
    ("attack_type", &["Attack Type", "attackType"]),
    ("severity_level", &["Severity Level", "severityLevel", "severity"]),
    ("attack_signature", &["Attack Signature", "attackSignature"]),
    ("action_taken", &["Action Taken", "actionTaken"]),
    ("risk_score", &["riskScore"]),
    ("reputation_score", &["reputationScore", "abuseConfidenceScore"]),
    ("malicious", &["isMalicious"]),
    ("classification", &["Classification"]),
    ("confidence", &["Confidence"]),
    ("timestamp", &["Timestamp"]),
    ("geo_location", &["Geo-location Data", "geoLocation"]),
    ("user_info", &["User Information", "userInfo"]),
    ("device_info", &["Device Information", "deviceInfo"]),
    ("payload_snippet", &["Payload Data", "payload"]),
];

fn canonical_name(key: &str) -> Option<&'static str> {
    FIELD_ALIASES.iter().find(|(_, aliases)| aliases.contains(&key)).map(|(name, _)| *name)
}

/// Rename aliased keys to their field name so serde never sees one field twice.
fn fold_aliases(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    let mut aliased = Vec::new();
    for (key, value) in map {
        match canonical_name(&key) {
            Some(name) => aliased.push((name, value)),
            None => {
                out.insert(key, value);
            }
        }
    }
    for (name, value) in aliased {
        match out.get(name) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                out.insert(name.to_string(), value);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    UniqueId,
    Timestamp,
    SourceIp,
    SourcePort,
    DestinationIp,
    DestinationPort,
    Protocol,
    AttackType,
    Severity,
    Signature,
    Action,
    RiskScore,
    ReputationScore,
    Malicious,
    Classification,
    Confidence,
    GeoLocation,
    UserInfo,
    DeviceInfo,
    Payload,
}

impl Column {
    pub const ALL: [Column; 20] = [
        Column::UniqueId,
        Column::Timestamp,
        Column::SourceIp,
        Column::SourcePort,
        Column::DestinationIp,
        Column::DestinationPort,
        Column::Protocol,
        Column::AttackType,
        Column::Severity,
        Column::Signature,
        Column::Action,
        Column::RiskScore,
        Column::ReputationScore,
        Column::Malicious,
        Column::Classification,
        Column::Confidence,
        Column::GeoLocation,
        Column::UserInfo,
        Column::DeviceInfo,
        Column::Payload,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            Column::UniqueId => "unique_id",
            Column::Timestamp => "timestamp",
            Column::SourceIp => "source_ip",
            Column::SourcePort => "source_port",
            Column::DestinationIp => "destination_ip",
            Column::DestinationPort => "destination_port",
            Column::Protocol => "protocol",
            Column::AttackType => "attack_type",
            Column::Severity => "severity_level",
            Column::Signature => "attack_signature",
            Column::Action => "action_taken",
            Column::RiskScore => "risk_score",
            Column::ReputationScore => "reputation_score",
            Column::Malicious => "malicious",
            Column::Classification => "classification",
            Column::Confidence => "confidence",
            Column::GeoLocation => "geo_location",
            Column::UserInfo => "user_info",
            Column::DeviceInfo => "device_info",
            Column::Payload => "payload_snippet",
        }
    }
}

pub(crate) mod lenient {
    use super::ThreatRecord;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::String(s)) => {
                let t = s.trim();
                if t.is_empty() { None } else { Some(t.to_string()) }
            }
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn port<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
        .filter(|v: &f64| v.is_finite()))
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "malicious" => Some(true),
                "false" | "no" | "0" | "benign" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }

    /// Accumulated result lists: a missing or non-array value is an empty list.
    pub fn records<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ThreatRecord>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Array(items)) => items.into_iter().map(ThreatRecord::from_value).collect(),
            _ => Vec::new(),
        })
    }
}
