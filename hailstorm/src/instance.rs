use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a remote compute instance, normalized across providers.
/// The "state" field carries the provider-native state name (e.g. EC2
/// "running", GCE "RUNNING", Packet "active"); managers own the mapping.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Instance {
    pub provider: String,
    pub instance_id: String,
    /// Represents the data format in RFC3339.
    /// ref. https://serde.rs/custom-date-format.html
    #[serde(with = "rfc3339_format")]
    pub launched_at_utc: DateTime<Utc>,
    pub state: String,
    pub availability_zone: String,
    pub public_hostname: String,
    pub public_ipv4: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// ref. https://serde.rs/custom-date-format.html
pub mod rfc3339_format {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom) {
            Ok(dt) => Ok(Utc.from_utc_datetime(&dt.naive_utc())),
            Err(e) => Err(e),
        }
    }
}

/// Scale-down selection: keeps the "count" most recently launched instances
/// (descending sort by launch time, clamped to what is available). A count
/// of zero selects everything, making teardown-all the default.
pub fn newest(mut instances: Vec<Instance>, count: usize) -> Vec<Instance> {
    if count == 0 || count >= instances.len() {
        return instances;
    }
    instances.sort_by(|a, b| b.launched_at_utc.cmp(&a.launched_at_utc));
    instances.truncate(count);
    instances
}

#[cfg(test)]
fn test_instance(id: &str, launched_at_secs: i64) -> Instance {
    Instance {
        provider: String::from("ec2"),
        instance_id: String::from(id),
        launched_at_utc: DateTime::from_timestamp(launched_at_secs, 0).unwrap(),
        state: String::from("running"),
        availability_zone: String::from("us-west-2a"),
        public_hostname: String::new(),
        public_ipv4: String::new(),
        tags: HashMap::new(),
    }
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- instance::test_newest_scale_down --exact --show-output
#[test]
fn test_newest_scale_down() {
    let _ = env_logger::builder().is_test(true).try_init();

    let base: i64 = 1_690_000_000;
    let fleet = vec![
        test_instance("i-aaa", base + 10),
        test_instance("i-bbb", base + 50),
        test_instance("i-ccc", base + 20),
        test_instance("i-ddd", base + 40),
        test_instance("i-eee", base + 30),
    ];

    let picked = newest(fleet.clone(), 2);
    let ids: Vec<&str> = picked.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["i-bbb", "i-ddd"]);

    // zero means everything
    assert_eq!(newest(fleet.clone(), 0).len(), 5);
    // counts beyond the fleet are clamped
    assert_eq!(newest(fleet, 9).len(), 5);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- instance::test_instance_serde_round_trip --exact --show-output
#[test]
fn test_instance_serde_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let inst = test_instance("i-0123456789abcdef0", 1_690_000_123);
    let serialized = serde_json::to_string(&inst).unwrap();
    assert!(serialized.contains("launched_at_utc"));

    let deserialized: Instance = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, inst);
}
