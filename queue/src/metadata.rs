//! Job metadata records.
//!
//! One JSON record travels next to every binary work unit, carrying what
//! the backend and the bookkeeping around it need without decoding the
//! binary. Caller-supplied extras ride along untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobMetadata {
    pub user: String,
    pub study_name: String,
    pub job_name: String,
    // dotted schema version of the submitting crate
    pub app_version: String,
    // per-kind element counts of the submitted line
    pub num_elements: BTreeMap<String, usize>,
    // alive particles at submission
    pub num_part: usize,
    pub num_turns: i64,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extras_roundtrip_through_json() {
        let mut extras = BTreeMap::new();
        extras.insert("seed".to_string(), json!(42));
        extras.insert("tag".to_string(), json!("scan-a"));
        let record = JobMetadata {
            user: "sixtadm".into(),
            study_name: "example_study".into(),
            job_name: "job0".into(),
            app_version: "0.5.0".into(),
            num_elements: BTreeMap::from([("Drift".to_string(), 2)]),
            num_part: 100,
            num_turns: 1000,
            extras,
        };

        let text = serde_json::to_string(&record).unwrap();
        let back: JobMetadata = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        // flattened, not nested under an `extras` key
        assert!(text.contains("\"seed\":42"));
        assert!(!text.contains("extras"));
    }
}
