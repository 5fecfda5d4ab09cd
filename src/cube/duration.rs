//! Serde adapter for durations written as `90s`, `1m` or `1h 30m`.
//!
//! A bare integer is read as seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*d).to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Secs(u64),
    Text(String),
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => humantime::parse_duration(text.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{text}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        every: Duration,
    }

    fn read(yaml: &str) -> Result<Duration, serde_yaml::Error> {
        serde_yaml::from_str::<Holder>(yaml).map(|h| h.every)
    }

    #[test]
    fn reads_units_compounds_and_bare_seconds() {
        assert_eq!(read("every: 30").unwrap(), Duration::from_secs(30));
        assert_eq!(read("every: 90s").unwrap(), Duration::from_secs(90));
        assert_eq!(read("every: 1m").unwrap(), Duration::from_secs(60));
        assert_eq!(read("every: 1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(read("every: 2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn rejects_garbage() {
        assert!(read("every: ''").is_err());
        assert!(read("every: h").is_err());
        assert!(read("every: 5 parsecs").is_err());
    }

    #[test]
    fn written_form_reads_back() {
        let holder = Holder {
            every: Duration::from_secs(90_061),
        };
        let text = serde_yaml::to_string(&holder).unwrap();
        assert_eq!(serde_yaml::from_str::<Holder>(&text).unwrap(), holder);
    }
}
