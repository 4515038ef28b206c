//! Serde support for human-readable durations (`"10s"`, `"1m 30s"`).
//!
//! Use with `#[serde(with = "crate::humantime_serde")]`.

use std::fmt;
use std::time::Duration;

use serde::{Deserializer, Serializer, de};

/// Deserializes a `Duration` via the humantime crate.
///
/// # Errors
/// Fails for anything that is not a humantime duration string.
pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl de::Visitor<'_> for V {
        type Value = Duration;

        fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt.write_str("a duration such as \"10s\" or \"1m 30s\"")
        }

        fn visit_str<E>(self, v: &str) -> Result<Duration, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    d.deserialize_str(V)
}

/// Serializes a `Duration` via the humantime crate.
///
/// # Errors
/// Propagates serializer errors.
pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*d))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Foo {
        #[serde(with = "super")]
        timeout: Duration,
    }

    #[test]
    fn parses_and_formats() {
        let foo = serde_json::from_str::<Foo>(r#"{"timeout": "1m 30s"}"#).unwrap();
        assert_eq!(foo.timeout, Duration::from_secs(90));
        assert_eq!(serde_json::to_string(&foo).unwrap(), r#"{"timeout":"1m 30s"}"#);
    }

    #[test]
    fn rejects_bare_numbers_in_strings() {
        assert!(serde_json::from_str::<Foo>(r#"{"timeout": "ten"}"#).is_err());
    }
}
