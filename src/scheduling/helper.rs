use std::time::{Duration, SystemTime};

use super::ConcentratorTime;

/// `later - earlier` as a signed span, `None` past the `i64` nanosecond range.
pub fn system_time_delta(later: SystemTime, earlier: SystemTime) -> Option<ConcentratorTime> {
    let (d, negative) = match later.duration_since(earlier) {
        Ok(d) => (d, false),
        Err(e) => (e.duration(), true),
    };
    let ns = i64::try_from(d.as_nanos()).ok()?;
    Some(ConcentratorTime::from_nanos(if negative { -ns } else { ns }))
}

/// `t + delta` for a signed span, `None` if the result is not representable.
pub fn system_time_offset(t: SystemTime, delta: ConcentratorTime) -> Option<SystemTime> {
    let magnitude = Duration::from_nanos(delta.as_nanos().unsigned_abs());
    if delta.is_negative() {
        t.checked_sub(magnitude)
    } else {
        t.checked_add(magnitude)
    }
}

pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (value, unit) = s.split_at(split);
    let unit_ns: u64 = match unit {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => return None,
    };
    if let Ok(whole) = value.parse::<u64>() {
        return whole.checked_mul(unit_ns).map(Duration::from_nanos);
    }
    let value: f64 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * unit_ns as f64 / 1e9).ok()
}

/* durations are written as integer milliseconds or strings such as "1s", "400ms" */
pub mod duration_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ns", value.as_nanos()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    pub(super) struct DurationVisitor;

    impl<'de> de::Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("milliseconds or a duration string such as \"1s\" or \"400ms\"")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_millis(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_millis)
                .map_err(|_| de::Error::custom(format!("negative duration: {}", value)))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            super::parse_duration(value).ok_or_else(|| de::Error::custom(format!("invalid duration: {}", value)))
        }
    }

    pub mod option {
        use std::fmt;
        use std::time::Duration;

        use serde::de;
        use serde::{Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct OptionVisitor;

            impl<'de> de::Visitor<'de> for OptionVisitor {
                type Value = Option<Duration>;

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("a duration or null")
                }

                fn visit_none<E>(self) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Ok(None)
                }

                fn visit_unit<E>(self) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Ok(None)
                }

                fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
                where
                    D: Deserializer<'de>,
                {
                    deserializer.deserialize_any(super::DurationVisitor).map(Some)
                }
            }

            deserializer.deserialize_option(OptionVisitor)
        }
    }
}
