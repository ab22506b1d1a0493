use std::ops::Deref;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{helper::duration_serde, ConcentratorTime};

/// Mandatory silence after an emission: a fraction of its duration, at least `duration`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeOffAir {
    #[serde(default)]
    pub fraction: f32,
    #[serde(default, with = "duration_serde")]
    pub duration: Duration,
}

impl TimeOffAir {
    pub fn value(&self, d: Duration) -> Duration {
        d.mul_f64(self.fraction.max(0.0) as f64).max(self.duration)
    }
}

/// A transmission occupying `[starts, starts + duration)` in concentrator time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emission {
    starts: ConcentratorTime,
    #[serde(with = "duration_serde")]
    duration: Duration,
}

impl Emission {
    pub fn new(starts: ConcentratorTime, duration: Duration) -> Self {
        Self { starts, duration }
    }

    pub fn starts(&self) -> ConcentratorTime {
        self.starts
    }

    pub fn ends(&self) -> ConcentratorTime {
        self.starts + self.duration
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn off_air(&self, toa: &TimeOffAir) -> Duration {
        toa.value(self.duration)
    }

    pub fn ends_with_off_air(&self, toa: &TimeOffAir) -> ConcentratorTime {
        self.ends() + self.off_air(toa)
    }

    /// Both emissions, each followed by its own off-air, share some instant.
    pub fn overlaps_with_off_air(&self, other: &Emission, toa: &TimeOffAir) -> bool {
        !(self.ends_with_off_air(toa) <= other.starts || other.ends_with_off_air(toa) <= self.starts)
    }

    /// Part of the emission that falls within `[from, to]`.
    pub fn within(&self, from: ConcentratorTime, to: ConcentratorTime) -> Duration {
        let starts = self.starts.max(from);
        let ends = self.ends().min(to);
        (ends - starts).to_duration().unwrap_or_default()
    }

    pub(crate) fn with_starts(&self, starts: ConcentratorTime) -> Emission {
        Emission::new(starts, self.duration)
    }
}

/// Emissions ordered by start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Emissions(Vec<Emission>);

impl Emissions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts `em` after every emission starting at or before it.
    pub fn insert(&mut self, em: Emission) {
        let idx = self.0.partition_point(|other| other.starts <= em.starts);
        self.0.insert(idx, em);
    }

    /// Keeps the emissions ending after `t`, whatever their start.
    pub fn retain_ending_after(&mut self, t: ConcentratorTime) {
        self.0.retain(|em| em.ends() > t);
    }

    /// Total emission time falling within `[from, to]`.
    pub fn sum_within(&self, from: ConcentratorTime, to: ConcentratorTime) -> Duration {
        self.0.iter().map(|em| em.within(from, to)).sum()
    }
}

impl Deref for Emissions {
    type Target = [Emission];

    fn deref(&self) -> &[Emission] {
        &self.0
    }
}

impl FromIterator<Emission> for Emissions {
    fn from_iter<I: IntoIterator<Item = Emission>>(iter: I) -> Self {
        let mut ems = Emissions::new();
        for em in iter {
            ems.insert(em);
        }
        ems
    }
}
