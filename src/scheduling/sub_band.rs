use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{ConcentratorTime, Emission, Emissions, Error, Result, TxSchedulePriority, DUTY_CYCLE_WINDOW};

/// Frequency range sharing one duty-cycle budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubBandParameters {
    pub min_frequency: u64,
    pub max_frequency: u64,
    pub duty_cycle: f32, /* (0, 1], 0 means unlimited */
}

impl SubBandParameters {
    pub fn comprises(&self, frequency: u64) -> bool {
        self.min_frequency <= frequency && frequency <= self.max_frequency
    }

    pub fn overlaps(&self, other: &SubBandParameters) -> bool {
        self.max_frequency > other.min_frequency && self.min_frequency < other.max_frequency
    }

    pub fn is_identical(&self, other: &SubBandParameters) -> bool {
        self.min_frequency == other.min_frequency && self.max_frequency == other.max_frequency
    }

    fn normalized(mut self) -> Self {
        if self.duty_cycle <= 0.0 || self.duty_cycle > 1.0 {
            self.duty_cycle = 1.0;
        }
        self
    }
}

/// Share of the duty-cycle budget usable per priority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DutyCycleCeilings([f32; 7]);

impl Default for DutyCycleCeilings {
    fn default() -> Self {
        Self([0.40, 0.50, 0.60, 0.70, 0.80, 0.90, 1.00])
    }
}

impl DutyCycleCeilings {
    pub fn new(ceilings: [f32; 7]) -> Self {
        Self(ceilings)
    }

    pub fn get(&self, priority: TxSchedulePriority) -> f32 {
        self.0[priority.index()]
    }

    pub fn set(&mut self, priority: TxSchedulePriority, ceiling: f32) {
        self.0[priority.index()] = ceiling.clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyCycleStyle {
    /// Budget accounted over a sliding window.
    #[default]
    SimpleWindow,
    /// Additionally silent for `duration / duty_cycle` after each emission.
    BlockingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubBandStats {
    pub min_frequency: u64,
    pub max_frequency: u64,
    pub duty_cycle_limit: f32,
    pub duty_cycle_utilization: f32,
}

#[derive(Debug, Clone)]
pub struct SubBand {
    parameters: SubBandParameters,
    ceilings: DutyCycleCeilings,
    style: DutyCycleStyle,
    window: Duration,
    emissions: Emissions,
}

impl SubBand {
    pub fn new(parameters: SubBandParameters, ceilings: DutyCycleCeilings, style: DutyCycleStyle) -> Self {
        Self {
            parameters: parameters.normalized(),
            ceilings,
            style,
            window: DUTY_CYCLE_WINDOW,
            emissions: Emissions::new(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn parameters(&self) -> &SubBandParameters {
        &self.parameters
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn emissions(&self) -> &Emissions {
        &self.emissions
    }

    pub fn comprises(&self, frequency: u64) -> bool {
        self.parameters.comprises(frequency)
    }

    pub fn overlaps(&self, other: &SubBandParameters) -> bool {
        self.parameters.overlaps(other)
    }

    pub fn is_identical(&self, other: &SubBandParameters) -> bool {
        self.parameters.is_identical(other)
    }

    /// Fraction of the window a request of `priority` may use.
    pub fn usable(&self, priority: TxSchedulePriority) -> f32 {
        self.parameters.duty_cycle * self.ceilings.get(priority)
    }

    fn fraction_of_window(&self, d: Duration) -> f64 {
        d.as_nanos() as f64 / self.window.as_nanos() as f64
    }

    /// Utilization of the window ending at `now`.
    pub fn utilization(&self, now: ConcentratorTime) -> f32 {
        self.fraction_of_window(self.emissions.sum_within(now - self.window, now)) as f32
    }

    /// Highest utilization of any window over the accepted emissions.
    pub fn peak_utilization(&self) -> f32 {
        self.emissions
            .iter()
            .flat_map(|em| [em.ends(), em.starts() + self.window])
            .map(|to| self.fraction_of_window(self.emissions.sum_within(to - self.window, to)))
            .fold(0.0, f64::max) as f32
    }

    pub fn stats(&self, now: ConcentratorTime) -> SubBandStats {
        SubBandStats {
            min_frequency: self.parameters.min_frequency,
            max_frequency: self.parameters.max_frequency,
            duty_cycle_limit: self.parameters.duty_cycle,
            duty_cycle_utilization: self.utilization(now),
        }
    }

    fn blocked_until(&self) -> Option<ConcentratorTime> {
        let last = self.emissions.last()?;
        Some(last.starts() + last.duration().div_f64(self.parameters.duty_cycle as f64))
    }

    /// Checks `em` against the duty-cycle budget of `priority` without accepting it.
    ///
    /// Window usage only peaks where a window ends with an emission or starts
    /// with one, so every such window that `em` reaches into is checked.
    pub fn check(&self, em: &Emission, priority: TxSchedulePriority) -> Result<()> {
        if self.parameters.duty_cycle >= 1.0 {
            return Ok(());
        }
        let usable = self.usable(priority);
        let reach = em.starts()..=em.ends() + self.window;
        let others = self
            .emissions
            .iter()
            .flat_map(|other| [other.ends(), other.starts() + self.window])
            .filter(|to| reach.contains(to));
        for to in [em.ends(), em.starts() + self.window].into_iter().chain(others) {
            let from = to - self.window;
            let used = self.fraction_of_window(self.emissions.sum_within(from, to) + em.within(from, to));
            if used > usable as f64 {
                return Err(Error::DutyCycle { used: used as f32, usable, priority });
            }
        }
        if self.style == DutyCycleStyle::BlockingWindow {
            if let Some(blocked_until) = self.blocked_until() {
                if em.starts() < blocked_until {
                    let duration = (blocked_until - em.starts()).to_duration().unwrap_or_default();
                    return Err(Error::Blocked { duration });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, em: Emission) {
        self.emissions.insert(em);
    }

    pub fn schedule(&mut self, em: Emission, priority: TxSchedulePriority) -> Result<()> {
        self.check(&em, priority)?;
        self.insert(em);
        Ok(())
    }

    /// First candidate start that complies with the duty cycle, or the earliest
    /// start after enough past emissions have left the window.
    pub fn place_anytime<I>(&self, duration: Duration, mut candidates: I, priority: TxSchedulePriority) -> Result<Emission>
    where
        I: Iterator<Item = ConcentratorTime>,
    {
        let usable = self.usable(priority);
        let needed = self.fraction_of_window(duration);
        if self.parameters.duty_cycle < 1.0 && needed > usable as f64 {
            return Err(Error::DutyCycle { used: needed as f32, usable, priority });
        }

        let first = candidates.next().ok_or(Error::Conflict)?;
        let mut em = Emission::new(first, duration);
        loop {
            match self.check(&em, priority) {
                Ok(()) => return Ok(em),
                Err(e) => trace!(e = %e, starts = %em.starts(), "anytime candidate rejected"),
            }
            match candidates.next() {
                Some(t) if t != em.starts() => em = em.with_starts(t),
                _ => break,
            }
        }

        let budget = usable as f64;
        let mut used = needed;
        let anchor = self
            .emissions
            .iter()
            .rev()
            .find(|other| {
                used += self.fraction_of_window(other.duration());
                used > budget
            });
        let blocking = self.style == DutyCycleStyle::BlockingWindow;
        let mut starts = match (anchor, self.emissions.last()) {
            (Some(other), _) => other.ends() + self.window - duration,
            /* the budget suffices, only the blocking window is in the way */
            (None, _) if blocking => em.starts(),
            (None, Some(last)) => last.ends() + self.window - duration,
            (None, None) => em.starts(),
        };
        if blocking {
            if let Some(blocked_until) = self.blocked_until() {
                starts = starts.max(blocked_until);
            }
        }
        let em = Emission::new(starts.max(first), duration);
        trace!(starts = %em.starts(), "anytime placed after duty-cycle window");
        Ok(em)
    }

    pub fn schedule_anytime<I>(&mut self, duration: Duration, candidates: I, priority: TxSchedulePriority) -> Result<Emission>
    where
        I: Iterator<Item = ConcentratorTime>,
    {
        let em = self.place_anytime(duration, candidates, priority)?;
        self.insert(em);
        Ok(em)
    }

    /// Forgets emissions that ended at or before `cutoff`.
    pub fn gc(&mut self, cutoff: ConcentratorTime) {
        self.emissions.retain_ending_after(cutoff);
    }
}
