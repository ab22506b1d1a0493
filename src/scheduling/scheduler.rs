use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::{
    band,
    helper::duration_serde,
    sub_band::{DutyCycleCeilings, DutyCycleStyle, SubBand, SubBandParameters, SubBandStats},
    time_on_air::{time_on_air, TxSettings},
    ConcentratorTime, Emission, Emissions, Error, FrequencyPlan, Result, RolloverClock, RttStats, SystemTimeSource,
    TimeOffAir, TimeSource, TxSchedulePriority, UplinkToken, DEFAULT_ROLLOVER_THRESHOLD, DUTY_CYCLE_WINDOW,
    LATE_RTT_PERCENTILE, MIN_RTT_COUNT, QUEUE_DELAY, SCHEDULE_TIME_LONG, SCHEDULE_TIME_SHORT,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enforce_duty_cycle: bool,
    pub duty_cycle_style: DutyCycleStyle,
    #[serde(with = "duration_serde::option")]
    pub schedule_anytime_delay: Option<Duration>, /* SCHEDULE_TIME_LONG when unset */
    #[serde(with = "duration_serde")]
    pub rollover_threshold: Duration,
    pub duty_cycle_ceilings: DutyCycleCeilings,
    #[serde(with = "duration_serde")]
    pub duty_cycle_window: Duration,
    #[serde(with = "duration_serde::option")]
    pub gc_interval: Option<Duration>, /* half the duty-cycle window when unset */
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enforce_duty_cycle: true,
            duty_cycle_style: DutyCycleStyle::SimpleWindow,
            schedule_anytime_delay: None,
            rollover_threshold: DEFAULT_ROLLOVER_THRESHOLD,
            duty_cycle_ceilings: DutyCycleCeilings::default(),
            duty_cycle_window: DUTY_CYCLE_WINDOW,
            gc_interval: None,
        }
    }
}

/// A downlink to admit.
#[derive(Clone, Copy)]
pub struct ScheduleOptions<'a> {
    pub payload_size: usize,
    pub settings: TxSettings,
    pub rtts: Option<&'a dyn RttStats>,
    pub priority: TxSchedulePriority,
    pub uplink_token: Option<UplinkToken>,
}

impl<'a> ScheduleOptions<'a> {
    pub fn new(payload_size: usize, settings: TxSettings) -> Self {
        Self {
            payload_size,
            settings,
            rtts: None,
            priority: TxSchedulePriority::Normal,
            uplink_token: None,
        }
    }
}

struct State {
    clock: RolloverClock,
    sub_bands: Vec<SubBand>,
    emissions: Emissions,
}

impl State {
    fn sync_with_uplink_token(&mut self, token: Option<&UplinkToken>) {
        let Some(token) = token else { return };
        let (Some(server_time), Some(concentrator_time)) = (token.server_time, token.concentrator_time) else {
            return;
        };
        if self.clock.server_time().is_some_and(|last| server_time <= last) {
            return;
        }
        self.clock
            .sync_with_gateway_concentrator(token.timestamp, server_time, token.gateway_time, concentrator_time);
    }

    fn find_sub_band(&self, frequency: u64) -> Result<usize> {
        self.sub_bands
            .iter()
            .position(|sb| sb.comprises(frequency))
            .ok_or(Error::SubBandNotFound { frequency })
    }

    fn conflicts(&self, em: &Emission, toa: &TimeOffAir) -> bool {
        self.emissions.iter().any(|other| em.overlaps_with_off_air(other, toa))
    }
}

/// Candidate starts for an anytime emission: the requested start moved past
/// every accepted emission it overlaps, then after each following emission in turn.
struct Candidates<'a> {
    emissions: &'a [Emission],
    toa: TimeOffAir,
    em: Emission,
    cursor: usize,
    started: bool,
}

impl<'a> Candidates<'a> {
    fn new(emissions: &'a [Emission], em: Emission, toa: TimeOffAir) -> Self {
        Self { emissions, toa, em, cursor: 0, started: false }
    }
}

impl Iterator for Candidates<'_> {
    type Item = ConcentratorTime;

    fn next(&mut self) -> Option<ConcentratorTime> {
        if self.started {
            let other = self.emissions.get(self.cursor)?;
            self.em = self.em.with_starts(self.em.starts().max(other.ends_with_off_air(&self.toa)));
            self.cursor += 1;
        }
        self.started = true;
        while let Some(other) = self.emissions.get(self.cursor) {
            if self.em.overlaps_with_off_air(other, &self.toa) {
                self.em = self.em.with_starts(other.ends_with_off_air(&self.toa));
            } else if self.em.starts() < other.starts() {
                break;
            }
            self.cursor += 1;
        }
        Some(self.em.starts())
    }
}

/// Decides when downlinks may be emitted by one gateway.
pub struct Scheduler {
    state: RwLock<State>,
    frequency_plans: Vec<FrequencyPlan>,
    time_off_air: TimeOffAir,
    schedule_anytime_delay: Duration,
    duty_cycle_window: Duration,
    gc_interval: Duration,
    time_source: Arc<dyn TimeSource>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("time_off_air", &self.time_off_air)
            .field("schedule_anytime_delay", &self.schedule_anytime_delay)
            .field("duty_cycle_window", &self.duty_cycle_window)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        frequency_plans: &HashMap<String, FrequencyPlan>,
        config: SchedulerConfig,
        time_source: Option<Arc<dyn TimeSource>>,
    ) -> Result<Self> {
        let mut ids: Vec<&String> = frequency_plans.keys().collect();
        ids.sort();
        let plans: Vec<FrequencyPlan> = ids.into_iter().map(|id| frequency_plans[id].clone()).collect();

        let mut time_off_air = plans.first().ok_or(Error::NoFrequencyPlans)?.time_off_air;
        if config.duty_cycle_window.is_zero() {
            return Err(Error::InvalidDutyCycleWindow);
        }
        if plans.iter().any(|fp| fp.time_off_air != time_off_air) {
            return Err(Error::FrequencyPlansTimeOffAir);
        }

        let mut sub_bands: Vec<SubBand> = Vec::new();
        if config.enforce_duty_cycle {
            for fp in &plans {
                let parameters: Vec<SubBandParameters> = if fp.sub_bands.is_empty() {
                    band::get(&fp.band_id)?.sub_bands.to_vec()
                } else {
                    fp.sub_bands.iter().map(|sb| sb.parameters()).collect()
                };
                'parameters: for params in parameters {
                    for existing in &sub_bands {
                        if existing.is_identical(&params) {
                            continue 'parameters;
                        }
                        if existing.overlaps(&params) {
                            return Err(Error::FrequencyPlansOverlapSubBand);
                        }
                    }
                    sub_bands.push(
                        SubBand::new(params, config.duty_cycle_ceilings, config.duty_cycle_style)
                            .with_window(config.duty_cycle_window),
                    );
                }
            }
        } else {
            let unlimited = SubBandParameters { min_frequency: 0, max_frequency: u64::MAX, duty_cycle: 1.0 };
            sub_bands.push(
                SubBand::new(unlimited, config.duty_cycle_ceilings, config.duty_cycle_style)
                    .with_window(config.duty_cycle_window),
            );
        }

        if time_off_air.duration < QUEUE_DELAY {
            time_off_air.duration = QUEUE_DELAY;
        }

        info!(
            sub_bands = sub_bands.len(),
            time_off_air = ?time_off_air,
            enforce_duty_cycle = config.enforce_duty_cycle,
            duty_cycle_window = ?config.duty_cycle_window,
            "created downlink scheduler"
        );

        Ok(Self {
            state: RwLock::new(State {
                clock: RolloverClock::with_rollover_threshold(config.rollover_threshold),
                sub_bands,
                emissions: Emissions::new(),
            }),
            frequency_plans: plans,
            time_off_air,
            schedule_anytime_delay: config.schedule_anytime_delay.unwrap_or(SCHEDULE_TIME_LONG),
            duty_cycle_window: config.duty_cycle_window,
            gc_interval: config.gc_interval.unwrap_or(config.duty_cycle_window / 2),
            time_source: time_source.unwrap_or_else(|| Arc::new(SystemTimeSource)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn time_off_air(&self) -> TimeOffAir {
        self.time_off_air
    }

    pub fn sync(&self, timestamp: u32, server: SystemTime) -> ConcentratorTime {
        self.write().clock.sync(timestamp, server)
    }

    pub fn sync_with_gateway_absolute(&self, timestamp: u32, server: SystemTime, gateway: SystemTime) -> ConcentratorTime {
        self.write().clock.sync_with_gateway_absolute(timestamp, server, gateway)
    }

    pub fn sync_with_gateway_concentrator(
        &self,
        timestamp: u32,
        server: SystemTime,
        gateway: Option<SystemTime>,
        concentrator: ConcentratorTime,
    ) -> ConcentratorTime {
        self.write()
            .clock
            .sync_with_gateway_concentrator(timestamp, server, gateway, concentrator)
    }

    pub fn is_gateway_time_synced(&self) -> bool {
        self.read().clock.is_gateway_synced()
    }

    /// Estimated concentrator time, `None` before the first sync.
    pub fn now(&self) -> Option<ConcentratorTime> {
        self.read().clock.from_server_time(self.time_source.now())
    }

    pub fn time_from_timestamp_time(&self, timestamp: u32) -> Option<ConcentratorTime> {
        let state = self.read();
        state.clock.is_synced().then(|| state.clock.from_timestamp_time(timestamp))
    }

    pub fn time_from_server_time(&self, t: SystemTime) -> Option<ConcentratorTime> {
        self.read().clock.from_server_time(t)
    }

    pub fn time_from_gateway_time(&self, t: SystemTime) -> Option<ConcentratorTime> {
        self.read().clock.from_gateway_time(t)
    }

    pub fn concentrator_time_to_server_time(&self, t: ConcentratorTime) -> Option<SystemTime> {
        self.read().clock.to_server_time(t)
    }

    pub fn sub_band_stats(&self) -> Vec<SubBandStats> {
        let state = self.read();
        let now = state.clock.from_server_time(self.time_source.now()).unwrap_or_default();
        state.sub_bands.iter().map(|sb| sb.stats(now)).collect()
    }

    /// Snapshot of all accepted emissions, ordered by start.
    pub fn emissions(&self) -> Vec<Emission> {
        self.read().emissions.to_vec()
    }

    pub fn sub_bands(&self) -> Vec<SubBand> {
        self.read().sub_bands.clone()
    }

    fn min_schedule_time(&self, rtts: Option<&dyn RttStats>, server_now: SystemTime) -> (Duration, Option<Duration>) {
        match rtts.and_then(|rtts| rtts.stats(LATE_RTT_PERCENTILE, server_now)) {
            Some(stats) if stats.count >= MIN_RTT_COUNT => (stats.percentile / 2 + QUEUE_DELAY, Some(stats.median)),
            _ => (SCHEDULE_TIME_SHORT, None),
        }
    }

    fn time_on_air(&self, opts: &ScheduleOptions<'_>) -> Result<Duration> {
        let d = time_on_air(opts.payload_size, &opts.settings)?;
        if !self
            .frequency_plans
            .iter()
            .any(|fp| fp.respects_dwell_time(true, opts.settings.frequency, d))
        {
            return Err(Error::DwellTime { duration: d });
        }
        Ok(d)
    }

    /// Admits a downlink at the requested timestamp or absolute gateway time.
    pub fn schedule_at(&self, opts: &ScheduleOptions<'_>) -> Result<(Emission, ConcentratorTime)> {
        let mut state = self.write();
        let res = self.schedule_at_locked(&mut state, opts);
        self.log_verdict("at", opts, &res);
        res
    }

    fn schedule_at_locked(&self, state: &mut State, opts: &ScheduleOptions<'_>) -> Result<(Emission, ConcentratorTime)> {
        let server_now = self.time_source.now();
        state.sync_with_uplink_token(opts.uplink_token.as_ref());
        if !state.clock.is_synced() {
            return Err(Error::NoClockSync);
        }
        let (min_schedule_time, median_rtt) = self.min_schedule_time(opts.rtts, server_now);
        let now = state.clock.from_server_time(server_now).ok_or(Error::NoClockSync)?;

        let starts = match opts.settings.time {
            Some(t) => match (state.clock.from_gateway_time(t), median_rtt) {
                (Some(starts), _) => starts,
                (None, Some(median)) => state.clock.from_server_time(t).ok_or(Error::NoServerTime)? - median / 2,
                (None, None) => return Err(Error::NoAbsoluteGatewayTime),
            },
            None => state.clock.from_timestamp_time(opts.settings.timestamp),
        };
        let delta = starts - now;
        if delta < ConcentratorTime::from(min_schedule_time) {
            return Err(Error::TooLate { delta, min: min_schedule_time });
        }

        let idx = state.find_sub_band(opts.settings.frequency)?;
        let d = self.time_on_air(opts)?;
        let em = Emission::new(starts, d);
        if state.conflicts(&em, &self.time_off_air) {
            return Err(Error::Conflict);
        }
        state.sub_bands[idx].schedule(em, opts.priority)?;
        state.emissions.insert(em);
        Ok((em, now))
    }

    /// Admits a downlink at the earliest legal instant at or after the requested timestamp.
    pub fn schedule_anytime(&self, opts: &ScheduleOptions<'_>) -> Result<(Emission, ConcentratorTime)> {
        let mut state = self.write();
        let res = self.schedule_anytime_locked(&mut state, opts);
        self.log_verdict("anytime", opts, &res);
        res
    }

    fn schedule_anytime_locked(&self, state: &mut State, opts: &ScheduleOptions<'_>) -> Result<(Emission, ConcentratorTime)> {
        let server_now = self.time_source.now();
        state.sync_with_uplink_token(opts.uplink_token.as_ref());
        if !state.clock.is_synced() {
            return Err(Error::NoClockSync);
        }
        let (min_schedule_time, _) = self.min_schedule_time(opts.rtts, server_now);
        let now = state.clock.from_server_time(server_now).ok_or(Error::NoClockSync)?;

        let earliest = now + min_schedule_time;
        let starts = if opts.settings.timestamp == 0 {
            now + self.schedule_anytime_delay
        } else {
            state.clock.from_timestamp_time(opts.settings.timestamp)
        };
        let starts = starts.max(earliest);

        let idx = state.find_sub_band(opts.settings.frequency)?;
        let d = self.time_on_air(opts)?;

        let State { sub_bands, emissions, .. } = &mut *state;
        let candidates = Candidates::new(emissions, Emission::new(starts, d), self.time_off_air);
        let em = sub_bands[idx].place_anytime(d, candidates, opts.priority)?;

        /* the duty-cycle fallback is not drawn from the candidates */
        sub_bands[idx].check(&em, opts.priority)?;
        if emissions.iter().any(|other| em.overlaps_with_off_air(other, &self.time_off_air)) {
            return Err(Error::Conflict);
        }
        sub_bands[idx].insert(em);
        emissions.insert(em);
        Ok((em, now))
    }

    fn log_verdict(&self, mode: &str, opts: &ScheduleOptions<'_>, res: &Result<(Emission, ConcentratorTime)>) {
        match res {
            Ok((em, now)) => debug!(
                mode = mode,
                starts = %em.starts(),
                duration = ?em.duration(),
                now = %now,
                frequency = opts.settings.frequency,
                priority = %opts.priority,
                "scheduled downlink"
            ),
            Err(e) => debug!(
                mode = mode,
                e = %e,
                frequency = opts.settings.frequency,
                priority = %opts.priority,
                "failed to schedule downlink"
            ),
        }
    }

    /// Forgets emissions that can no longer affect any duty-cycle window.
    pub fn gc(&self) {
        let mut state = self.write();
        let Some(now) = state.clock.from_server_time(self.time_source.now()) else {
            return;
        };
        let cutoff = now - self.duty_cycle_window;
        let before = state.emissions.len();
        for sb in &mut state.sub_bands {
            sb.gc(cutoff);
        }
        state.emissions.retain_ending_after(cutoff);
        trace!(cutoff = %cutoff, removed = before - state.emissions.len(), "collected emissions");
    }

    /// Runs `gc` every `gc_interval` on a background thread until the handle is
    /// stopped or dropped, or the scheduler is dropped.
    pub fn spawn_gc(self: &Arc<Self>) -> std::io::Result<GcHandle> {
        let (shutdown, signal) = mpsc::channel::<()>();
        let scheduler = Arc::downgrade(self);
        let interval = self.gc_interval;
        let thread = thread::Builder::new().name("scheduler-gc".to_owned()).spawn(move || loop {
            match signal.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match scheduler.upgrade() {
                    Some(scheduler) => scheduler.gc(),
                    None => break,
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(GcHandle { shutdown: Some(shutdown), thread: Some(thread) })
    }
}

pub struct GcHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GcHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("scheduler GC thread panicked");
            }
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn s(v: i64) -> ConcentratorTime {
        ConcentratorTime::from_micros(v * 1_000_000)
    }

    const TOA: TimeOffAir = TimeOffAir { fraction: 0.0, duration: Duration::from_secs(1) };

    #[test]
    fn candidates_without_emissions() {
        let em = Emission::new(s(10), Duration::from_millis(50));
        let mut candidates = Candidates::new(&[], em, TOA);
        assert_eq!(candidates.next(), Some(s(10)));
        assert_eq!(candidates.next(), None);
    }

    #[test]
    fn candidates_skip_overlaps_then_walk_forward() {
        let d = Duration::from_millis(100);
        let emissions: Emissions = [Emission::new(s(10), d), Emission::new(s(12), d), Emission::new(s(20), d)]
            .into_iter()
            .collect();
        let em = Emission::new(s(10), d);
        let candidates: Vec<ConcentratorTime> = Candidates::new(&emissions, em, TOA).collect();
        let after = |t: i64| s(t) + d + TOA.duration;
        // fits between the second and the third, then after the third
        assert_eq!(candidates, vec![after(12), after(20)]);
    }

    #[test]
    fn candidates_fit_before_first() {
        let d = Duration::from_millis(100);
        let emissions: Emissions = [Emission::new(s(10), d)].into_iter().collect();
        let candidates: Vec<ConcentratorTime> = Candidates::new(&emissions, Emission::new(s(5), d), TOA).collect();
        assert_eq!(candidates, vec![s(5), s(10) + d + TOA.duration]);
    }

    #[test]
    fn config_from_json() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"enforce_duty_cycle": false, "duty_cycle_style": "blocking_window", "schedule_anytime_delay": "1s"}"#,
        )
        .unwrap();
        assert!(!config.enforce_duty_cycle);
        assert_eq!(config.duty_cycle_style, DutyCycleStyle::BlockingWindow);
        assert_eq!(config.schedule_anytime_delay, Some(Duration::from_secs(1)));
        assert_eq!(config.rollover_threshold, DEFAULT_ROLLOVER_THRESHOLD);
        assert_eq!(config.duty_cycle_window, DUTY_CYCLE_WINDOW);
        assert_eq!(config.gc_interval, None);

        let config: SchedulerConfig =
            serde_json::from_str(r#"{"duty_cycle_window": "10m", "gc_interval": 60000}"#).unwrap();
        assert_eq!(config.duty_cycle_window, Duration::from_secs(600));
        assert_eq!(config.gc_interval, Some(Duration::from_secs(60)));
    }
}
