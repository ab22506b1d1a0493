#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use loragw_scheduler::scheduling::frequency_plan::SubBandConfig;
use loragw_scheduler::{
    CodingRate, DataRate, FrequencyPlan, ScheduleOptions, Scheduler, SchedulerConfig, TimeOffAir, TimeSource,
    TxSettings,
};

pub const EU_868_1: u64 = 868_100_000;

/// Server clock that only moves when told to.
#[derive(Debug)]
pub struct MockTimeSource {
    now: Mutex<SystemTime>,
}

impl MockTimeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)) })
    }

    pub fn advance(&self, d: Duration) {
        *self.now.lock().unwrap() += d;
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

pub fn eu_plan(time_off_air: Duration) -> FrequencyPlan {
    let mut fp = FrequencyPlan::new("EU_863_870");
    fp.time_off_air = TimeOffAir { fraction: 0.0, duration: time_off_air };
    fp
}

/// EU plan restricted to one sub-band around 868.1 MHz.
pub fn single_sub_band_plan(duty_cycle: f32, time_off_air: Duration) -> FrequencyPlan {
    let mut fp = eu_plan(time_off_air);
    fp.sub_bands = vec![SubBandConfig {
        min_frequency: 868_000_000,
        max_frequency: 868_600_000,
        duty_cycle,
        max_eirp: None,
    }];
    fp
}

pub fn plans(fps: impl IntoIterator<Item = FrequencyPlan>) -> HashMap<String, FrequencyPlan> {
    fps.into_iter().enumerate().map(|(i, fp)| (format!("plan-{}", i), fp)).collect()
}

pub fn new_scheduler(fp: FrequencyPlan, config: SchedulerConfig) -> (Scheduler, Arc<MockTimeSource>) {
    let time_source = MockTimeSource::new();
    let scheduler = Scheduler::new(&plans([fp]), config, Some(time_source.clone() as Arc<dyn TimeSource>)).unwrap();
    (scheduler, time_source)
}

pub fn lora(spreading_factor: u8, timestamp: u32) -> TxSettings {
    TxSettings {
        frequency: EU_868_1,
        data_rate: DataRate::Lora { spreading_factor, bandwidth: 125_000 },
        coding_rate: CodingRate::Cr4_5,
        enable_crc: false,
        timestamp,
        time: None,
    }
}

pub fn opts<'a>(payload_size: usize, settings: TxSettings) -> ScheduleOptions<'a> {
    ScheduleOptions::new(payload_size, settings)
}
