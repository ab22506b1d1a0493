//! Downlink scheduling for LoRaWAN gateways.
//!
//! The [`Scheduler`] tracks the 32-bit concentrator counter of one gateway
//! across roll-overs and decides when downlinks may be emitted, enforcing
//! sub-band duty cycles, dwell time and time-off-air between transmissions.

pub mod scheduling;

pub use scheduling::{
    time_on_air, CodingRate, ConcentratorTime, DataRate, DutyCycleStyle, Emission, Error, FrequencyPlan, GcHandle,
    Result, RolloverClock, ScheduleOptions, Scheduler, SchedulerConfig, TimeOffAir, TimeSource, TxSchedulePriority,
    TxSettings, UplinkToken,
};
