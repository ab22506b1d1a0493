use std::time::Duration;

use super::{ConcentratorTime, TxSchedulePriority};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("no clock sync")]
    NoClockSync,

    #[error("no absolute gateway time")]
    NoAbsoluteGatewayTime,

    #[error("no server time")]
    NoServerTime,

    #[error("too late to transmit: delta {delta} is less than minimum {min:?}")]
    TooLate { delta: ConcentratorTime, min: Duration },

    #[error("scheduling conflict")]
    Conflict,

    #[error("duty-cycle utilization {used} exceeds usable {usable} for priority {priority}")]
    DutyCycle { used: f32, usable: f32, priority: TxSchedulePriority },

    #[error("blocked for {duration:?} by duty-cycle")]
    Blocked { duration: Duration },

    #[error("packet time-on-air {duration:?} exceeds dwell time")]
    DwellTime { duration: Duration },

    #[error("sub-band not found for frequency {frequency} Hz")]
    SubBandNotFound { frequency: u64 },

    #[error("frequency plans must have the same time off air value")]
    FrequencyPlansTimeOffAir,

    #[error("frequency plans have overlapping sub-bands")]
    FrequencyPlansOverlapSubBand,

    #[error("no frequency plans")]
    NoFrequencyPlans,

    #[error("duty-cycle window must not be zero")]
    InvalidDutyCycleWindow,

    #[error("unknown band `{band_id}`")]
    UnknownBand { band_id: String },

    #[error("invalid data rate")]
    InvalidDataRate,

    #[error("invalid coding rate `{coding_rate}`")]
    InvalidCodingRate { coding_rate: String },

    #[error("invalid priority `{priority}`")]
    InvalidPriority { priority: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
