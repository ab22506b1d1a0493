use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::{emission::TimeOffAir, helper::duration_serde, sub_band::SubBandParameters};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBandConfig {
    pub min_frequency: u64,
    pub max_frequency: u64,
    #[serde(default)]
    pub duty_cycle: f32,
    #[serde(default)]
    pub max_eirp: Option<f32>,
}

impl SubBandConfig {
    pub fn parameters(&self) -> SubBandParameters {
        SubBandParameters {
            min_frequency: self.min_frequency,
            max_frequency: self.max_frequency,
            duty_cycle: self.duty_cycle,
        }
    }
}

/// Carried through for the radio, not enforced by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListenBeforeTalk {
    pub rssi_target: f32,   /* dBm */
    #[serde(default)]
    pub rssi_offset: f32,   /* dB */
    pub scan_time: u32,     /* µs */
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DwellTime {
    #[serde(default)]
    pub uplinks: Option<bool>,
    #[serde(default)]
    pub downlinks: Option<bool>,
    #[serde(default, with = "duration_serde::option")]
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDwellTime {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub frequency: u64,
    #[serde(default)]
    pub min_data_rate: u8,
    #[serde(default)]
    pub max_data_rate: u8,
    #[serde(default)]
    pub dwell_time: Option<ChannelDwellTime>,
}

/// Resolved frequency plan of a gateway, as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPlan {
    pub band_id: String,
    #[serde(default)]
    pub sub_bands: Vec<SubBandConfig>,
    #[serde(default)]
    pub listen_before_talk: Option<ListenBeforeTalk>,
    #[serde(default)]
    pub time_off_air: TimeOffAir,
    #[serde(default)]
    pub dwell_time: DwellTime,
    #[serde(default)]
    pub uplink_channels: Vec<Channel>,
    #[serde(default)]
    pub downlink_channels: Vec<Channel>,
}

impl FrequencyPlan {
    pub fn new(band_id: impl Into<String>) -> Self {
        Self {
            band_id: band_id.into(),
            sub_bands: Vec::new(),
            listen_before_talk: None,
            time_off_air: TimeOffAir::default(),
            dwell_time: DwellTime::default(),
            uplink_channels: Vec::new(),
            downlink_channels: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let fp: FrequencyPlan = serde_json::from_str(json).context("failed to parse frequency plan")?;
        if fp.band_id.is_empty() {
            return Err(anyhow!("frequency plan has no band id"));
        }
        for sb in &fp.sub_bands {
            if sb.min_frequency > sb.max_frequency {
                return Err(anyhow!(
                    "sub-band {}-{} Hz of band {} is inverted",
                    sb.min_frequency,
                    sb.max_frequency,
                    fp.band_id
                ));
            }
        }
        Ok(fp)
    }

    /// Whether a transmission of `duration` on `frequency` stays within the dwell time.
    pub fn respects_dwell_time(&self, is_downlink: bool, frequency: u64, duration: Duration) -> bool {
        let mut enabled = if is_downlink {
            self.dwell_time.downlinks.unwrap_or(false)
        } else {
            self.dwell_time.uplinks.unwrap_or(false)
        };
        let channels = if is_downlink {
            if self.downlink_channels.is_empty() {
                &self.uplink_channels
            } else {
                &self.downlink_channels
            }
        } else {
            &self.uplink_channels
        };
        if let Some(override_enabled) = channels
            .iter()
            .find(|ch| ch.frequency == frequency)
            .and_then(|ch| ch.dwell_time)
            .and_then(|dt| dt.enabled)
        {
            enabled = override_enabled;
        }
        match self.dwell_time.duration {
            Some(max) if enabled => duration <= max,
            _ => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EU_PLAN: &str = r#"{
        "band_id": "EU_863_870",
        "time_off_air": { "fraction": 0.1, "duration": "1s" },
        "dwell_time": { "downlinks": true, "duration": "400ms" },
        "listen_before_talk": { "rssi_target": -80, "rssi_offset": -4, "scan_time": 128 },
        "uplink_channels": [
            { "frequency": 868100000, "min_data_rate": 0, "max_data_rate": 5 },
            { "frequency": 868300000, "min_data_rate": 0, "max_data_rate": 5, "dwell_time": { "enabled": false } }
        ]
    }"#;

    #[test]
    fn parse() {
        let fp = FrequencyPlan::from_json(EU_PLAN).unwrap();
        assert_eq!(fp.band_id, "EU_863_870");
        assert_eq!(fp.time_off_air, TimeOffAir { fraction: 0.1, duration: Duration::from_secs(1) });
        assert_eq!(fp.dwell_time.duration, Some(Duration::from_millis(400)));
        assert_eq!(fp.listen_before_talk.map(|lbt| lbt.scan_time), Some(128));
        assert!(fp.sub_bands.is_empty());
        assert_eq!(fp.uplink_channels.len(), 2);
    }

    #[test]
    fn parse_errors() {
        assert!(FrequencyPlan::from_json("{").is_err());
        assert!(FrequencyPlan::from_json(r#"{"band_id": ""}"#).is_err());
        let inverted = r#"{"band_id": "EU_863_870", "sub_bands": [{"min_frequency": 2, "max_frequency": 1, "duty_cycle": 0.01}]}"#;
        assert!(FrequencyPlan::from_json(inverted).is_err());
    }

    #[test]
    fn dwell_time() {
        let fp = FrequencyPlan::from_json(EU_PLAN).unwrap();
        assert!(fp.respects_dwell_time(true, 868_100_000, Duration::from_millis(400)));
        assert!(!fp.respects_dwell_time(true, 868_100_000, Duration::from_millis(401)));
        // the channel disables dwell time
        assert!(fp.respects_dwell_time(true, 868_300_000, Duration::from_secs(2)));
        // uplink dwell time is not enabled
        assert!(fp.respects_dwell_time(false, 868_100_000, Duration::from_secs(2)));
        // without a duration there is no limit
        let mut fp = fp;
        fp.dwell_time.duration = None;
        assert!(fp.respects_dwell_time(true, 868_100_000, Duration::from_secs(10)));
    }
}
