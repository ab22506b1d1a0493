use std::time::{Duration, SystemTime};

use tracing::{trace, warn};

use super::{
    helper::{system_time_delta, system_time_offset},
    ConcentratorTime, DEFAULT_ROLLOVER_THRESHOLD, TIMESTAMP_ROLLOVER_US,
};

/// Maps server time, gateway time and 32-bit concentrator timestamps onto one
/// absolute concentrator time, keeping track of counter roll-overs.
#[derive(Debug, Clone)]
pub struct RolloverClock {
    synced: bool,
    relative: u32,                /* last observed concentrator timestamp */
    absolute: ConcentratorTime,   /* `relative` including all roll-overs */
    server: Option<SystemTime>,   /* server time paired with `absolute` */
    gateway: Option<SystemTime>,  /* gateway time at `relative`, if known */
    rollover_threshold: i64,      /* backward jump in µs that counts as a roll-over */
}

impl Default for RolloverClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloverClock {
    pub fn new() -> Self {
        Self::with_rollover_threshold(DEFAULT_ROLLOVER_THRESHOLD)
    }

    /// Gateway firmwares jitter timestamps backwards by up to ~100 ms; only
    /// backward jumps larger than `threshold` are taken as a counter wrap.
    pub fn with_rollover_threshold(threshold: Duration) -> Self {
        Self {
            synced: false,
            relative: 0,
            absolute: ConcentratorTime::ZERO,
            server: None,
            gateway: None,
            rollover_threshold: i64::try_from(threshold.as_micros()).unwrap_or(i64::MAX),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_gateway_synced(&self) -> bool {
        self.gateway.is_some()
    }

    pub fn server_time(&self) -> Option<SystemTime> {
        self.server
    }

    pub fn absolute(&self) -> ConcentratorTime {
        self.absolute
    }

    pub fn sync(&mut self, timestamp: u32, server: SystemTime) -> ConcentratorTime {
        if !self.synced {
            self.absolute = ConcentratorTime::from_micros(timestamp as i64);
        } else {
            let mut delta_us = timestamp as i64 - self.relative as i64;
            if delta_us < -self.rollover_threshold {
                trace!(timestamp, relative = self.relative, "concentrator timestamp rolled over");
                delta_us += TIMESTAMP_ROLLOVER_US;
            }
            if let Some(last) = self.server {
                let elapsed_us = system_time_delta(server, last).map_or(0, ConcentratorTime::as_micros);
                let rollovers = elapsed_us / TIMESTAMP_ROLLOVER_US;
                if rollovers > 0 {
                    warn!(rollovers, "concentrator timestamp rolled over since last sync");
                    delta_us += rollovers * TIMESTAMP_ROLLOVER_US;
                }
            }
            self.absolute = self.absolute + ConcentratorTime::from_micros(delta_us);
        }
        self.relative = timestamp;
        self.server = Some(server);
        self.gateway = None;
        self.synced = true;
        trace!(timestamp, absolute = %self.absolute, "synced concentrator clock");
        self.absolute
    }

    pub fn sync_with_gateway_absolute(&mut self, timestamp: u32, server: SystemTime, gateway: SystemTime) -> ConcentratorTime {
        let ct = self.sync(timestamp, server);
        self.gateway = Some(gateway);
        ct
    }

    /// Overwrites the clock state, e.g. from an uplink token.
    pub fn sync_with_gateway_concentrator(
        &mut self,
        timestamp: u32,
        server: SystemTime,
        gateway: Option<SystemTime>,
        concentrator: ConcentratorTime,
    ) -> ConcentratorTime {
        self.relative = timestamp;
        self.absolute = concentrator;
        self.server = Some(server);
        self.gateway = gateway;
        self.synced = true;
        trace!(timestamp, absolute = %self.absolute, "restored concentrator clock");
        self.absolute
    }

    pub fn from_server_time(&self, t: SystemTime) -> Option<ConcentratorTime> {
        let server = self.server.filter(|_| self.synced)?;
        self.absolute.checked_add(system_time_delta(t, server)?)
    }

    pub fn from_gateway_time(&self, t: SystemTime) -> Option<ConcentratorTime> {
        let gateway = self.gateway?;
        self.absolute.checked_add(system_time_delta(t, gateway)?)
    }

    /// Assumes `timestamp` lies within half a roll-over period of the last sync.
    pub fn from_timestamp_time(&self, timestamp: u32) -> ConcentratorTime {
        let mut delta_us = timestamp as i64 - self.relative as i64;
        if delta_us > TIMESTAMP_ROLLOVER_US / 2 {
            delta_us -= TIMESTAMP_ROLLOVER_US;
        } else if delta_us < -TIMESTAMP_ROLLOVER_US / 2 {
            delta_us += TIMESTAMP_ROLLOVER_US;
        }
        self.absolute + ConcentratorTime::from_micros(delta_us)
    }

    pub fn to_server_time(&self, t: ConcentratorTime) -> Option<SystemTime> {
        let server = self.server.filter(|_| self.synced)?;
        system_time_offset(server, t - self.absolute)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MAX_U32_US: Duration = Duration::from_micros(u32::MAX as u64);

    fn base() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn unsynced() {
        let clock = RolloverClock::new();
        assert!(!clock.is_synced());
        assert_eq!(clock.from_server_time(base()), None);
        assert_eq!(clock.from_gateway_time(base()), None);
        assert_eq!(clock.to_server_time(ConcentratorTime::ZERO), None);
    }

    #[test]
    fn sync_and_convert() {
        let mut clock = RolloverClock::new();
        let now = base();
        assert_eq!(clock.sync(1_000_000, now), ConcentratorTime::from_micros(1_000_000));
        assert!(clock.is_synced());
        assert!(!clock.is_gateway_synced());
        assert_eq!(clock.from_timestamp_time(1_000_000), clock.absolute());
        assert_eq!(clock.from_timestamp_time(1_500_000), ConcentratorTime::from_micros(1_500_000));
        assert_eq!(clock.from_server_time(now + Duration::from_secs(2)), Some(ConcentratorTime::from_micros(3_000_000)));
        assert_eq!(clock.from_server_time(now - Duration::from_millis(500)), Some(ConcentratorTime::from_micros(500_000)));
        assert_eq!(clock.to_server_time(ConcentratorTime::from_micros(3_000_000)), Some(now + Duration::from_secs(2)));
        assert_eq!(clock.from_gateway_time(now), None);

        clock.sync(2_000_000, now + Duration::from_secs(1));
        assert_eq!(clock.absolute(), ConcentratorTime::from_micros(2_000_000));
    }

    #[test]
    fn gateway_time() {
        let mut clock = RolloverClock::new();
        let gateway = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        clock.sync_with_gateway_absolute(5_000_000, base(), gateway);
        assert!(clock.is_gateway_synced());
        assert_eq!(clock.from_gateway_time(gateway + Duration::from_secs(1)), Some(ConcentratorTime::from_micros(6_000_000)));

        // a plain sync forgets the gateway time
        clock.sync(6_000_000, base() + Duration::from_secs(1));
        assert!(!clock.is_gateway_synced());
    }

    #[test]
    fn unrepresentable_times() {
        let mut clock = RolloverClock::new();
        let now = base();
        clock.sync_with_gateway_absolute(1_000_000, now, now);
        let far = Duration::from_secs(400 * 365 * 86_400);
        assert_eq!(clock.from_gateway_time(now + far), None);
        assert_eq!(clock.from_server_time(now + far), None);
        assert_eq!(clock.from_server_time(now - far), None);
        assert_eq!(clock.to_server_time(ConcentratorTime(i64::MAX)), Some(now + Duration::from_nanos(i64::MAX as u64 - 1_000_000_000)));

        // just inside the range still converts
        let near = now + Duration::from_secs(200 * 365 * 86_400);
        assert_eq!(clock.from_gateway_time(near), Some(ConcentratorTime::from_micros(1_000_000) + Duration::from_secs(200 * 365 * 86_400)));
    }

    #[test]
    fn jitter_is_not_a_rollover() {
        let mut clock = RolloverClock::new();
        clock.sync(10_000_000, base());
        clock.sync(9_900_000, base());
        assert_eq!(clock.absolute(), ConcentratorTime::from_micros(9_900_000));
    }

    #[test]
    fn rollover_by_timestamp() {
        let mut clock = RolloverClock::new();
        let now = base();
        clock.sync(u32::MAX, now);
        clock.sync(0, now + MAX_U32_US);
        assert_eq!(clock.absolute(), ConcentratorTime::from_micros(1 << 32));
        assert!(clock.absolute() > ConcentratorTime::from_micros(u32::MAX as i64));
    }

    #[test]
    fn rollover_by_elapsed_server_time() {
        let mut clock = RolloverClock::new();
        let now = base();
        clock.sync(100, now);
        clock.sync(200, now + Duration::from_micros((1u64 << 32) + 100));
        assert_eq!(clock.absolute(), ConcentratorTime::from_micros((1 << 32) + 200));
    }

    #[test]
    fn configurable_threshold() {
        let mut clock = RolloverClock::with_rollover_threshold(Duration::from_millis(10));
        clock.sync(10_000_000, base());
        clock.sync(9_900_000, base());
        assert_eq!(clock.absolute(), ConcentratorTime::from_micros(9_900_000 + (1 << 32)));
    }

    #[test]
    fn timestamp_wraps_around_last_sync() {
        let mut clock = RolloverClock::new();
        clock.sync(u32::MAX - 1_000, base());
        let absolute = clock.absolute();
        assert_eq!(clock.from_timestamp_time(1_000), absolute + Duration::from_micros(2_001));

        let mut clock = RolloverClock::new();
        clock.sync_with_gateway_concentrator(1_000, base(), None, ConcentratorTime::from_micros(1 << 33));
        assert_eq!(clock.from_timestamp_time(u32::MAX - 1_000), ConcentratorTime::from_micros((1 << 33) - 2_001));
    }

    #[test]
    fn restore_from_concentrator_time() {
        let mut clock = RolloverClock::new();
        let gateway = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let ct = ConcentratorTime::from_micros(123_456_789_000);
        clock.sync_with_gateway_concentrator(1_000, base(), Some(gateway), ct);
        assert!(clock.is_synced());
        assert_eq!(clock.from_timestamp_time(1_000), ct);
        assert_eq!(clock.from_gateway_time(gateway), Some(ct));
        assert_eq!(clock.server_time(), Some(base()));
    }
}
