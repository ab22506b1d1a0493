//! Regional defaults used when a frequency plan does not list its own sub-bands.

use super::{sub_band::SubBandParameters, Error, Result};

pub const EU_863_870: &str = "EU_863_870";
pub const EU_433: &str = "EU_433";
pub const US_902_928: &str = "US_902_928";
pub const AU_915_928: &str = "AU_915_928";
pub const AS_923: &str = "AS_923";
pub const CN_470_510: &str = "CN_470_510";
pub const CN_779_787: &str = "CN_779_787";
pub const IN_865_867: &str = "IN_865_867";
pub const KR_920_923: &str = "KR_920_923";
pub const RU_864_870: &str = "RU_864_870";
pub const ISM_2400: &str = "ISM_2400";

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub id: &'static str,
    pub sub_bands: &'static [SubBandParameters],
}

const fn sb(min_frequency: u64, max_frequency: u64, duty_cycle: f32) -> SubBandParameters {
    SubBandParameters { min_frequency, max_frequency, duty_cycle }
}

static BANDS: &[Band] = &[
    Band {
        id: EU_863_870,
        sub_bands: &[
            sb(863_000_000, 865_000_000, 0.001),
            sb(865_000_000, 868_000_000, 0.01),
            sb(868_000_000, 868_600_000, 0.01),
            sb(868_700_000, 869_200_000, 0.001),
            sb(869_400_000, 869_650_000, 0.1),
            sb(869_700_000, 870_000_000, 0.01),
        ],
    },
    Band { id: EU_433, sub_bands: &[sb(433_175_000, 434_665_000, 0.01)] },
    Band { id: US_902_928, sub_bands: &[sb(902_000_000, 928_000_000, 1.0)] },
    Band { id: AU_915_928, sub_bands: &[sb(915_000_000, 928_000_000, 1.0)] },
    Band { id: AS_923, sub_bands: &[sb(915_000_000, 928_000_000, 1.0)] },
    Band { id: CN_470_510, sub_bands: &[sb(470_000_000, 510_000_000, 1.0)] },
    Band { id: CN_779_787, sub_bands: &[sb(779_000_000, 787_000_000, 0.01)] },
    Band { id: IN_865_867, sub_bands: &[sb(865_000_000, 867_000_000, 1.0)] },
    Band { id: KR_920_923, sub_bands: &[sb(920_000_000, 923_000_000, 1.0)] },
    Band {
        id: RU_864_870,
        sub_bands: &[
            sb(864_000_000, 865_000_000, 0.001),
            sb(868_700_000, 869_200_000, 0.001),
            sb(869_400_000, 869_650_000, 0.1),
            sb(869_700_000, 870_000_000, 0.01),
        ],
    },
    Band { id: ISM_2400, sub_bands: &[sb(2_400_000_000, 2_500_000_000, 1.0)] },
];

pub fn get(band_id: &str) -> Result<&'static Band> {
    BANDS
        .iter()
        .find(|band| band.id == band_id)
        .ok_or_else(|| Error::UnknownBand { band_id: band_id.to_owned() })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        let eu = get(EU_863_870).unwrap();
        assert_eq!(eu.sub_bands.len(), 6);
        assert!(eu.sub_bands.iter().any(|sb| sb.comprises(868_100_000) && sb.duty_cycle == 0.01));
        assert_eq!(get("MARS_1").unwrap_err(), Error::UnknownBand { band_id: "MARS_1".to_owned() });
    }

    #[test]
    fn default_sub_bands_do_not_overlap() {
        for band in BANDS {
            for (i, a) in band.sub_bands.iter().enumerate() {
                for b in &band.sub_bands[i + 1..] {
                    assert!(!a.overlaps(b), "{}: {:?} overlaps {:?}", band.id, a, b);
                }
            }
        }
    }
}
