use crate::config::Config;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One telemetry sample. Serialized field names and order match the
/// ingestion pipeline schema: machineId, temperature, vibration, timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub machine_id: String,
    /// Degrees Celsius.
    pub temperature: f64,
    /// Millimeters per second.
    pub vibration: f64,
    /// Unix seconds, sampled at generation time.
    pub timestamp: u64,
}

/// Value bands and anomaly policy for the simulated machine.
///
/// Anomaly offsets are additive on top of the drawn normal-band value, so an
/// anomalous reading always sits a fixed distance above wherever the normal
/// draw landed.
#[derive(Debug, Clone)]
pub struct GeneratorProfile {
    pub machine_id: String,
    pub temp_min: f64,
    pub temp_max: f64,
    pub vibration_min: f64,
    pub vibration_max: f64,
    pub anomaly_temp_delta: f64,
    pub anomaly_vibration_delta: f64,
    pub anomaly_probability: f64,
}

impl Default for GeneratorProfile {
    fn default() -> Self {
        Self {
            machine_id: crate::config::DEFAULT_MACHINE_ID.to_string(),
            temp_min: 65.0,
            temp_max: 70.0,
            vibration_min: 1.2,
            vibration_max: 1.5,
            anomaly_temp_delta: 15.0,
            anomaly_vibration_delta: 2.0,
            anomaly_probability: 0.10,
        }
    }
}

impl GeneratorProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            machine_id: config.machine_id.clone(),
            anomaly_probability: config.anomaly_probability,
            ..Self::default()
        }
    }

    /// Independent biased coin flip per cycle; memoryless, no streak logic.
    pub fn draw_anomaly<R: Rng>(&self, rng: &mut R) -> bool {
        rng.gen_bool(self.anomaly_probability)
    }

    pub fn generate_reading<R: Rng>(&self, rng: &mut R, anomaly: bool) -> TelemetryReading {
        let mut temperature = rng.gen_range(self.temp_min..self.temp_max);
        let mut vibration = rng.gen_range(self.vibration_min..self.vibration_max);
        if anomaly {
            temperature += self.anomaly_temp_delta;
            vibration += self.anomaly_vibration_delta;
        }

        TelemetryReading {
            machine_id: self.machine_id.clone(),
            temperature,
            vibration,
            timestamp: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn normal_readings_stay_in_the_normal_bands() {
        let profile = GeneratorProfile::default();
        let mut rng = thread_rng();
        for _ in 0..1_000 {
            let reading = profile.generate_reading(&mut rng, false);
            assert!((65.0..70.0).contains(&reading.temperature));
            assert!((1.2..1.5).contains(&reading.vibration));
        }
    }

    #[test]
    fn anomalous_readings_are_shifted_by_the_fixed_offsets() {
        let profile = GeneratorProfile::default();
        let mut rng = thread_rng();
        for _ in 0..1_000 {
            let reading = profile.generate_reading(&mut rng, true);
            assert!((80.0..85.0).contains(&reading.temperature));
            assert!((3.2..3.5).contains(&reading.vibration));
        }
    }

    #[test]
    fn anomaly_rate_matches_the_configured_probability() {
        let profile = GeneratorProfile::default();
        let mut rng = thread_rng();

        let n = 10_000u32;
        let anomalies = (0..n).filter(|_| profile.draw_anomaly(&mut rng)).count() as f64;

        // Binomial(n, 0.1): mean 1000, sigma ~30. Allow three sigma.
        let expected = f64::from(n) * profile.anomaly_probability;
        let sigma = (expected * (1.0 - profile.anomaly_probability)).sqrt();
        assert!(
            (anomalies - expected).abs() <= 3.0 * sigma,
            "observed {} anomalies, expected {} +/- {}",
            anomalies,
            expected,
            3.0 * sigma
        );
    }

    #[test]
    fn timestamps_are_monotonically_non_decreasing() {
        let profile = GeneratorProfile::default();
        let mut rng = thread_rng();
        let mut last = 0u64;
        for _ in 0..100 {
            let reading = profile.generate_reading(&mut rng, false);
            assert!(reading.timestamp >= last);
            last = reading.timestamp;
        }
    }

    #[test]
    fn json_round_trip_preserves_all_four_fields() {
        let reading = TelemetryReading {
            machine_id: "NC_Machine_AC".to_string(),
            temperature: 67.3125,
            vibration: 1.375,
            timestamp: 1_756_000_000,
        };

        let json = serde_json::to_string(&reading).unwrap();
        let back: TelemetryReading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn wire_format_uses_the_pipeline_field_names_in_order() {
        let reading = TelemetryReading {
            machine_id: "NC_Machine_AC".to_string(),
            temperature: 66.0,
            vibration: 1.3,
            timestamp: 1,
        };

        let json = serde_json::to_string(&reading).unwrap();
        let machine = json.find("\"machineId\"").unwrap();
        let temperature = json.find("\"temperature\"").unwrap();
        let vibration = json.find("\"vibration\"").unwrap();
        let timestamp = json.find("\"timestamp\"").unwrap();
        assert!(machine < temperature);
        assert!(temperature < vibration);
        assert!(vibration < timestamp);
    }
}
