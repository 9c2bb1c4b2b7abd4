use std::{fmt, str::FromStr};

/// Foot that produced a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Foot {
    Left,
    Right,
}

impl FromStr for Foot {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "L" | "l" | "left" | "LEFT" => Ok(Self::Left),
            "1" | "R" | "r" | "right" | "RIGHT" => Ok(Self::Right),
            other => Err(SampleError::Foot(other.to_string())),
        }
    }
}

impl fmt::Display for Foot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("L"),
            Self::Right => f.write_str("R"),
        }
    }
}

/// Why an inbound line was not a usable step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SampleError {
    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),
    #[error("bad timestamp {0:?}")]
    Timestamp(String),
    #[error("bad foot id {0:?}")]
    Foot(String),
    #[error("bad bpm value {0:?}")]
    Bpm(String),
    #[error("bpm {0} outside (0, {1}]")]
    OutOfRange(f64, f64),
}

/// One footstep reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSample {
    pub sensor_timestamp: u64,
    pub foot: Foot,
    pub instantaneous_bpm: f64,
    pub reported_average_bpm: f64,
}

impl StepSample {
    /// Parses `timestamp,foot,instantaneous_bpm,average_bpm`.
    pub fn parse(line: &str, max_bpm: f64) -> Result<Self, SampleError> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let [ts, foot, instant, average] = fields.as_slice() else {
            return Err(SampleError::FieldCount(fields.len()));
        };

        let sensor_timestamp = ts
            .parse::<u64>()
            .map_err(|_| SampleError::Timestamp(ts.to_string()))?;
        let foot = foot.parse::<Foot>()?;
        let instantaneous_bpm = parse_bpm(instant)?;
        let reported_average_bpm = parse_bpm(average)?;

        if instantaneous_bpm <= 0.0 || instantaneous_bpm > max_bpm {
            return Err(SampleError::OutOfRange(instantaneous_bpm, max_bpm));
        }
        if reported_average_bpm < 0.0 {
            return Err(SampleError::OutOfRange(reported_average_bpm, max_bpm));
        }

        Ok(Self {
            sensor_timestamp,
            foot,
            instantaneous_bpm,
            reported_average_bpm,
        })
    }

    /// The sensor's running average, or `None` while it is still zero
    /// (first step after START).
    pub fn reported_bpm(&self) -> Option<f64> {
        (self.reported_average_bpm > 0.0).then_some(self.reported_average_bpm)
    }
}

fn parse_bpm(field: &str) -> Result<f64, SampleError> {
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SampleError::Bpm(field.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let sample = StepSample::parse("1500,1,112.5,110.0\r\n", 300.0).unwrap();
        assert_eq!(sample.sensor_timestamp, 1500);
        assert_eq!(sample.foot, Foot::Right);
        assert_eq!(sample.instantaneous_bpm, 112.5);
        assert_eq!(sample.reported_bpm(), Some(110.0));
    }

    #[test]
    fn zero_average_is_not_reported() {
        let sample = StepSample::parse("10,L,98.0,0", 300.0).unwrap();
        assert_eq!(sample.foot, Foot::Left);
        assert_eq!(sample.instantaneous_bpm, 98.0);
        assert_eq!(sample.reported_bpm(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(
            StepSample::parse("1,0,100", 300.0),
            Err(SampleError::FieldCount(3))
        );
        assert!(matches!(
            StepSample::parse("abc,0,100,100", 300.0),
            Err(SampleError::Timestamp(_))
        ));
        assert!(matches!(
            StepSample::parse("1,2,100,100", 300.0),
            Err(SampleError::Foot(_))
        ));
        assert!(matches!(
            StepSample::parse("1,0,fast,100", 300.0),
            Err(SampleError::Bpm(_))
        ));
    }

    #[test]
    fn rejects_noise_and_non_positive_tempo() {
        assert!(matches!(
            StepSample::parse("1,0,301,100", 300.0),
            Err(SampleError::OutOfRange(..))
        ));
        assert!(matches!(
            StepSample::parse("1,0,0,0", 300.0),
            Err(SampleError::OutOfRange(..))
        ));
        assert!(StepSample::parse("1,0,300,100", 300.0).is_ok());
    }
}
