use crate::config_fields;
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::num::NonZeroU32;
use std::time::Duration;

const FLOOR: Duration = Duration::from_secs(1);
const CEILING: Duration = Duration::from_secs(30);
const JITTER: f64 = 0.5;
const GROWTH: f64 = 2.0;

/// Fine-tunes a [`Backoff`](crate::Backoff).
///
/// Delays start at the initial interval, grow by the multiplier after every
/// attempt and never exceed the max interval. A max of zero attempts means
/// retrying forever.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    floor: Duration,
    ceiling: Duration,
    jitter: f64,
    growth: f64,
    limit: Option<NonZeroU32>,
}

impl BackoffConfig {
    /// The delay before the first retry.
    pub fn initial_interval(&self) -> Duration {
        self.floor
    }

    /// The upper bound for any single delay.
    pub fn max_interval(&self) -> Duration {
        self.ceiling
    }

    /// The relative jitter applied to every delay, between `0.0` and `1.0`.
    pub fn randomization_factor(&self) -> f64 {
        self.jitter
    }

    /// The factor by which the delay grows after every attempt.
    pub fn multiplier(&self) -> f64 {
        self.growth
    }

    /// The maximum number of attempts, or [`None`] when unbounded.
    pub fn max_attempts(&self) -> Option<NonZeroU32> {
        self.limit
    }
}

impl BackoffConfig {
    /// Replaces the initial interval.
    pub fn with_initial_interval(self, floor: Duration) -> Self {
        Self { floor, ..self }
    }

    /// Replaces the max interval.
    pub fn with_max_interval(self, ceiling: Duration) -> Self {
        Self { ceiling, ..self }
    }

    /// Replaces the randomization factor, clamped to `0.0..=1.0`.
    pub fn with_randomization_factor(self, jitter: f64) -> Self {
        Self {
            jitter: jitter.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Replaces the multiplier.
    pub fn with_multiplier(self, growth: f64) -> Self {
        Self { growth, ..self }
    }

    /// Replaces the attempt limit; zero lifts it.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            limit: NonZeroU32::new(max_attempts),
            ..self
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.floor > self.ceiling {
            return Err(format!(
                "initial interval {:?} exceeds max interval {:?}",
                self.floor, self.ceiling,
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "randomization factor {} is outside of [0, 1]",
                self.jitter,
            ));
        }

        if self.growth < 1.0 {
            return Err(format!("multiplier {} would shrink the delays", self.growth));
        }

        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: FLOOR,
            ceiling: CEILING,
            jitter: JITTER,
            growth: GROWTH,
            limit: None,
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for BackoffConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(BackoffVisitor)
        }
    }

    struct BackoffVisitor;

    impl<'de> Visitor<'de> for BackoffVisitor {
        type Value = BackoffConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of retry pacing")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut floor = None;
            let mut ceiling = None;
            let mut jitter = None;
            let mut growth = None;
            let mut limit: Option<u32> = None;

            while let Some(key) = map.next_key()? {
                match key {
                    BackoffField::initial_interval => key.poll_duration(&mut map, &mut floor)?,
                    BackoffField::max_interval => key.poll_duration(&mut map, &mut ceiling)?,
                    BackoffField::randomization_factor => key.poll(&mut map, &mut jitter)?,
                    BackoffField::multiplier => key.poll(&mut map, &mut growth)?,
                    BackoffField::max_attempts => key.poll(&mut map, &mut limit)?,
                    BackoffField::__ignore => map.next_value()?,
                };
            }

            let config = BackoffConfig {
                floor: floor.unwrap_or(FLOOR),
                ceiling: ceiling.unwrap_or(CEILING),
                jitter: jitter.unwrap_or(JITTER),
                growth: growth.unwrap_or(GROWTH),
                limit: limit.and_then(NonZeroU32::new),
            };

            config.check().map_err(DeError::custom)?;

            Ok(config)
        }
    }

    config_fields!(
        BackoffField,
        initial_interval | interval | reconnection_timeout,
        max_interval | ceiling,
        randomization_factor | jitter,
        multiplier | factor,
        max_attempts | max_reconnection_attempts | attempts,
    );
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn from_empty() {
        // When
        let actual = serde_yml::from_str::<BackoffConfig>("{}").unwrap();

        // Then
        assert_eq!(actual, BackoffConfig::default());
        assert_eq!(actual.max_attempts(), None);
    }

    #[test]
    fn from_aliases() {
        // Given
        let input = r#"
ReconnectionTimeout: 250ms
ceiling: 10
jitter: 0.1
factor: 1.5
MaxReconnectionAttempts: 2
unknown_key: ignored
"#;
        let expected = BackoffConfig::default()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(10))
            .with_randomization_factor(0.1)
            .with_multiplier(1.5)
            .with_max_attempts(2);

        // When
        let actual = serde_yml::from_str::<BackoffConfig>(input).unwrap();

        // Then
        assert_eq!(actual, expected);
        assert_eq!(actual.max_attempts(), NonZeroU32::new(2));
    }

    #[test]
    fn zero_attempts_is_unbounded() {
        // When
        let actual = serde_yml::from_str::<BackoffConfig>("max_attempts: 0").unwrap();

        // Then
        assert_eq!(actual.max_attempts(), None);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        for input in [
            "initial_interval: 1m\nmax_interval: 1s",
            "jitter: 1.5",
            "multiplier: 0.5",
            "interval: 1s\ninitial_interval: 2s",
        ] {
            assert!(
                serde_yml::from_str::<BackoffConfig>(input).is_err(),
                "accepted {:?}",
                input,
            );
        }
    }

    #[test]
    fn builder_clamps_jitter() {
        assert_eq!(
            BackoffConfig::default()
                .with_randomization_factor(3.0)
                .randomization_factor(),
            1.0,
        );
    }
}
