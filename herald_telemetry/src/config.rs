use crate::{FormatFlavor, Verbosity};
use herald_core::config_fields;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt::Formatter;

pub mod flavor;
pub mod verbosity;

/// The logging section of the application configuration.
///
/// Per-target verbosity overrides the root verbosity for the named targets,
/// which is the usual way to quiet down chatty dependencies. The parts of an
/// event line are switched on and off under `show`:
///
/// ```yaml
/// verbosity: debug
/// flavor: compact
/// show:
///   file: true
///   line_number: true
/// targets:
///   lapin: warn
///   amq_protocol: off
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracingConfig {
    verbosity: Verbosity,
    flavor: FormatFlavor,
    color: Color,
    show: EventParts,
    targets: BTreeMap<String, Verbosity>,
}

/// Which parts of an event make it into the formatted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventParts {
    /// Timestamp of the event.
    #[serde(alias = "time")]
    pub timestamp: bool,
    /// Target (usually the module path).
    pub target: bool,
    /// Source file.
    pub file: bool,
    /// Source line.
    #[serde(alias = "line")]
    pub line_number: bool,
    /// Level.
    pub level: bool,
    /// Thread id.
    pub thread_id: bool,
    /// Thread name.
    pub thread_name: bool,
}

impl Default for EventParts {
    fn default() -> Self {
        Self {
            timestamp: true,
            target: true,
            file: false,
            line_number: false,
            level: true,
            thread_id: false,
            thread_name: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
struct Color(bool);

impl Default for Color {
    fn default() -> Self {
        Self(true)
    }
}

impl TracingConfig {
    /// Replaces the root verbosity.
    pub fn with_verbosity(self, verbosity: Verbosity) -> Self {
        Self { verbosity, ..self }
    }

    /// Replaces the formatting flavor.
    pub fn with_flavor(self, flavor: FormatFlavor) -> Self {
        Self { flavor, ..self }
    }

    /// Switches ANSI colors on or off.
    pub fn with_color(self, color: bool) -> Self {
        Self {
            color: Color(color),
            ..self
        }
    }

    /// Replaces the displayed event parts.
    pub fn with_parts(self, show: EventParts) -> Self {
        Self { show, ..self }
    }

    /// Adds or replaces the verbosity of a single target.
    pub fn with_target(mut self, target: impl Into<String>, verbosity: Verbosity) -> Self {
        self.targets.insert(target.into(), verbosity);

        self
    }
}

impl TracingConfig {
    /// The root verbosity.
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// The formatting flavor.
    pub fn flavor(&self) -> FormatFlavor {
        self.flavor
    }

    /// Whether ANSI colors are enabled.
    pub fn color(&self) -> bool {
        self.color.0
    }

    /// The displayed event parts.
    pub fn parts(&self) -> EventParts {
        self.show
    }

    /// Per-target verbosity overrides.
    pub fn targets(&self) -> &BTreeMap<String, Verbosity> {
        &self.targets
    }
}

impl AsRef<TracingConfig> for TracingConfig {
    fn as_ref(&self) -> &TracingConfig {
        self
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for TracingConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(TracingConfigVisitor)
        }
    }

    struct TracingConfigVisitor;

    impl<'de> Visitor<'de> for TracingConfigVisitor {
        type Value = TracingConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of logging configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut config = TracingConfig::default();
            let mut verbosity = None;
            let mut flavor = None;
            let mut color = None;
            let mut show = None;
            let mut targets = None;

            while let Some(key) = map.next_key()? {
                match key {
                    LogField::verbosity => key.poll(&mut map, &mut verbosity)?,
                    LogField::flavor => key.poll(&mut map, &mut flavor)?,
                    LogField::color => key.poll(&mut map, &mut color)?,
                    LogField::show => key.poll(&mut map, &mut show)?,
                    LogField::targets => key.poll(&mut map, &mut targets)?,
                    LogField::__ignore => map.next_value()?,
                };
            }

            if let Some(verbosity) = verbosity {
                config.verbosity = verbosity;
            }
            if let Some(flavor) = flavor {
                config.flavor = flavor;
            }
            if let Some(color) = color {
                config.color = color;
            }
            if let Some(show) = show {
                config.show = show;
            }
            if let Some(targets) = targets {
                config.targets = targets;
            }

            Ok(config)
        }
    }

    config_fields!(
        LogField,
        verbosity | level,
        flavor | format,
        color | colour | ansi,
        show | parts | display,
        targets | target_verbosity,
    );
};
