/// Compares two configuration keys, ignoring case and every character that is
/// not ASCII alphanumeric.
///
/// Under these rules `"max_reconnection_attempts"`, `"MaxReconnectionAttempts"`
/// and `"max-reconnection-attempts"` all name the same key.
pub fn keys_match(a: &str, b: &str) -> bool {
    let mut iter_a = a.chars().filter(char::is_ascii_alphanumeric);
    let mut iter_b = b.chars().filter(char::is_ascii_alphanumeric);

    loop {
        match (iter_a.next(), iter_b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x.eq_ignore_ascii_case(&y) => continue,
            _ => return false,
        }
    }
}

/// Generates a private field-identifier enum for a hand-written serde
/// [`Visitor`](serde::de::Visitor).
///
/// Every variant lists its primary key followed by any number of `|`-separated
/// aliases. Keys are matched with [`keys_match`]; unknown keys become the
/// `__ignore` variant. The generated enum offers `poll` (read the next value,
/// rejecting duplicates), `poll_duration` (same, but parses a humantime
/// string such as `"250ms"` or a number of seconds) and `take` (fail on a
/// missing required field).
#[macro_export]
macro_rules! config_fields {
    ($name:ident, $($primary:ident $(| $alias:ident)*),+ $(,)?) => {
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum $name {
            $($primary,)+
            __ignore,
        }

        #[allow(dead_code)]
        impl $name {
            fn from_key(value: &str) -> Self {
                $(
                    if $crate::keys_match(value, stringify!($primary))
                        $(|| $crate::keys_match(value, stringify!($alias)))*
                    {
                        return Self::$primary;
                    }
                )+

                Self::__ignore
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$primary => stringify!($primary),)+
                    Self::__ignore => "__ignore",
                }
            }

            fn poll<'de, A, T>(
                &self,
                from: &mut A,
                into: &mut Option<T>,
            ) -> Result<$crate::__private::serde::de::IgnoredAny, A::Error>
            where
                A: $crate::__private::serde::de::MapAccess<'de>,
                T: $crate::__private::serde::de::Deserialize<'de>,
            {
                if into.is_some() {
                    return Err($crate::__private::serde::de::Error::duplicate_field(
                        self.as_str(),
                    ));
                }
                *into = Some(from.next_value()?);

                Ok($crate::__private::serde::de::IgnoredAny)
            }

            fn poll_duration<'de, A>(
                &self,
                from: &mut A,
                into: &mut Option<::std::time::Duration>,
            ) -> Result<$crate::__private::serde::de::IgnoredAny, A::Error>
            where
                A: $crate::__private::serde::de::MapAccess<'de>,
            {
                #[derive($crate::__private::serde::Deserialize)]
                #[serde(crate = "herald_core::__private::serde", untagged)]
                enum RawDuration {
                    Seconds(u64),
                    Human(String),
                }

                if into.is_some() {
                    return Err($crate::__private::serde::de::Error::duplicate_field(
                        self.as_str(),
                    ));
                }

                let duration = match from.next_value::<RawDuration>()? {
                    RawDuration::Seconds(seconds) => ::std::time::Duration::from_secs(seconds),
                    RawDuration::Human(string) => {
                        $crate::__private::humantime::parse_duration(&string)
                            .map_err($crate::__private::serde::de::Error::custom)?
                    }
                };
                *into = Some(duration);

                Ok($crate::__private::serde::de::IgnoredAny)
            }

            fn take<T, E>(&self, from: Option<T>) -> Result<T, E>
            where
                E: $crate::__private::serde::de::Error,
            {
                from.ok_or_else(|| {
                    $crate::__private::serde::de::Error::missing_field(self.as_str())
                })
            }
        }

        impl<'de> $crate::__private::serde::de::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: $crate::__private::serde::de::Deserializer<'de>,
            {
                struct KeyVisitor;

                impl $crate::__private::serde::de::Visitor<'_> for KeyVisitor {
                    type Value = $name;

                    fn expecting(
                        &self,
                        formatter: &mut ::std::fmt::Formatter,
                    ) -> ::std::fmt::Result {
                        formatter.write_str("a configuration key")
                    }

                    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
                    where
                        E: $crate::__private::serde::de::Error,
                    {
                        Ok($name::from_key(value))
                    }
                }

                deserializer.deserialize_identifier(KeyVisitor)
            }
        }
    };
}
