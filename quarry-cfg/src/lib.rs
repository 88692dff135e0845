//! Configuration flags for `quarry` itself.
//!
//! The types in this crate should _not_ be used for configuration of build rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use compact_str::CompactString;
use quarry_ore::assert_none;

/// A single configuration setting.
///
/// Define these as `static`s next to the code they configure, then register
/// them into a [`ConfigSet`] during startup.
pub struct Config<V: ConfigKind> {
    name: &'static str,
    desc: &'static str,
    default: V,
}

impl<V: ConfigKind> Config<V> {
    /// Define a new [`Config`] with a default value.
    pub const fn new(name: &'static str, desc: &'static str, default: V) -> Self {
        Config {
            name,
            desc,
            default,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Read the value of this [`Config`] from the provided [`ConfigSet`].
    ///
    /// # Panics
    /// * If this [`Config`] was never registered into the set.
    pub fn read(&self, set: &ConfigSet) -> V::Stored {
        let Some(entry) = set.configs.get(self.name) else {
            panic!("tried to read unregistered config {}", self.name);
        };
        let value = entry.value.read().expect("config lock poisoned");
        V::from_value(&value)
            .unwrap_or_else(|| unreachable!("config {} stored with wrong kind", self.name))
    }
}

/// A thread-safe shareable set of [`Config`]s.
#[derive(Clone, Debug)]
pub struct ConfigSet {
    configs: Arc<BTreeMap<CompactString, ConfigEntry>>,
}

impl ConfigSet {
    /// Returns a new [`ConfigSetBuilder`].
    pub fn builder() -> ConfigSetBuilder {
        ConfigSetBuilder::default()
    }

    /// Update a [`Config`] in this [`ConfigSet`] with the specified value.
    ///
    /// # Panics
    /// * If the [`Config`] was not previously registered with the original
    ///   [`ConfigSetBuilder`].
    pub fn update<V: ConfigKind>(&self, config: &'static Config<V>, value: V) {
        let entry = self
            .configs
            .get(config.name)
            .expect("tried to update unregistered config");
        let mut stored = entry.value.write().expect("config lock poisoned");
        *stored = value.to_value();
    }

    /// Update the [`Config`] in this [`ConfigSet`] named `name` to `value`.
    ///
    /// # Errors
    ///
    /// * If no config named `name` exists in this set.
    /// * If the config specified by `name` cannot parse `value`.
    pub fn try_update(&self, name: &str, value: &str) -> Result<(), anyhow::Error> {
        let entry = self
            .configs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no Config named '{name}' found"))?;
        let mut stored = entry.value.write().expect("config lock poisoned");
        *stored = stored.parse_same_kind(value)?;
        Ok(())
    }
}

impl fmt::Display for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, entry) in &*self.configs {
            let value = entry.value.read().expect("config lock poisoned");
            writeln!(f, "{} => {}\n\t└─ '{}'", name, *value, entry.desc)?;
        }
        Ok(())
    }
}

/// Single entry within a [`ConfigSet`].
#[derive(Debug)]
struct ConfigEntry {
    value: RwLock<ConfigValue>,
    desc: &'static str,
}

/// A builder for a [`ConfigSet`].
#[derive(Default, Debug)]
pub struct ConfigSetBuilder {
    configs: BTreeMap<CompactString, (ConfigValue, &'static str)>,
}

impl ConfigSetBuilder {
    /// Register a [`Config`] into this [`ConfigSetBuilder`] with the default value.
    ///
    /// # Panics
    /// * If the same config is registered more than once.
    pub fn register<V: ConfigKind>(&mut self, config: &'static Config<V>) -> &mut Self {
        let prev = self.configs.insert(
            CompactString::const_new(config.name),
            (config.default.to_value(), config.desc),
        );
        assert_none!(prev, "config '{}' registered more than once", config.name);
        self
    }

    /// Consumes this [`ConfigSetBuilder`] constructing a [`ConfigSet`].
    pub fn build(self) -> ConfigSet {
        let configs = self
            .configs
            .into_iter()
            .map(|(name, (value, desc))| {
                let entry = ConfigEntry {
                    value: RwLock::new(value),
                    desc,
                };
                (name, entry)
            })
            .collect();
        ConfigSet {
            configs: Arc::new(configs),
        }
    }
}

/// "Type erased" configuration values.
///
/// We prefer an enum as opposed to something like `Box<dyn Value>` because enums
/// offer better performance and are easier to reason about.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    String(CompactString),
}

impl ConfigValue {
    /// Parse `raw` into a value of the same kind as `self`.
    fn parse_same_kind(&self, raw: &str) -> Result<ConfigValue, anyhow::Error> {
        let parsed = match self {
            ConfigValue::Bool(_) => ConfigValue::Bool(raw.parse()?),
            ConfigValue::I64(_) => ConfigValue::I64(raw.parse()?),
            ConfigValue::U64(_) => ConfigValue::U64(raw.parse()?),
            ConfigValue::String(_) => ConfigValue::String(CompactString::new(raw)),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(val) => write!(f, "{val}"),
            ConfigValue::I64(val) => write!(f, "{val}"),
            ConfigValue::U64(val) => write!(f, "{val}"),
            ConfigValue::String(val) => write!(f, "{val}"),
        }
    }
}

/// Types that can back a [`Config`].
pub trait ConfigKind {
    /// The type returned when reading from a [`ConfigSet`].
    type Stored;

    fn to_value(&self) -> ConfigValue;
    fn from_value(value: &ConfigValue) -> Option<Self::Stored>;
}

impl ConfigKind for bool {
    type Stored = bool;

    fn to_value(&self) -> ConfigValue {
        ConfigValue::Bool(*self)
    }

    fn from_value(value: &ConfigValue) -> Option<bool> {
        match value {
            ConfigValue::Bool(val) => Some(*val),
            _ => None,
        }
    }
}

impl ConfigKind for i64 {
    type Stored = i64;

    fn to_value(&self) -> ConfigValue {
        ConfigValue::I64(*self)
    }

    fn from_value(value: &ConfigValue) -> Option<i64> {
        match value {
            ConfigValue::I64(val) => Some(*val),
            _ => None,
        }
    }
}

impl ConfigKind for u64 {
    type Stored = u64;

    fn to_value(&self) -> ConfigValue {
        ConfigValue::U64(*self)
    }

    fn from_value(value: &ConfigValue) -> Option<u64> {
        match value {
            ConfigValue::U64(val) => Some(*val),
            _ => None,
        }
    }
}

impl ConfigKind for &'static str {
    type Stored = CompactString;

    fn to_value(&self) -> ConfigValue {
        ConfigValue::String(CompactString::const_new(self))
    }

    fn from_value(value: &ConfigValue) -> Option<CompactString> {
        match value {
            ConfigValue::String(val) => Some(val.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static TEST_CONFIG_A: Config<bool> =
        Config::new("test_config_a", "A test configuration value.", true);
    pub static TEST_CONFIG_B: Config<&'static str> =
        Config::new("test_config_b", "A test configuration value.", "foobar");

    #[test]
    fn smoketest_read() {
        let mut config_set = ConfigSet::builder();
        config_set.register(&TEST_CONFIG_A).register(&TEST_CONFIG_B);
        let config_set = config_set.build();

        assert_eq!(TEST_CONFIG_A.read(&config_set), true);
        assert_eq!(TEST_CONFIG_B.read(&config_set), "foobar");
    }

    #[test]
    fn smoketest_update() {
        let mut config_set = ConfigSet::builder();
        config_set.register(&TEST_CONFIG_A).register(&TEST_CONFIG_B);
        let config_set = config_set.build();
        let config_set_2 = config_set.clone();

        config_set.update(&TEST_CONFIG_A, false);
        assert_eq!(TEST_CONFIG_A.read(&config_set), false);
        assert_eq!(
            TEST_CONFIG_A.read(&config_set),
            TEST_CONFIG_A.read(&config_set_2)
        );

        config_set.update(&TEST_CONFIG_B, "hello world!");
        assert_eq!(TEST_CONFIG_B.read(&config_set), "hello world!");
        assert_eq!(
            TEST_CONFIG_B.read(&config_set),
            TEST_CONFIG_B.read(&config_set_2)
        );
    }

    #[test]
    fn smoketest_parse() {
        let mut config_set = ConfigSet::builder();
        config_set.register(&TEST_CONFIG_A).register(&TEST_CONFIG_B);
        let config_set = config_set.build();

        config_set.try_update("test_config_a", "false").unwrap();
        assert_eq!(TEST_CONFIG_A.read(&config_set), false);

        config_set.try_update("test_config_b", "anotha one").unwrap();
        assert_eq!(TEST_CONFIG_B.read(&config_set), "anotha one");

        let err = config_set.try_update("test_config_a", "not-a-bool");
        assert!(err.is_err());

        let err = config_set.try_update("never_registered", "true");
        assert!(err.is_err());
    }
}
