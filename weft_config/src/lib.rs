//! Typed key-value configuration tree, grounded in
//! `original_source/ljrServer/config.{h,cpp}`'s `Config`/`ConfigVar<T>`.
//!
//! A [`ConfigVar<T>`] is a named, typed, change-observable setting with a
//! compiled-in default. [`Config::lookup`] registers one (or returns the
//! existing one, if the name and type both match) in a process-global
//! registry; [`Config::load_yaml_str`]/[`Config::load_yaml_file`] walk a
//! YAML document and push each leaf value into the matching registered
//! var by dotted name (`fiber.stack_size`, `http.request.buffer_size`,
//! ...). A key present in the YAML that was never looked up by any
//! module is logged at `warn` and otherwise ignored, per spec.md §6.

#![warn(rust_2018_idioms, missing_debug_implementations)]

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config name {0:?} is invalid: names must be lowercase ascii, digits, '.' or '_'")]
    InvalidName(String),
    #[error("config key {name:?} already registered as type {existing}, requested as {requested}")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Type-erased handle to a registered config entry, used by [`Config`] to
/// dispatch a YAML leaf to whichever concrete [`ConfigVar<T>`] owns it.
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn to_yaml_string(&self) -> String;
    fn from_yaml_value(&self, value: &serde_yaml::Value) -> Result<(), ConfigError>;
    fn as_any(&self) -> &dyn Any;
}

type ChangeCb<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, ChangeCb<T>>>,
}

/// A named, typed, observable configuration value.
///
/// Cloning a `ConfigVar` is cheap (it is an `Arc` internally via
/// [`Config::lookup`]'s return type); the type itself is not `Clone`
/// because two clones would otherwise silently share storage without
/// looking like they do.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    inner: Inner<T>,
}

impl<T> fmt::Debug for ConfigVar<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// The current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Sets a new value, notifying listeners with `(old, new)` if it
    /// actually changed.
    pub fn set(&self, v: T) {
        let mut guard = self.inner.value.write();
        if *guard == v {
            return;
        }
        let old = guard.clone();
        *guard = v.clone();
        drop(guard);
        for cb in self.inner.listeners.lock().values() {
            cb(&old, &v);
        }
    }

    /// Registers a callback invoked whenever [`ConfigVar::set`] (or a
    /// YAML load) actually changes the value. Returns a listener id for
    /// [`ConfigVar::remove_listener`].
    pub fn add_listener(&self, cb: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Box::new(cb));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.inner.listeners.lock().remove(&id);
    }

    pub fn clear_listeners(&self) {
        self.inner.listeners.lock().clear();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<T> ConfigVarBase for ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_yaml_string(&self) -> String {
        serde_yaml::to_string(&self.get()).unwrap_or_default()
    }

    fn from_yaml_value(&self, value: &serde_yaml::Value) -> Result<(), ConfigError> {
        let v: T = serde_yaml::from_value(value.clone())?;
        self.set(v);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

struct Registry {
    vars: RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        vars: RwLock::new(HashMap::new()),
    })
}

/// The process-wide configuration tree, analogous to the original's
/// `Config` singleton (`Config::Lookup`/`Config::LoadFromYaml`).
#[derive(Debug)]
pub struct Config;

impl Config {
    /// Returns the registered [`ConfigVar<T>`] for `name`, creating it
    /// with `default` and `description` if this is the first lookup.
    ///
    /// # Panics
    /// Panics if `name` is not a valid config key (lowercase ascii
    /// letters, digits, `.`, `_`), or if `name` was already registered
    /// with a different type — both are programmer-contract violations,
    /// not runtime conditions, per spec.md §7's error taxonomy.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        assert!(is_valid_name(name), "invalid config key name: {name:?}");

        let reg = registry();
        if let Some(existing) = reg.vars.read().get(name) {
            let existing_type = existing.type_name();
            return existing.clone().as_any_arc().downcast::<ConfigVar<T>>().unwrap_or_else(|_| {
                panic!(
                    "config key {name:?} already registered as {existing_type}, requested as {}",
                    std::any::type_name::<T>()
                )
            });
        }

        let mut vars = reg.vars.write();
        if let Some(existing) = vars.get(name) {
            let existing_type = existing.type_name();
            return existing.clone().as_any_arc().downcast::<ConfigVar<T>>().unwrap_or_else(|_| {
                panic!(
                    "config key {name:?} already registered as {existing_type}, requested as {}",
                    std::any::type_name::<T>()
                )
            });
        }

        let var = Arc::new(ConfigVar {
            name: name.to_string(),
            description: description.to_string(),
            inner: Inner {
                value: RwLock::new(default),
                listeners: Mutex::new(HashMap::new()),
            },
        });
        vars.insert(name.to_string(), var.clone());
        var
    }

    /// Merges a YAML document over whatever defaults/values are already
    /// registered. Every mapping path (`a: {b: 1}` -> `a.b`) is matched
    /// against a looked-up var by dotted name; unmatched keys are logged
    /// at `warn` and otherwise ignored.
    pub fn load_yaml_str(yaml: &str) -> Result<(), ConfigError> {
        let root: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let mut flat = Vec::new();
        flatten(&root, String::new(), &mut flat);

        let reg = registry();
        let vars = reg.vars.read();
        for (name, value) in flat {
            match vars.get(&name) {
                Some(var) => {
                    if let Err(e) = var.from_yaml_value(&value) {
                        log::warn!("config key {name:?}: {e}");
                    }
                }
                None => log::warn!("ignoring unknown config key {name:?}"),
            }
        }
        Ok(())
    }

    /// Like [`Config::load_yaml_str`] but reads the document from a file.
    pub fn load_yaml_file(path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_yaml_str(&text)
    }

    /// Invokes `cb` once per registered config var, for introspection
    /// (e.g. a `--print-config` CLI flag).
    pub fn visit(mut cb: impl FnMut(&dyn ConfigVarBase)) {
        for var in registry().vars.read().values() {
            cb(var.as_ref());
        }
    }
}

trait AsAnyArc {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigVarBase + 'static> AsAnyArc for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn flatten(node: &serde_yaml::Value, prefix: String, out: &mut Vec<(String, serde_yaml::Value)>) {
    match node {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = match k.as_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                let dotted = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                if matches!(v, serde_yaml::Value::Mapping(_)) {
                    flatten(v, dotted, out);
                } else {
                    out.push((dotted, v.clone()));
                }
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push((prefix, node.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // Each test uses a unique key namespace since the registry is
    // process-global and shared across `#[test]` threads.

    #[test]
    fn lookup_returns_default_until_loaded() {
        let var = Config::lookup("test_cfg.alpha.port", 8080u64, "listen port");
        assert_eq!(var.get(), 8080);
    }

    #[test]
    fn yaml_load_updates_registered_var_and_ignores_unknown() {
        let var = Config::lookup("test_cfg.beta.timeout", 1000u64, "timeout ms");
        Config::load_yaml_str(
            "test_cfg:\n  beta:\n    timeout: 2500\n  totally_unknown_key: 1\n",
        )
        .unwrap();
        assert_eq!(var.get(), 2500);
    }

    #[test]
    fn second_lookup_with_same_type_returns_same_instance() {
        let a = Config::lookup("test_cfg.gamma.name", "one".to_string(), "");
        let b = Config::lookup("test_cfg.gamma.name", "two".to_string(), "");
        assert_eq!(a.get(), "one", "second lookup must not reset the value");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn second_lookup_with_different_type_panics() {
        let _a = Config::lookup("test_cfg.delta.value", 1u32, "");
        let _b: Arc<ConfigVar<String>> =
            Config::lookup("test_cfg.delta.value", "x".to_string(), "");
    }

    #[test]
    fn listener_fires_only_on_actual_change() {
        let var = Config::lookup("test_cfg.epsilon.count", 5u32, "");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        var.add_listener(move |_old, _new| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        var.set(5);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "no change, no callback");
        var.set(6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
