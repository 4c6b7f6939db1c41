//! `MainThreadConfiguration`: settings served from the `[settings]` table.

use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::errors::RemoteError;
use crate::rpc::{unknown_method, Args, LocalService, RpcValue, ServiceFuture, ServiceResult};
use crate::services::methods::main_configuration as m;
use crate::services::MainService;

/// Dotted-key view over a TOML settings table.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    settings: RwLock<toml::Table>,
}

impl ConfigurationStore {
    /// Serve `settings`.
    #[must_use]
    pub fn new(settings: toml::Table) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Value at a dotted `section`, or the whole table for `None`/empty.
    #[must_use]
    pub fn section(&self, section: Option<&str>) -> RpcValue {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        match section.filter(|s| !s.is_empty()) {
            None => RpcValue::from(&toml::Value::Table(settings.clone())),
            Some(section) => lookup(&settings, section).map_or(RpcValue::Null, RpcValue::from),
        }
    }

    /// Whole settings table as an RPC map.
    #[must_use]
    pub fn snapshot(&self) -> RpcValue {
        self.section(None)
    }

    /// Set a dotted key, creating intermediate tables. `Null` removes it.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error for an empty key, a value with
    /// no TOML representation, or a path through a non-table value.
    pub fn update(&self, key: &str, value: &RpcValue) -> Result<(), RemoteError> {
        let Some(value) = to_toml(value) else {
            return self.remove(key);
        };
        let (parents, leaf) = split_key(key)?;

        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let mut table = &mut *settings;
        for part in parents {
            let entry = table
                .entry(part.to_owned())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            table = entry.as_table_mut().ok_or_else(|| {
                RemoteError::invalid_args(format!("'{part}' in '{key}' is not a table"))
            })?;
        }
        table.insert(leaf.to_owned(), value);
        debug!(key, "configuration option updated");
        Ok(())
    }

    /// Remove a dotted key; missing keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_arguments` error for an empty key.
    pub fn remove(&self, key: &str) -> Result<(), RemoteError> {
        let (parents, leaf) = split_key(key)?;
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let mut table = &mut *settings;
        for part in parents {
            match table.get_mut(part).and_then(toml::Value::as_table_mut) {
                Some(next) => table = next,
                None => return Ok(()),
            }
        }
        if table.remove(leaf).is_some() {
            debug!(key, "configuration option removed");
        }
        Ok(())
    }

    fn dispatch(&self, method: &str, args: &[RpcValue]) -> ServiceResult {
        let reader = Args::new(method, args);
        match method {
            m::GET_CONFIGURATION => Ok(self.section(reader.opt_string(0, "section")?)),
            m::UPDATE_OPTION => {
                self.update(reader.string(0, "key")?, reader.value(1))?;
                Ok(RpcValue::Null)
            }
            _ => {
                self.remove(reader.string(0, "key")?)?;
                Ok(RpcValue::Null)
            }
        }
    }
}

impl LocalService for ConfigurationStore {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::GET_CONFIGURATION | m::UPDATE_OPTION | m::REMOVE_OPTION => {
                Box::pin(async move { self.dispatch(method, &args) })
            }
            _ => unknown_method(MainService::Configuration.name(), method),
        }
    }
}

fn split_key(key: &str) -> Result<(Vec<&str>, &str), RemoteError> {
    let mut parts: Vec<&str> = key.split('.').collect();
    match parts.pop() {
        Some(leaf) if !leaf.is_empty() && parts.iter().all(|p| !p.is_empty()) => Ok((parts, leaf)),
        _ => Err(RemoteError::invalid_args(format!(
            "invalid configuration key '{key}'"
        ))),
    }
}

fn lookup<'t>(table: &'t toml::Table, dotted: &str) -> Option<&'t toml::Value> {
    let mut parts = dotted.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

/// TOML form of an RPC value; `None` for `Null`.
fn to_toml(value: &RpcValue) -> Option<toml::Value> {
    Some(match value {
        RpcValue::Null => return None,
        RpcValue::Bool(b) => toml::Value::Boolean(*b),
        RpcValue::Int(n) => toml::Value::Integer(*n),
        RpcValue::Float(f) => toml::Value::Float(*f),
        RpcValue::String(s) => toml::Value::String(s.clone()),
        RpcValue::Uri(uri) => toml::Value::String(uri.to_string()),
        RpcValue::Buffer(bytes) => toml::Value::Array(
            bytes
                .iter()
                .map(|b| toml::Value::Integer(i64::from(*b)))
                .collect(),
        ),
        RpcValue::List(items) => toml::Value::Array(items.iter().filter_map(to_toml).collect()),
        RpcValue::Map(map) => toml::Value::Table(
            map.iter()
                .filter_map(|(k, v)| to_toml(v).map(|v| (k.clone(), v)))
                .collect(),
        ),
    })
}
