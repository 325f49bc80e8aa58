//! Backend configuration.

use std::time::Duration;

use crate::binding::{SlotAssignment, DEFAULT_SLOT_ASSIGNMENTS, MAX_DESCRIPTOR_SETS};

pub const ENV_THREADING: &str = "LUME_D3D11_THREADING";
pub const ENV_QUERY_TIMEOUT_MS: &str = "LUME_D3D11_QUERY_TIMEOUT_MS";
pub const ENV_MARKERS: &str = "LUME_D3D11_MARKERS";

/// How command contexts record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// Every context shares the immediate recorder.
    #[default]
    Immediate,
    /// Contexts get their own deferred recorder when the device supports it.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct D3D11Config {
    pub threading: ThreadingMode,
    pub slot_assignments: [SlotAssignment; MAX_DESCRIPTOR_SETS],
    /// Upper bound on how long query resolution waits per query. None waits forever.
    pub query_timeout: Option<Duration>,
    /// Forward debug markers to the driver's annotation interface.
    pub debug_markers: bool,
}

impl Default for D3D11Config {
    fn default() -> Self {
        Self {
            threading: ThreadingMode::Immediate,
            slot_assignments: DEFAULT_SLOT_ASSIGNMENTS,
            query_timeout: Some(Duration::from_secs(2)),
            debug_markers: true,
        }
    }
}

impl D3D11Config {
    /// Defaults overlaid with the `LUME_D3D11_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparseable values are logged and ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_THREADING) {
            match value.trim().to_ascii_lowercase().as_str() {
                "immediate" => self.threading = ThreadingMode::Immediate,
                "deferred" => self.threading = ThreadingMode::Deferred,
                other => log::warn!("{}: unknown threading mode {:?}", ENV_THREADING, other),
            }
        }
        if let Some(value) = lookup(ENV_QUERY_TIMEOUT_MS) {
            match value.trim() {
                "0" | "inf" => self.query_timeout = None,
                ms => match ms.parse::<u64>() {
                    Ok(ms) => self.query_timeout = Some(Duration::from_millis(ms)),
                    Err(_) => log::warn!("{}: expected milliseconds, got {:?}", ENV_QUERY_TIMEOUT_MS, ms),
                },
            }
        }
        if let Some(value) = lookup(ENV_MARKERS) {
            match value.trim() {
                "1" | "true" => self.debug_markers = true,
                "0" | "false" => self.debug_markers = false,
                other => log::warn!("{}: expected 0 or 1, got {:?}", ENV_MARKERS, other),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(vars: &[(&str, &str)]) -> D3D11Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        D3D11Config::default().overlay(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = D3D11Config::default();
        assert_eq!(config.threading, ThreadingMode::Immediate);
        assert_eq!(config.query_timeout, Some(Duration::from_secs(2)));
        assert!(config.debug_markers);
        assert_eq!(config.slot_assignments, DEFAULT_SLOT_ASSIGNMENTS);
    }

    #[test]
    fn overrides_parse() {
        let config = overlay(&[
            (ENV_THREADING, "Deferred"),
            (ENV_QUERY_TIMEOUT_MS, "250"),
            (ENV_MARKERS, "0"),
        ]);
        assert_eq!(config.threading, ThreadingMode::Deferred);
        assert_eq!(config.query_timeout, Some(Duration::from_millis(250)));
        assert!(!config.debug_markers);

        assert_eq!(overlay(&[(ENV_QUERY_TIMEOUT_MS, "inf")]).query_timeout, None);
        assert_eq!(overlay(&[(ENV_QUERY_TIMEOUT_MS, "0")]).query_timeout, None);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = overlay(&[(ENV_THREADING, "threaded"), (ENV_QUERY_TIMEOUT_MS, "soon")]);
        assert_eq!(config, D3D11Config::default());
    }
}
