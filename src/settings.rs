use std::time::Duration;

use crate::event::EventDelivery;
use crate::types::IndexMatch;

/// Default blocking bound for `Pipeline::wait_for_frames`.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Runtime-wide knobs. `Settings::from_env()` is what `Runtime::new` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub wait_timeout: Duration,
    pub delivery: EventDelivery,
    pub index_match: IndexMatch,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            delivery: EventDelivery::Immediate,
            index_match: IndexMatch::ZeroMatchesAny,
        }
    }
}

impl Settings {
    /// Read overrides from `DEPTHLINK_*` environment variables.
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let wait_timeout = Self::read_env_u64("DEPTHLINK_WAIT_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.wait_timeout);

        let delivery = match Self::read_env_string("DEPTHLINK_EVENT_DELIVERY", "immediate").as_str() {
            "immediate" => EventDelivery::Immediate,
            "queued" => EventDelivery::Queued,
            other => {
                log::warn!(
                    "Unknown DEPTHLINK_EVENT_DELIVERY='{}', using immediate (supported: immediate|queued)",
                    other
                );
                EventDelivery::Immediate
            }
        };

        let index_match = if Self::read_env_bool("DEPTHLINK_STRICT_STREAM_INDEX", false) {
            IndexMatch::Exact
        } else {
            IndexMatch::ZeroMatchesAny
        };

        let settings = Self {
            wait_timeout,
            delivery,
            index_match,
        };
        log::debug!(
            "settings: waitTimeout={}ms delivery={:?} indexMatch={:?}",
            settings.wait_timeout.as_millis(),
            settings.delivery,
            settings.index_match
        );
        settings
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_delivery(mut self, delivery: EventDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_index_match(mut self, index_match: IndexMatch) -> Self {
        self.index_match = index_match;
        self
    }

    fn read_env_bool(name: &str, default: bool) -> bool {
        std::env::var(name)
            .ok()
            .and_then(|v| {
                let v = v.trim().to_ascii_lowercase();
                match v.as_str() {
                    "1" | "true" | "yes" | "on" => Some(true),
                    "0" | "false" | "no" | "off" => Some(false),
                    _ => None,
                }
            })
            .unwrap_or(default)
    }

    fn read_env_u64(name: &str) -> Option<u64> {
        let raw = std::env::var(name).ok()?;
        match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Ignoring {}='{}': expected milliseconds", name, raw);
                None
            }
        }
    }

    fn read_env_string(name: &str, default: &str) -> String {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.wait_timeout, Duration::from_millis(5000));
        assert_eq!(s.delivery, EventDelivery::Immediate);
        assert_eq!(s.index_match, IndexMatch::ZeroMatchesAny);
    }

    // Single test touching the environment so parallel tests don't race on it.
    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("DEPTHLINK_WAIT_TIMEOUT_MS", "250");
        std::env::set_var("DEPTHLINK_EVENT_DELIVERY", " Queued ");
        std::env::set_var("DEPTHLINK_STRICT_STREAM_INDEX", "yes");
        let s = Settings::from_env();
        assert_eq!(s.wait_timeout, Duration::from_millis(250));
        assert_eq!(s.delivery, EventDelivery::Queued);
        assert_eq!(s.index_match, IndexMatch::Exact);

        std::env::set_var("DEPTHLINK_WAIT_TIMEOUT_MS", "soon");
        std::env::set_var("DEPTHLINK_EVENT_DELIVERY", "carrier-pigeon");
        std::env::set_var("DEPTHLINK_STRICT_STREAM_INDEX", "maybe");
        let s = Settings::from_env();
        assert_eq!(s, Settings::default());

        std::env::remove_var("DEPTHLINK_WAIT_TIMEOUT_MS");
        std::env::remove_var("DEPTHLINK_EVENT_DELIVERY");
        std::env::remove_var("DEPTHLINK_STRICT_STREAM_INDEX");
    }
}
