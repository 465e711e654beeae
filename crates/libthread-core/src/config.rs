//! Runtime configuration.
//!
//! Values come from [`RuntimeConfig::default`], from JSON, or from the
//! environment:
//! - `LIBTHREAD_STACK_SIZE`: initial stack bytes per thread (default 64 KiB).
//!   Accepts plain bytes or a `k`/`m` suffix.
//! - `LIBTHREAD_MAX_STACK_SIZE`: how far a stack may grow (default 1 MiB).
//! - `LIBTHREAD_REGISTRY_BUCKETS`: TCB registry bucket count (default 16).
//! - `LIBTHREAD_EVENT_CAPACITY`: event journal length, 0 disables (default 256).
//!
//! Unset variables keep their default; malformed ones are an error rather
//! than silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::kernel::page_ceil;

pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_REGISTRY_BUCKETS: usize = 16;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

pub const ENV_STACK_SIZE: &str = "LIBTHREAD_STACK_SIZE";
pub const ENV_MAX_STACK_SIZE: &str = "LIBTHREAD_MAX_STACK_SIZE";
pub const ENV_REGISTRY_BUCKETS: &str = "LIBTHREAD_REGISTRY_BUCKETS";
pub const ENV_EVENT_CAPACITY: &str = "LIBTHREAD_EVENT_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub stack_size: usize,
    pub max_stack_size: usize,
    pub registry_buckets: usize,
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            registry_buckets: DEFAULT_REGISTRY_BUCKETS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with a given initial stack size; growth limit is raised to
    /// match if needed.
    #[must_use]
    pub fn with_stack_size(stack_size: usize) -> Self {
        let defaults = Self::default();
        Self {
            stack_size,
            max_stack_size: defaults.max_stack_size.max(stack_size),
            ..defaults
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`] with a caller-supplied variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let fields: [(&'static str, &mut usize, bool); 4] = [
            (ENV_STACK_SIZE, &mut config.stack_size, true),
            (ENV_MAX_STACK_SIZE, &mut config.max_stack_size, true),
            (ENV_REGISTRY_BUCKETS, &mut config.registry_buckets, false),
            (ENV_EVENT_CAPACITY, &mut config.event_capacity, false),
        ];
        for (key, slot, sized) in fields {
            if let Some(raw) = lookup(key) {
                let parsed = if sized {
                    parse_size(&raw)
                } else {
                    raw.trim().parse().ok()
                };
                *slot = parsed.ok_or(ConfigError::Parse { key, value: raw })?;
            }
        }
        Ok(config)
    }

    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document).map_err(|err| ConfigError::Document(err.to_string()))
    }

    /// Check the values and round stack sizes up to whole pages.
    ///
    /// A stack slot spans `max_stack_size` plus a handler page and a guard
    /// page, so that sum must fit in a `usize` too.
    pub fn validate(&self, page_size: usize) -> Result<Self, ConfigError> {
        if self.registry_buckets == 0 {
            return Err(ConfigError::Zero {
                field: "registry_buckets",
            });
        }
        let stack = round_to_pages("stack_size", self.stack_size, page_size)?;
        let max = round_to_pages("max_stack_size", self.max_stack_size, page_size)?;
        if max < stack {
            return Err(ConfigError::MaxBelowInitial { stack, max });
        }
        page_size
            .checked_mul(2)
            .and_then(|guards| max.checked_add(guards))
            .ok_or(ConfigError::TooLarge {
                field: "max_stack_size",
                value: max,
            })?;
        Ok(Self {
            stack_size: stack,
            max_stack_size: max,
            ..self.clone()
        })
    }
}

/// Round `value` up to a whole number of pages, rejecting zero and overflow.
fn round_to_pages(field: &'static str, value: usize, page_size: usize) -> Result<usize, ConfigError> {
    let rounded = page_ceil(value, page_size).ok_or(ConfigError::TooLarge { field, value })?;
    if rounded == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(rounded)
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = match raw.as_bytes().last()? {
        b'k' => (&raw[..raw.len() - 1], 1024),
        b'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw.as_str(), 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}
