// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Configuration of the adapter control plane.

use crate::Error;
use std::time::Duration;

/// Timeout applied to single-response waits and to each step of a
/// multi-instance loop.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout applied to GEM-port and T-CONT deletion requests.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a caller may wait for a device entry to become ready.
pub const DEFAULT_ENTRY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for the pre-flight reachability probe. MIB
/// synchronization proceeds regardless of the probe's outcome.
pub const DEFAULT_PROBE_GRACE: Duration = Duration::from_secs(2);

/// Interval at which the status supervisor polls its source.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of each state machine's inbound message queue.
pub const DEFAULT_FSM_QUEUE_DEPTH: usize = 2048;

/// Configuration for the per-device control plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Bound on each wait for a correlated protocol response.
    pub response_timeout: Duration,
    /// Bound on GEM-port / T-CONT deletion operations.
    pub delete_timeout: Duration,
    /// Bound on waiting for device-entry readiness.
    pub entry_wait_timeout: Duration,
    /// Grace period granted to the reachability probe.
    pub probe_grace: Duration,
    /// Poll interval of the status supervisor.
    pub status_poll_interval: Duration,
    /// Depth of each state machine's inbound queue.
    pub fsm_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            entry_wait_timeout: DEFAULT_ENTRY_WAIT_TIMEOUT,
            probe_grace: DEFAULT_PROBE_GRACE,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            fsm_queue_depth: DEFAULT_FSM_QUEUE_DEPTH,
        }
    }
}

/// A builder for [`Config`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigBuilder {
    response_timeout: Option<Duration>,
    delete_timeout: Option<Duration>,
    entry_wait_timeout: Option<Duration>,
    probe_grace: Option<Duration>,
    status_poll_interval: Option<Duration>,
    fsm_queue_depth: Option<usize>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_timeout(mut self, t: Duration) -> Self {
        self.response_timeout = Some(t);
        self
    }

    pub fn delete_timeout(mut self, t: Duration) -> Self {
        self.delete_timeout = Some(t);
        self
    }

    pub fn entry_wait_timeout(mut self, t: Duration) -> Self {
        self.entry_wait_timeout = Some(t);
        self
    }

    pub fn probe_grace(mut self, t: Duration) -> Self {
        self.probe_grace = Some(t);
        self
    }

    pub fn status_poll_interval(mut self, t: Duration) -> Self {
        self.status_poll_interval = Some(t);
        self
    }

    pub fn fsm_queue_depth(mut self, depth: usize) -> Self {
        self.fsm_queue_depth = Some(depth);
        self
    }

    pub fn build(self) -> Result<Config, Error> {
        let defaults = Config::default();
        let config = Config {
            response_timeout: self.response_timeout.unwrap_or(defaults.response_timeout),
            delete_timeout: self.delete_timeout.unwrap_or(defaults.delete_timeout),
            entry_wait_timeout: self
                .entry_wait_timeout
                .unwrap_or(defaults.entry_wait_timeout),
            probe_grace: self.probe_grace.unwrap_or(defaults.probe_grace),
            status_poll_interval: self
                .status_poll_interval
                .unwrap_or(defaults.status_poll_interval),
            fsm_queue_depth: self.fsm_queue_depth.unwrap_or(defaults.fsm_queue_depth),
        };
        if config.response_timeout.is_zero()
            || config.delete_timeout.is_zero()
            || config.entry_wait_timeout.is_zero()
            || config.status_poll_interval.is_zero()
        {
            return Err(Error::InvalidConfig("timeouts must be non-zero"));
        }
        if config.fsm_queue_depth == 0 {
            return Err(Error::InvalidConfig("queue depth must be non-zero"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_builder_overrides() {
        let config = ConfigBuilder::new()
            .response_timeout(Duration::from_secs(5))
            .fsm_queue_depth(16)
            .build()
            .unwrap();
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.fsm_queue_depth, 16);
        assert_eq!(config.delete_timeout, DEFAULT_DELETE_TIMEOUT);
    }

    #[test]
    fn test_config_builder_rejects_zero() {
        assert!(ConfigBuilder::new()
            .response_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ConfigBuilder::new().fsm_queue_depth(0).build().is_err());
    }
}
