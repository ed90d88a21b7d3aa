// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The status supervisor.
//!
//! A single polling task per adapter watches the status source and
//! forwards state changes to the object model. Starting an already
//! running supervisor is a no-op, so any code path that needs the
//! supervisor may call [`StatusSupervisor::start`] without coordination.

use crate::proxy::ConnectState;
use crate::proxy::CoreProxy;
use crate::proxy::OnuStatusSource;
use crate::proxy::OperState;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct StatusSupervisor {
    log: Logger,
    core: Arc<dyn CoreProxy>,
    source: Arc<dyn OnuStatusSource>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusSupervisor {
    pub fn new(
        core: Arc<dyn CoreProxy>,
        source: Arc<dyn OnuStatusSource>,
        interval: Duration,
        log: &Logger,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "status-supervisor")),
            core,
            source,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the polling task if it is not already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(self.log, "supervisor already running");
            return;
        }
        let log = self.log.clone();
        let core = self.core.clone();
        let source = self.source.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            poll_loop(core, source, interval, log).await;
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the polling task.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for StatusSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    core: Arc<dyn CoreProxy>,
    source: Arc<dyn OnuStatusSource>,
    interval: Duration,
    log: Logger,
) {
    let mut known: HashMap<String, (ConnectState, OperState)> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let statuses = match source.read_status_list() {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(log, "status source unavailable"; "error" => %e);
                continue;
            }
        };
        for status in statuses {
            let current = (status.connect_state, status.oper_state);
            if known.get(&status.mac_address) == Some(&current) {
                continue;
            }
            debug!(
                log,
                "device status changed";
                "device_id" => &status.id,
                "mac_address" => &status.mac_address,
                "connect" => ?status.connect_state,
                "oper" => ?status.oper_state,
            );
            if let Err(e) = core.device_state_update(
                &status.id,
                status.connect_state,
                status.oper_state,
            ) {
                // Retried naturally on the next change; the poll loop
                // itself never stops on a proxy failure.
                warn!(log, "state update failed"; "device_id" => &status.id, "error" => %e);
                continue;
            }
            known.insert(status.mac_address, current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::OnuStatus;
    use crate::test_utils;
    use crate::test_utils::RecordingCoreProxy;
    use crate::test_utils::StaticStatusSource;

    fn status(oper: OperState) -> OnuStatus {
        OnuStatus {
            id: "onu-1".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            oper_state: oper,
            connect_state: ConnectState::Reachable,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_only_changes() {
        let log = test_utils::test_logger();
        let core = Arc::new(RecordingCoreProxy::default());
        let source = Arc::new(StaticStatusSource::default());
        source.set(vec![status(OperState::Active)]);
        let supervisor =
            StatusSupervisor::new(core.clone(), source.clone(), Duration::from_secs(1), &log);

        supervisor.start();
        settle().await;
        // Many polls, one change.
        assert_eq!(
            core.states.lock().unwrap().as_slice(),
            &[(ConnectState::Reachable, OperState::Active)]
        );

        source.set(vec![status(OperState::Failed)]);
        settle().await;
        assert_eq!(core.states.lock().unwrap().len(), 2);
        assert_eq!(
            core.states.lock().unwrap().last(),
            Some(&(ConnectState::Reachable, OperState::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let log = test_utils::test_logger();
        let core = Arc::new(RecordingCoreProxy::default());
        let source = Arc::new(StaticStatusSource::default());
        source.set(vec![status(OperState::Active)]);
        let supervisor =
            StatusSupervisor::new(core.clone(), source.clone(), Duration::from_secs(1), &log);

        supervisor.start();
        supervisor.start();
        assert!(supervisor.is_running());
        settle().await;
        // A second start did not spawn a second reporter.
        assert_eq!(core.states.lock().unwrap().len(), 1);

        supervisor.stop();
        settle().await;
        assert!(!supervisor.is_running());
    }
}
