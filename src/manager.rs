//! Ownership of the runtime instance set: one supervisor task per instance,
//! bounded restart, and coordinated shutdown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{ConfigStore, InstanceConf};
use crate::duration::format_duration;
use crate::instance::{Instance, InstanceState};

pub struct Manager {
    config: Arc<ConfigStore>,
    inner: RwLock<Inner>,
    /// Global stop signal, cancelled at most once, observed by every
    /// supervisor select.
    stop: CancellationToken,
    tracker: TaskTracker,
}

struct Inner {
    instances: Vec<Arc<Instance>>,
    by_name: HashMap<String, Arc<Instance>>,
}

impl Manager {
    pub fn new(config: Arc<ConfigStore>) -> Arc<Self> {
        let mut inner = Inner {
            instances: Vec::new(),
            by_name: HashMap::new(),
        };
        for ic in config.instances() {
            let inst = Arc::new(Instance::new(ic.clone(), config.clone()));
            inner.instances.push(inst.clone());
            inner.by_name.insert(ic.name, inst);
        }
        Arc::new(Self {
            config,
            inner: RwLock::new(inner),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("manager lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("manager lock poisoned")
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.read().instances.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.read().by_name.get(name).cloned()
    }

    /// Launch a supervisor loop for every declared instance.
    pub fn start_all(self: &Arc<Self>) {
        for inst in self.instances() {
            self.supervise(inst);
        }
    }

    /// Operator start: reset the restart budget and launch a fresh supervisor
    /// loop. Against an already-supervised instance the new loop observes
    /// "already running" from `start` and exits.
    pub fn start_instance(self: &Arc<Self>, name: &str) {
        let Some(inst) = self.get(name) else { return };
        inst.reset_restarts();
        self.supervise(inst);
    }

    pub fn stop_instance(&self, name: &str) {
        let Some(inst) = self.get(name) else { return };
        inst.stop();
    }

    /// Operator restart: stop, give the exit observer a moment to reap, then
    /// supervise anew with a fresh restart budget.
    pub async fn restart_instance(self: &Arc<Self>, name: &str) {
        let Some(inst) = self.get(name) else { return };
        inst.reset_restarts();
        inst.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.supervise(inst);
    }

    /// Register a new instance. It is not started; the operator or a bulk
    /// action does that explicitly.
    pub fn add_instance(&self, ic: InstanceConf) {
        let inst = Arc::new(Instance::new(ic.clone(), self.config.clone()));
        let mut inner = self.write();
        inner.instances.push(inst.clone());
        inner.by_name.insert(ic.name, inst);
    }

    /// Unlink first, then stop: the supervisor's `is_managed` check must fail
    /// before the instance can observe the stop, or the loop would restart it.
    pub fn remove_instance(&self, name: &str) {
        let inst = {
            let mut inner = self.write();
            let Some(inst) = inner.by_name.remove(name) else {
                return;
            };
            inner.instances.retain(|other| !Arc::ptr_eq(other, &inst));
            inst
        };
        inst.stop();
    }

    fn is_managed(&self, inst: &Arc<Instance>) -> bool {
        self.read()
            .by_name
            .get(inst.name())
            .is_some_and(|current| Arc::ptr_eq(current, inst))
    }

    fn supervise(self: &Arc<Self>, inst: Arc<Instance>) {
        let mgr = self.clone();
        self.tracker.spawn(async move {
            mgr.run_with_restart(inst).await;
        });
    }

    async fn run_with_restart(&self, inst: Arc<Instance>) {
        loop {
            if !self.is_managed(&inst) {
                return;
            }

            let mut exit_rx = match inst.start() {
                Ok(rx) => rx,
                Err(err) => {
                    warn!("[{}] failed to start: {err:#}", inst.name());
                    return;
                }
            };

            if let Some(token) = inst.incarnation_token() {
                let interval = self.config.health_check_interval();
                tokio::spawn(health_check_loop(inst.clone(), token, interval));
            }

            tokio::select! {
                _ = &mut exit_rx => {}
                _ = self.stop.cancelled() => {
                    inst.stop();
                    return;
                }
            }

            // Operator-initiated stop ends supervision.
            if inst.state() == InstanceState::Stopped {
                return;
            }

            inst.increment_restarts();
            let count = inst.restart_count();
            let max = self.config.max_restarts();
            if max > 0 && count >= max {
                warn!("[{}] reached max restarts ({max}), giving up", inst.name());
                return;
            }

            inst.set_state(InstanceState::Restarting);
            let delay = self.config.restart_delay();
            info!(
                "[{}] restarting in {} (restart {count})",
                inst.name(),
                format_duration(delay)
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {
                    inst.set_state(InstanceState::Stopped);
                    return;
                }
            }
        }
    }

    /// Cancel the global stop signal, stop every instance, and wait for all
    /// supervisor loops to wind down.
    pub async fn shutdown(&self) {
        info!("shutting down all instances...");
        self.stop.cancel();
        for inst in self.instances() {
            inst.stop();
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("all instances stopped");
    }
}

/// Per-incarnation probe loop: every interval, probe a starting or running
/// child and promote it to running on success. Exits when the incarnation's
/// stop token fires.
async fn health_check_loop(inst: Arc<Instance>, stop: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let state = inst.state();
                if matches!(state, InstanceState::Starting | InstanceState::Running)
                    && inst.check_health().await
                {
                    inst.mark_running();
                }
            }
            _ = stop.cancelled() => return,
        }
    }
}
