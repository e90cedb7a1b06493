//! Start, stop, and delete transitions.

use std::future::Future;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MachineLock, Orchestrator};
use crate::config::StopRoutePolicy;
use crate::contracts::RouteEvent;
use crate::engine::EngineConnector;
use crate::error::ProcessingError;
use crate::model::{Machine, MachineStatus};

impl Orchestrator {
    /// Start a stopped machine. Starting a running machine changes nothing
    /// but the route announcement under the retract policy.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown machine, `InvalidTransition` for a
    /// machine that was never provisioned, and a transient failure for lock,
    /// engine, store, or broker errors.
    pub async fn start(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        self.with_lock(machine_id, self.start_locked(machine_id)).await
    }

    /// Stop a running machine. Stopping a stopped machine changes nothing
    /// but the route withdrawal under the retract policy.
    ///
    /// # Errors
    ///
    /// As for [`Orchestrator::start`].
    pub async fn stop(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        self.with_lock(machine_id, self.stop_locked(machine_id)).await
    }

    /// Delete a machine, its sandbox, and its route.
    ///
    /// Each cleanup step runs even if an earlier one failed; the failures are
    /// collected into `BestEffortFailure`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the record is already gone, a transient
    /// failure when the lock or the initial lookup fails, and
    /// `BestEffortFailure` when any cleanup step failed.
    pub async fn delete(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        self.with_lock(machine_id, self.delete_locked(machine_id)).await
    }

    async fn with_lock<F>(&self, machine_id: Uuid, transition: F) -> Result<(), ProcessingError>
    where
        F: Future<Output = Result<(), ProcessingError>>,
    {
        let lock = MachineLock::acquire(
            self.deps.cache.as_ref(),
            machine_id,
            self.settings.cache.lock_ttl(),
            self.settings.processing.lock_wait(),
        )
        .await?;
        let outcome = transition.await;
        lock.release().await;
        outcome
    }

    async fn start_locked(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        let machine = self.load_machine(machine_id).await?;
        if machine.status == MachineStatus::Running {
            debug!(%machine_id, "machine already running");
            return self.follow_route_policy(RouteEvent::Create, &machine).await;
        }
        let (sandbox, next) = planned(&machine, MachineStatus::Running)?;

        EngineConnector::start_sandbox_async(self.deps.engine.as_ref(), &sandbox).await?;
        self.save(&next).await?;
        info!(%machine_id, "machine started");
        self.follow_route_policy(RouteEvent::Create, &next).await
    }

    async fn stop_locked(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        let machine = self.load_machine(machine_id).await?;
        if machine.status == MachineStatus::Stopped {
            debug!(%machine_id, "machine already stopped");
            return self.follow_route_policy(RouteEvent::Delete, &machine).await;
        }
        let (sandbox, next) = planned(&machine, MachineStatus::Stopped)?;

        EngineConnector::stop_sandbox_async(self.deps.engine.as_ref(), &sandbox).await?;
        self.save(&next).await?;
        info!(%machine_id, "machine stopped");
        self.follow_route_policy(RouteEvent::Delete, &next).await
    }

    /// Publish `event` for a start or stop when routes follow the machine.
    ///
    /// Also runs when the machine is already in the target state: the record
    /// is saved before publishing, so a redelivery after a failed publish
    /// lands here and must still announce the change.
    async fn follow_route_policy(
        &self,
        event: RouteEvent,
        machine: &Machine,
    ) -> Result<(), ProcessingError> {
        if self.settings.processing.stop_route_policy == StopRoutePolicy::Retract {
            self.publish_route(event, machine).await?;
        }
        Ok(())
    }

    async fn delete_locked(&self, machine_id: Uuid) -> Result<(), ProcessingError> {
        let machine = self.load_machine(machine_id).await?;
        let engine = self.deps.engine.as_ref();
        let mut failures = Vec::new();

        if let Some(sandbox) = machine.sandbox_ref.as_deref().filter(|r| !r.is_empty()) {
            let stopped = if machine.status == MachineStatus::Running {
                EngineConnector::stop_sandbox_async(engine, sandbox).await
            } else {
                Ok(())
            };
            if let Err(error) = stopped {
                warn!(%machine_id, %error, "stop before delete failed");
                failures.push(error.to_string());
            }
            if let Err(error) = EngineConnector::remove_sandbox_async(engine, sandbox).await {
                warn!(%machine_id, %error, "sandbox removal failed");
                failures.push(error.to_string());
            }
        }

        match self.deps.machines.delete_machine(machine_id).await {
            Ok(true) => {}
            Ok(false) => debug!(%machine_id, "machine record already removed"),
            Err(error) => {
                warn!(%machine_id, %error, "machine record deletion failed");
                failures.push(error.to_string());
            }
        }

        if let Err(error) = self.publish_route(RouteEvent::Delete, &machine).await {
            warn!(%machine_id, %error, "route.delete publish failed");
            failures.push(error.to_string());
        }

        if failures.is_empty() {
            info!(%machine_id, "machine deleted");
            Ok(())
        } else {
            Err(ProcessingError::BestEffortFailure { failures })
        }
    }

    async fn save(&self, machine: &Machine) -> Result<(), ProcessingError> {
        if self.deps.machines.update_machine(machine).await? {
            Ok(())
        } else {
            Err(ProcessingError::NotFound {
                entity: "machine",
                id: machine.id,
            })
        }
    }
}

/// The sandbox to act on and the record as it will look after moving to
/// `next`.
fn planned(machine: &Machine, next: MachineStatus) -> Result<(String, Machine), ProcessingError> {
    let mut updated = machine.clone();
    updated.transition(next, Utc::now())?;
    let sandbox = machine
        .sandbox_ref
        .clone()
        .filter(|reference| !reference.is_empty())
        .ok_or_else(|| ProcessingError::InvalidTransition {
            machine_id: machine.id,
            from: machine.status.to_string(),
            to: next.to_string(),
        })?;
    Ok((sandbox, updated))
}
