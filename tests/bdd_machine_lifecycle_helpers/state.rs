//! Shared behavioural-test state for machine lifecycle scenarios.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use cestx::artifacts::MemoryArtifactStore;
use cestx::broker::{Disposition, InboundMessage, RecordingPublisher};
use cestx::cache::MemoryKeyValue;
use cestx::config::StopRoutePolicy;
use cestx::store::memory::MemoryStore;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;
use uuid::Uuid;

/// Step result type for machine lifecycle BDD tests.
pub type StepResult<T> = Result<T, String>;

/// Template every scenario can publish.
pub const TEMPLATE_ID: Uuid = Uuid::from_u128(0x7e3a_51c0_0000_4000_8000_0000_0000_0001);

/// User owning the template and every machine created from it.
pub const USER_ID: Uuid = Uuid::from_u128(0x5a1e_d00d_0000_4000_8000_0000_0000_0002);

/// Container id the fake engine assigns.
pub const CONTAINER_ID: &str = "bdd-container";

/// Engine calls observed across a scenario.
#[derive(Debug, Default)]
pub struct EngineCalls {
    /// Images built.
    pub built: AtomicUsize,
    /// Sandboxes stopped.
    pub stopped: AtomicUsize,
    /// Sandboxes removed.
    pub removed: AtomicUsize,
}

/// In-process collaborators shared by every step of a scenario.
#[derive(Debug, Default)]
pub struct World {
    /// Machine and template records.
    pub store: Arc<MemoryStore>,
    /// Template cache, ledger, locks, and attempt counters.
    pub cache: Arc<MemoryKeyValue>,
    /// Template artifacts.
    pub artifacts: Arc<MemoryArtifactStore>,
    /// Route events.
    pub publisher: Arc<RecordingPublisher>,
    /// Engine call counters.
    pub calls: Arc<EngineCalls>,
}

/// Shared scenario state for machine lifecycle behavioural tests.
#[derive(Default, ScenarioState)]
pub struct MachineLifecycleState {
    /// Collaborators used to build the orchestrator.
    pub(crate) world: Slot<Arc<World>>,

    /// Stop route policy for the orchestrator.
    pub(crate) policy: Slot<StopRoutePolicy>,

    /// Machine seeded by a given step.
    pub(crate) machine_id: Slot<Uuid>,

    /// Create message last handled, kept for redelivery.
    pub(crate) create_message: Slot<InboundMessage>,

    /// Dispositions of every handled message, in order.
    pub(crate) dispositions: Slot<Vec<Disposition>>,
}

impl MachineLifecycleState {
    /// The scenario's collaborators.
    pub(crate) fn world(&self) -> StepResult<Arc<World>> {
        self.world
            .get()
            .ok_or_else(|| String::from("scenario world should be set"))
    }

    /// Append dispositions to those already recorded.
    pub(crate) fn record(&self, handled: &[Disposition]) {
        let mut all = self.dispositions.get().unwrap_or_default();
        all.extend_from_slice(handled);
        self.dispositions.set(all);
    }
}

/// Fixture providing fresh state for each machine lifecycle scenario.
#[fixture]
pub fn machine_lifecycle_state() -> MachineLifecycleState {
    let state = MachineLifecycleState::default();
    state.world.set(Arc::new(World::default()));
    state.policy.set(StopRoutePolicy::Retain);
    state.dispositions.set(Vec::new());
    state
}
