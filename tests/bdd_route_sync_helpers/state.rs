//! Shared behavioural-test state for route synchronisation scenarios.

use std::sync::Arc;

use cestx::broker::Disposition;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;
use tokio::runtime::Runtime;
use uuid::Uuid;
use wiremock::MockServer;

/// Step result type for route synchronisation BDD tests.
pub type StepResult<T> = Result<T, String>;

/// Machine whose route every scenario manipulates.
pub const MACHINE_ID: Uuid = Uuid::from_u128(0x0bad_cafe_0000_4000_8000_0000_0000_0001);

/// Owner of the machine.
pub const USER_ID: Uuid = Uuid::from_u128(0x0dec_0ded_0000_4000_8000_0000_0000_0002);

/// Address used when a scenario makes the proxy unreachable.
pub const UNREACHABLE_PROXY: &str = "http://127.0.0.1:1";

/// Shared scenario state for route synchronisation behavioural tests.
#[derive(Default, ScenarioState)]
pub struct RouteSyncState {
    /// Runtime shared by every step so the proxy stub outlives each call.
    pub(crate) runtime: Slot<Arc<Runtime>>,

    /// Stub proxy control API, when the scenario has one.
    pub(crate) server: Slot<Arc<MockServer>>,

    /// Base URL handed to the proxy client.
    pub(crate) proxy_url: Slot<String>,

    /// Address the sandbox reports; empty means attached without one.
    pub(crate) address: Slot<String>,

    /// Disposition of the handled message.
    pub(crate) disposition: Slot<Disposition>,
}

impl RouteSyncState {
    /// The scenario's runtime.
    pub(crate) fn runtime(&self) -> StepResult<Arc<Runtime>> {
        self.runtime
            .get()
            .ok_or_else(|| String::from("scenario runtime should be set"))
    }

    /// The stub proxy, which must have been started by a given step.
    pub(crate) fn server(&self) -> StepResult<Arc<MockServer>> {
        self.server
            .get()
            .ok_or_else(|| String::from("a proxy stub should have been started"))
    }
}

/// Fixture providing fresh state for each route synchronisation scenario.
#[fixture]
pub fn route_sync_state() -> RouteSyncState {
    let state = RouteSyncState::default();
    if let Ok(runtime) = Runtime::new() {
        state.runtime.set(Arc::new(runtime));
    }
    state.proxy_url.set(String::from(UNREACHABLE_PROXY));
    state
}
