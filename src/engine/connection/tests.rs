//! Unit tests for engine endpoint resolution and client construction.

use mockable::MockEnv;
use rstest::{fixture, rstest};

use super::{Endpoint, EngineConnector, SocketResolver};

fn env_with(vars: &[(&str, &str)]) -> MockEnv {
    let owned: Vec<(String, String)> = vars
        .iter()
        .map(|(key, value)| (String::from(*key), String::from(*value)))
        .collect();
    let mut env = MockEnv::new();
    env.expect_string().returning(move |key| {
        owned
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    });
    env
}

#[fixture]
fn empty_env() -> MockEnv {
    env_with(&[])
}

#[rstest]
#[case::docker_host(&[("DOCKER_HOST", "unix:///docker.sock")], Some("unix:///docker.sock"))]
#[case::container_host(&[("CONTAINER_HOST", "unix:///container.sock")], Some("unix:///container.sock"))]
#[case::podman_host(&[("PODMAN_HOST", "unix:///podman.sock")], Some("unix:///podman.sock"))]
#[case::docker_wins(
    &[("DOCKER_HOST", "unix:///docker.sock"), ("PODMAN_HOST", "unix:///podman.sock")],
    Some("unix:///docker.sock")
)]
#[case::empty_is_skipped(
    &[("DOCKER_HOST", ""), ("PODMAN_HOST", "unix:///podman.sock")],
    Some("unix:///podman.sock")
)]
#[case::all_empty(&[("DOCKER_HOST", ""), ("CONTAINER_HOST", ""), ("PODMAN_HOST", "")], None)]
#[case::unset(&[], None)]
fn resolver_checks_fallback_variables_in_order(
    #[case] vars: &[(&str, &str)],
    #[case] expected: Option<&str>,
) {
    let env = env_with(vars);
    let resolver = SocketResolver::new(&env);

    assert_eq!(resolver.resolve_from_env(), expected.map(String::from));
}

#[rstest]
fn configured_socket_wins_over_environment() {
    let env = env_with(&[("DOCKER_HOST", "unix:///docker.sock")]);
    let resolver = SocketResolver::new(&env);

    let socket = EngineConnector::resolve_socket(Some("unix:///config.sock"), &resolver);

    assert_eq!(socket, "unix:///config.sock");
}

#[rstest]
fn empty_configured_socket_falls_back_to_environment() {
    let env = env_with(&[("DOCKER_HOST", "tcp://remote:2375")]);
    let resolver = SocketResolver::new(&env);

    let socket = EngineConnector::resolve_socket(Some(""), &resolver);

    assert_eq!(socket, "tcp://remote:2375");
}

#[rstest]
#[cfg(unix)]
fn default_socket_applies_without_any_source(empty_env: MockEnv) {
    let resolver = SocketResolver::new(&empty_env);

    let socket = EngineConnector::resolve_socket(None, &resolver);

    assert_eq!(socket, "unix:///var/run/docker.sock");
}

#[rstest]
#[case::unix("unix:///run/docker.sock", Endpoint::Socket(String::from("unix:///run/docker.sock")))]
#[case::pipe("npipe:////./pipe/x", Endpoint::Socket(String::from("npipe:////./pipe/x")))]
#[case::tcp("tcp://host:2375", Endpoint::Http(String::from("http://host:2375")))]
#[case::http("http://host:2375", Endpoint::Http(String::from("http://host:2375")))]
#[case::https("https://host:2376", Endpoint::Http(String::from("https://host:2376")))]
#[case::bare_unix("/run/podman.sock", Endpoint::Socket(String::from("unix:///run/podman.sock")))]
#[case::bare_pipe("//./pipe/docker", Endpoint::Socket(String::from("npipe:////./pipe/docker")))]
fn endpoints_are_normalised(#[case] raw: &str, #[case] expected: Endpoint) {
    assert_eq!(Endpoint::parse(raw), expected);
}

#[rstest]
#[case::tcp("tcp://host:2375")]
#[case::http("http://10.0.0.1:2375")]
#[case::https("https://docker.example.com:2376")]
fn http_compatible_endpoints_build_a_client(#[case] endpoint: &str) {
    // Bollard builds HTTP clients without contacting the engine.
    EngineConnector::connect(endpoint)
        .unwrap_or_else(|_| panic!("connect {endpoint} should create client"));
}

#[rstest]
fn connect_with_fallback_uses_environment_endpoint() {
    let env = env_with(&[("DOCKER_HOST", "tcp://192.168.1.100:2376")]);
    let resolver = SocketResolver::new(&env);

    EngineConnector::connect_with_fallback(None, &resolver)
        .expect("connect_with_fallback tcp from env should succeed");
}
