//! Then-step assertions for route synchronisation scenarios.

use cestx::broker::Disposition;
use cestx::contracts::generate_subdomain;
use rstest_bdd_macros::then;
use wiremock::Request;

use super::state::{MACHINE_ID, RouteSyncState, StepResult, USER_ID};

fn expect_disposition(state: &RouteSyncState, expected: Disposition) -> StepResult<()> {
    let actual = state
        .disposition
        .get()
        .ok_or_else(|| String::from("no message was handled"))?;
    if actual == expected {
        return Ok(());
    }
    Err(format!("expected {expected:?}, got {actual:?}"))
}

fn received(state: &RouteSyncState, method: &str) -> StepResult<Vec<Request>> {
    let server = state.server()?;
    let requests = state
        .runtime()?
        .block_on(server.received_requests())
        .ok_or_else(|| String::from("proxy stub should record requests"))?;
    Ok(requests
        .into_iter()
        .filter(|request| request.method.as_str() == method)
        .collect())
}

#[then("the message is acknowledged")]
fn message_acknowledged(route_sync_state: &RouteSyncState) -> StepResult<()> {
    expect_disposition(route_sync_state, Disposition::Ack)
}

#[then("the message is requeued")]
fn message_requeued(route_sync_state: &RouteSyncState) -> StepResult<()> {
    expect_disposition(route_sync_state, Disposition::Requeue)
}

#[then("the proxy received a route to {url}")]
fn proxy_received_route(route_sync_state: &RouteSyncState, url: String) -> StepResult<()> {
    let posts = received(route_sync_state, "POST")?;
    let [request] = posts.as_slice() else {
        return Err(format!("expected one configuration request, got {}", posts.len()));
    };
    if request.url.path() != "/api/providers/docker/configure" {
        return Err(format!("unexpected configuration path {}", request.url.path()));
    }

    let document: serde_json::Value = serde_json::from_slice(&request.body)
        .map_err(|error| format!("configuration body is not JSON: {error}"))?;
    let subdomain = generate_subdomain(MACHINE_ID, USER_ID, 8080, "cestx.com");
    let server = document
        .pointer(&format!("/http/services/{subdomain}/loadBalancer/servers/0/url"))
        .and_then(serde_json::Value::as_str);
    let rule = document
        .pointer(&format!("/http/routers/{subdomain}/rule"))
        .and_then(serde_json::Value::as_str);

    if server != Some(url.as_str()) {
        return Err(format!("expected service url {url}, got {server:?}"));
    }
    let expected_rule = format!("Host(`{subdomain}`)");
    if rule != Some(expected_rule.as_str()) {
        return Err(format!("expected router rule {expected_rule}, got {rule:?}"));
    }
    Ok(())
}

#[then("the proxy received no configuration")]
fn proxy_received_no_configuration(route_sync_state: &RouteSyncState) -> StepResult<()> {
    let posts = received(route_sync_state, "POST")?;
    if posts.is_empty() {
        return Ok(());
    }
    Err(format!("expected no configuration requests, got {}", posts.len()))
}

#[then("the proxy received {count} delete requests")]
fn proxy_received_deletes(route_sync_state: &RouteSyncState, count: usize) -> StepResult<()> {
    let deletes = received(route_sync_state, "DELETE")?;
    if deletes.len() == count {
        return Ok(());
    }
    Err(format!("expected {count} delete requests, got {}", deletes.len()))
}
