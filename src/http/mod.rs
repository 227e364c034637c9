//! Management HTTP API
//!
//! The boundary the on-box agents talk to: credential issue, discovery
//! completion, and health probes. Error responses use problem-details
//! JSON bodies.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::credentials::{BmcCredItem, BmcCredentials, CredentialStore, SystemAddresses};
use crate::error::{Error, Result};
use crate::health::Health;
use crate::reconcile::{normalize_mac, Event, EventSender};
use crate::storage::StateStore;

// =============================================================================
// Problem details
// =============================================================================

#[derive(Debug, Serialize)]
struct ProblemDetails<'a> {
    #[serde(rename = "type")]
    problem_type: &'a str,
    title: &'a str,
    detail: &'a str,
    instance: &'a str,
    status: u16,
}

fn problem_response(status: StatusCode, instance: &str, detail: &str) -> Response<Full<Bytes>> {
    let problem = ProblemDetails {
        problem_type: "about:blank",
        title: status.canonical_reason().unwrap_or("Error"),
        detail,
        instance,
        status: status.as_u16(),
    };
    let body = serde_json::to_vec(&problem).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/problem+json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn text_response(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(text.to_string())))
        .unwrap()
}

fn method_not_allowed(instance: &str, allow: &str) -> Response<Full<Bytes>> {
    let detail = format!("Only {allow} operation permitted");
    let problem = ProblemDetails {
        problem_type: "about:blank",
        title: "Method Not Allowed",
        detail: &detail,
        instance,
        status: StatusCode::METHOD_NOT_ALLOWED.as_u16(),
    };
    let body = serde_json::to_vec(&problem).unwrap_or_default();
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header("Allow", allow)
        .header("Content-Type", "application/problem+json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

// =============================================================================
// Context and routing
// =============================================================================

/// Shared state for the request handlers.
pub struct ApiContext {
    pub cred_store: CredentialStore,
    pub events: EventSender,
    pub store: Arc<dyn StateStore>,
    pub health: Arc<Health>,
}

async fn route(ctx: &ApiContext, method: &Method, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    // Probes are too chatty to log
    if path != "/v1/liveness" && path != "/v1/readiness" {
        debug!("HTTP: {method} {path} called");
    }

    match (method, path) {
        (&Method::GET, "/") => text_response(StatusCode::OK, "/v1\n"),

        (&Method::GET, "/v1/liveness") => empty_response(StatusCode::NO_CONTENT),
        (&Method::GET, "/v1/readiness") => readiness(ctx).await,

        (&Method::POST, "/v1/credentials") => post_credentials(ctx, path, body).await,
        (_, "/v1/credentials") => method_not_allowed(path, "POST"),

        (&Method::PUT, "/v1/discovery") => put_discovery(ctx, path, body).await,
        (_, "/v1/discovery") => method_not_allowed(path, "PUT"),

        _ => problem_response(StatusCode::NOT_FOUND, path, "no such endpoint"),
    }
}

/// Validates that our dependencies are available.
async fn readiness(ctx: &ApiContext) -> Response<Full<Bytes>> {
    let mut problems = Vec::new();

    if !ctx.store.check_liveness().await {
        problems.push("state store is not ready");
    }
    if !ctx.health.topology_read() {
        problems.push("switch inventory not yet read from layout service");
    }
    if !ctx.health.fabric_list_read() {
        problems.push("fabric switches not yet read from layout service");
    }

    if problems.is_empty() {
        empty_response(StatusCode::NO_CONTENT)
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, &problems.join(" : "))
    }
}

fn parse_addresses(path: &str, body: &[u8]) -> std::result::Result<SystemAddresses, Response<Full<Bytes>>> {
    if body.is_empty() {
        return Err(problem_response(
            StatusCode::BAD_REQUEST,
            path,
            "Missing request body",
        ));
    }
    let addrs: SystemAddresses = match serde_json::from_slice(body) {
        Ok(addrs) => addrs,
        Err(_) => {
            return Err(problem_response(
                StatusCode::BAD_REQUEST,
                path,
                "Error while parsing json request",
            ))
        }
    };
    if addrs.addresses.is_empty() {
        return Err(problem_response(
            StatusCode::BAD_REQUEST,
            path,
            "Missing MAC addresses",
        ));
    }
    Ok(addrs)
}

/// POST /v1/credentials: issue credentials for a booting BMC and record a
/// pending credential item under each of its MACs. The global credentials
/// win over the vendor defaults; with neither configured the request
/// fails with no side effects.
async fn post_credentials(ctx: &ApiContext, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let bmc_addrs = match parse_addresses(path, body) {
        Ok(addrs) => addrs,
        Err(resp) => return resp,
    };

    let issued = match issue_credentials(&ctx.cred_store).await {
        Ok(creds) => creds,
        Err(e) => {
            warn!("Cannot issue credentials: {e}");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "No credentials available\n");
        }
    };

    // Record the pending item before answering, so a crash between the
    // two cannot hand out credentials we have no record of.
    let item = BmcCredItem {
        addresses: bmc_addrs.clone(),
        credentials: issued.clone(),
    };
    for addr in &bmc_addrs.addresses {
        let mac = normalize_mac(&addr.mac_address);
        if let Err(e) = ctx.cred_store.add_mac_credentials(&mac, &item).await {
            warn!("Unable to record pending credentials for {mac}: {e}");
        }
    }

    respond_credentials(&issued)
}

/// Picks the credentials to hand to a requesting BMC: the global
/// credentials when set, the vendor default otherwise.
async fn issue_credentials(cred_store: &CredentialStore) -> Result<BmcCredentials> {
    if let Ok(Some(creds)) = cred_store.get_global_credentials().await {
        if !creds.username.is_empty() {
            return Ok(creds);
        }
    }

    let defaults = cred_store.get_default_credentials().await?;
    match defaults.get(crate::credentials::DEFAULT_VENDOR) {
        Some(creds) if !creds.username.is_empty() => Ok(creds.clone()),
        _ => Err(Error::CredentialsUnavailable),
    }
}

fn respond_credentials(creds: &BmcCredentials) -> Response<Full<Bytes>> {
    match serde_json::to_vec(creds) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => {
            warn!("Couldn't encode a JSON command response: {e}");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /v1/discovery: the agent finished configuring its BMC. The pending
/// credential records are consumed and an agent-report event goes to the
/// reconciliation core.
async fn put_discovery(ctx: &ApiContext, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let bmc_addrs = match parse_addresses(path, body) {
        Ok(addrs) => addrs,
        Err(resp) => return resp,
    };

    // Any one of the reported MACs matching a pending record identifies
    // the BMC.
    let mut found: Option<BmcCredItem> = None;
    for addr in &bmc_addrs.addresses {
        let mac = normalize_mac(&addr.mac_address);
        match ctx.cred_store.find_mac_credentials(&mac).await {
            Ok(Some(item)) if !item.credentials.username.is_empty() => {
                found = Some(item);
                break;
            }
            Ok(_) => {}
            Err(e) => warn!("Unable to fetch credentials for {mac}: {e}"),
        }
    }

    let Some(item) = found else {
        return problem_response(StatusCode::BAD_REQUEST, path, "BMC credentials not found");
    };

    for addr in &bmc_addrs.addresses {
        let mac = normalize_mac(&addr.mac_address);
        if let Err(e) = ctx.cred_store.clear_mac_credentials(&mac).await {
            warn!("Unable to clear pending credentials for {mac}: {e}");
        }
    }

    let report = Event::AgentReport {
        addresses: item.addresses.addresses,
        username: item.credentials.username,
        password: item.credentials.password,
    };
    if ctx.events.send(report).is_err() {
        error!("Reconciler channel closed, dropping agent report");
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "discovery pipeline unavailable\n");
    }

    empty_response(StatusCode::OK)
}

// =============================================================================
// Server
// =============================================================================

async fn handle(
    ctx: Arc<ApiContext>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {e}");
            Bytes::new()
        }
    };
    Ok(route(&ctx, &parts.method, parts.uri.path(), &bytes).await)
}

/// Runs the management API server.
pub async fn run_server(addr: &str, ctx: Arc<ApiContext>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid management server address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!("Management API listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(ctx.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Management API connection error: {e}");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
