//! Server resolution: input parsing and SRV record lookup.
//!
//! A bare domain is resolved through `_xmpps-client._tcp` (direct TLS) and
//! `_xmpp-client._tcp` (STARTTLS) SRV records (RFC 6120 3.2, XEP-0368). The
//! caller walks the returned endpoints in order, falling through to the
//! next one on connection failure.

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::SecurityMode;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A concrete place to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: SecurityMode,
}

/// Result of parsing a server input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint, skip SRV. The domain is set when `?domain=` was given.
    Direct {
        host: String,
        port: u16,
        mode: SecurityMode,
        domain: Option<String>,
    },
    /// Domain only, resolve through SRV.
    Domain(String),
}

/// Split an optional `?domain=` parameter off a `host[:port]` part.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query.strip_prefix("domain=").map(str::to_string),
        ),
        None => (input, None),
    }
}

fn with_scheme(rest: &str, mode: SecurityMode, default_port: u16) -> ParsedServer {
    let (host_port, domain) = split_domain_param(rest);
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (host_port, default_port),
        },
        None => (host_port, default_port),
    };
    ParsedServer::Direct {
        host: host.to_string(),
        port,
        mode,
        domain,
    }
}

/// Parse a server input string.
///
/// Supported formats:
/// - `tls://host[:port][?domain=d]`   direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]`   STARTTLS, port 5222 by default
/// - `plain://host[:port][?domain=d]` no TLS at all, port 5222 by default
/// - `host:port`                      5223 means direct TLS, anything else STARTTLS
/// - `domain`                         SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        return with_scheme(rest, SecurityMode::DirectTls, 5223);
    }
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        return with_scheme(rest, SecurityMode::StartTls, 5222);
    }
    if let Some(rest) = trimmed.strip_prefix("plain://") {
        return with_scheme(rest, SecurityMode::Plain, 5222);
    }

    // rsplit_once keeps IPv6 literals intact.
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let mode = if port == 5223 {
                SecurityMode::DirectTls
            } else {
                SecurityMode::StartTls
            };
            return ParsedServer::Direct {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            };
        }
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// One SRV answer, before ordering.
#[derive(Debug, Clone)]
struct SrvCandidate {
    target: String,
    port: u16,
    priority: u16,
    weight: u16,
}

/// RFC 2782 order: priority ascending, then weight descending. A "."
/// target means the service is explicitly unavailable and is dropped.
fn order_candidates(mut records: Vec<SrvCandidate>, mode: SecurityMode) -> Vec<XmppEndpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter(|r| !r.target.is_empty())
        .map(|r| XmppEndpoint {
            host: r.target,
            port: r.port,
            mode,
        })
        .collect()
}

async fn lookup_srv(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: SecurityMode,
) -> Vec<XmppEndpoint> {
    let srv_name = format!("{service}.{domain}");
    let started = Instant::now();
    match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => {
            let candidates = lookup
                .iter()
                .map(|r| SrvCandidate {
                    target: r.target().to_string().trim_end_matches('.').to_string(),
                    port: r.port(),
                    priority: r.priority(),
                    weight: r.weight(),
                })
                .collect();
            let endpoints = order_candidates(candidates, mode);
            info!(domain, srv = %srv_name, count = endpoints.len(),
                lookup_ms = elapsed_ms(started), "SRV resolved");
            endpoints
        }
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started),
                error = %e, "SRV lookup failed");
            Vec::new()
        }
    }
}

/// Resolve the candidate endpoints for an XMPP domain.
///
/// Order: all direct TLS records, then all STARTTLS records, then
/// `domain:5222` STARTTLS only when no SRV record exists at all.
pub async fn resolve_xmpp_server(domain: &str) -> Vec<XmppEndpoint> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints =
        lookup_srv(&resolver, domain, "_xmpps-client._tcp", SecurityMode::DirectTls).await;
    endpoints
        .extend(lookup_srv(&resolver, domain, "_xmpp-client._tcp", SecurityMode::StartTls).await);

    if endpoints.is_empty() {
        warn!(domain, resolve_total_ms = elapsed_ms(started),
            "No SRV records found, falling back to {}:5222", domain);
        endpoints.push(XmppEndpoint {
            host: domain.to_string(),
            port: 5222,
            mode: SecurityMode::StartTls,
        });
    } else {
        info!(domain, total = endpoints.len(), resolve_total_ms = elapsed_ms(started),
            "SRV resolution complete");
    }
    endpoints
}
