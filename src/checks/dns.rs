//! DNS A-record lookup check

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use serde_json::Value;
use std::net::IpAddr;

use crate::models::ResultRecord;

/// Look up the A records for `host`.
///
/// Uses the system resolver configuration (including the search path, so
/// `kubernetes` expands to `kubernetes.default.svc.cluster.local` in a pod)
/// unless `server` names a nameserver IP.
pub async fn dns_lookup_check(host: &str, server: Option<&str>, timeout: f64) -> ResultRecord {
    let mut record = ResultRecord::start("dns");
    record.spec.insert("shouldFail".to_string(), Value::Bool(false));
    record.spec.insert(
        "nameserver".to_string(),
        server.map_or(Value::Null, |s| Value::String(s.to_string())),
    );
    record
        .spec
        .insert("host".to_string(), Value::String(host.to_string()));
    record
        .spec
        .insert("timeout".to_string(), super::timeout_value(timeout));

    let resolver = match build_resolver(server, timeout) {
        Ok(resolver) => resolver,
        Err(message) => {
            record.set_exception("ValueError", message);
            return record.finish();
        }
    };

    let lifetime = super::to_duration(timeout);
    match tokio::time::timeout(lifetime, resolver.ipv4_lookup(host)).await {
        Ok(Ok(lookup)) => {
            let records: Vec<Value> = lookup
                .iter()
                .map(|a| Value::String(a.to_string()))
                .collect();
            tracing::debug!("Resolved {} to {} A records", host, records.len());
            record.data.insert("A".to_string(), Value::Array(records));
            record.data.insert(
                "response-code".to_string(),
                Value::String(response_code_name(ResponseCode::NoError)),
            );
        }
        Ok(Err(e)) => {
            tracing::info!("DNS lookup for {} failed: {}", host, e);
            record_resolve_error(&mut record, &e);
        }
        Err(_) => {
            tracing::info!("DNS lookup for {} timed out after {}s", host, timeout);
            record.set_exception(
                "LifetimeTimeout",
                format!("The resolution lifetime expired after {timeout} seconds"),
            );
        }
    }

    record.finish()
}

fn build_resolver(server: Option<&str>, timeout: f64) -> Result<TokioAsyncResolver, String> {
    let (system_config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
        Ok(parts) => parts,
        Err(e) => {
            tracing::debug!("Falling back to default resolver config: {}", e);
            (ResolverConfig::default(), ResolverOpts::default())
        }
    };
    opts.timeout = super::to_duration(timeout);

    let config = match server {
        Some(server) => {
            let ip: IpAddr = server
                .trim()
                .parse()
                .map_err(|_| format!("Invalid nameserver address: {server}"))?;
            ResolverConfig::from_parts(
                system_config.domain().cloned(),
                system_config.search().to_vec(),
                NameServerConfigGroup::from_ips_clear(&[ip], 53, true),
            )
        }
        None => system_config,
    };

    Ok(TokioAsyncResolver::tokio(config, opts))
}

fn record_resolve_error(record: &mut ResultRecord, error: &ResolveError) {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            let code = response_code_name(*response_code);
            let kind = if *response_code == ResponseCode::NXDomain {
                "NXDOMAIN"
            } else {
                "NoAnswer"
            };
            record
                .data
                .insert("response-code".to_string(), Value::String(code));
            record.set_exception(kind, error.to_string());
        }
        ResolveErrorKind::Timeout => {
            record.set_exception("LifetimeTimeout", error.to_string());
        }
        ResolveErrorKind::NoConnections => {
            record.set_exception("NoNameservers", error.to_string());
        }
        _ => {
            record.set_exception("ResolveError", error.to_string());
        }
    }
}

/// Wire name of a response code (`NOERROR`, `NXDOMAIN`, ...)
pub fn response_code_name(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => format!("{other:?}").to_uppercase(),
    }
}
