//! DNS SRV bootstrap: resolve `_couchbase._tcp.<host>` /
//! `_couchbases._tcp.<host>` to a seed list, falling back to the literal
//! host on any resolution failure so a single bad DNS response never
//! blocks bootstrap outright.

use fathom_core::config::SeedNode;
use hickory_resolver::TokioAsyncResolver;

/// Resolve `host` via DNS SRV for the given scheme, returning the
/// target/port pairs the server published. An empty result (NXDOMAIN,
/// no resolver configured, timeout) means "no SRV record"; the caller
/// falls back to the literal connection-string host in that case.
pub async fn resolve_srv(resolver: &TokioAsyncResolver, host: &str, tls: bool) -> Vec<SeedNode> {
    let service = if tls { "_couchbases._tcp" } else { "_couchbase._tcp" };
    let query = format!("{service}.{host}");

    match resolver.srv_lookup(query.as_str()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|srv| SeedNode {
                host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: Some(srv.port()),
                mode: None,
            })
            .collect(),
        Err(err) => {
            tracing::debug!(%query, error = %err, "no SRV record, falling back to literal host");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    // SRV resolution requires a live resolver/network; covered by the
    // fallback behavior exercised through `Origin`/`ConnectionString` in
    // fathom-core instead of a unit test here.
}
