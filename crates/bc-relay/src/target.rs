//! Maps inbound `/api/*` requests onto Business Central OData URLs.
use crate::config::BcTarget;

/// Prefix of every relayed route.
pub const API_PREFIX: &str = "/api";

/// Remove carriage returns, line feeds and tabs, then trim surrounding whitespace.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// The Business Central resource path of an inbound path: `/api` stripped once.
/// `/api` alone yields an empty path, which addresses the company itself.
pub fn resource_path(inbound_path: &str) -> &str {
    inbound_path
        .strip_prefix(API_PREFIX)
        .unwrap_or(inbound_path)
}

/// The entity set a resource path addresses, e.g. `Resources` for `/Resources('R1')/lines`.
pub fn resource_name(resource_path: &str) -> &str {
    resource_path
        .trim_start_matches('/')
        .split(['/', '(', '?'])
        .next()
        .unwrap_or_default()
}

/// Whether a resource path has a `.` or `..` segment, literal or percent-encoded.
/// URL parsing collapses these, so the request would leave the addressed entity set.
pub fn has_dot_segment(resource_path: &str) -> bool {
    sanitize(resource_path)
        .split(['/', '\\'])
        .map(|segment| segment.to_ascii_lowercase().replace("%2e", "."))
        .any(|segment| segment == "." || segment == "..")
}

/// Build the Business Central URL for an inbound path and raw query string:
/// `{baseUrl}/v2.0/{tenantId}/{environment}/api/alletec/learning/{apiVersion}/companies({companyId}){resourcePath}{queryString}`.
///
/// The query may be passed with or without its leading `?`. No percent-encoding is applied.
pub fn build_target_url(inbound_path: &str, inbound_query: &str, target: &BcTarget) -> String {
    let base_url = sanitize(&target.base_url);
    let tenant_id = sanitize(&target.tenant_id);
    let environment = sanitize(&target.environment);
    let api_version = sanitize(&target.api_version);
    let company_id = sanitize(&target.company_id);

    let resource = sanitize(resource_path(inbound_path));
    let query = match sanitize(inbound_query) {
        q if q.is_empty() || q.starts_with('?') => q,
        q => format!("?{q}"),
    };

    format!(
        "{base_url}/v2.0/{tenant_id}/{environment}/api/alletec/learning/{api_version}/companies({company_id}){resource}{query}"
    )
}
