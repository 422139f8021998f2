//! Request batching
//!
//! Splits a batch of module names by source and group, packs each split into
//! prefix-compacted module strings and cuts it into requests whose query
//! string stays under the configured budget.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::RequestContext;
use crate::module::registry::Registry;
use crate::network::hash::fnv132;
use crate::network::BatchRequest;

/// `&modules=` plus `&version=` and a five character hash
const MODULES_AND_VERSION_LENGTH: usize = 23;

/// Length of an encoded `|` or `,` separator
const SEPARATOR_LENGTH: usize = 3;

/// Result of planning one batch
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub requests: Vec<BatchRequest>,
    /// Modules whose source has no endpoint
    pub unroutable: Vec<String>,
}

/// Packed module list with the names in the order they appear in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedModules {
    pub query: String,
    pub names: Vec<String>,
}

/// Percent-encode like `encodeURIComponent`.
pub fn encode_uri_component(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Join parameters as `key=value&...`, in key order.
pub fn make_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                encode_uri_component(key),
                encode_uri_component(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Pack `{prefix: [suffix..]}` into `prefix.a,b|other.c`.
pub fn build_modules_string(module_map: &IndexMap<String, Vec<String>>) -> PackedModules {
    let mut parts = Vec::with_capacity(module_map.len());
    let mut names = Vec::new();
    for (prefix, suffixes) in module_map {
        let lead = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", prefix)
        };
        parts.push(format!("{}{}", lead, suffixes.join(",")));
        names.extend(suffixes.iter().map(|suffix| format!("{}{}", lead, suffix)));
    }
    PackedModules {
        query: parts.join("|"),
        names,
    }
}

/// Hash of the concatenated versions of `names`, in order.
pub fn combined_version<S: AsRef<str>>(registry: &Registry, names: &[S]) -> String {
    let versions: String = names
        .iter()
        .filter_map(|name| registry.get(name.as_ref()))
        .map(|descriptor| descriptor.version())
        .collect();
    fnv132(&versions)
}

fn split_prefix(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => ("", name),
    }
}

fn base_params(context: &RequestContext) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("lang".to_string(), context.lang.clone());
    params.insert("skin".to_string(), context.skin.clone());
    if context.debug {
        params.insert("debug".to_string(), "1".to_string());
    }
    params
}

fn build_request(
    registry: &Registry,
    source: &str,
    endpoint: &str,
    group: Option<i64>,
    base: &BTreeMap<String, String>,
    module_map: &IndexMap<String, Vec<String>>,
) -> BatchRequest {
    let packed = build_modules_string(module_map);
    let version = combined_version(registry, &packed.names);
    let mut params = base.clone();
    params.insert("modules".to_string(), packed.query);
    params.insert("version".to_string(), version.clone());
    let query = make_query_string(&params);
    debug!(
        "Batch request to {} for {} modules ({} bytes)",
        source,
        packed.names.len(),
        query.len()
    );
    BatchRequest {
        source: source.to_string(),
        url: format!("{}?{}", endpoint, query),
        query,
        group,
        modules: packed.names,
        version,
    }
}

/// Plan the requests for a batch of modules.
///
/// Every module must already be registered and in `loading`. The batch is
/// sorted alphabetically before it is split.
pub fn plan_batch(
    registry: &Registry,
    context: &RequestContext,
    max_query_length: usize,
    mut batch: Vec<String>,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    if batch.is_empty() {
        return plan;
    }
    batch.sort();
    batch.dedup();

    let mut splits: IndexMap<&str, IndexMap<Option<i64>, Vec<&str>>> = IndexMap::new();
    for name in &batch {
        match registry.get(name) {
            Some(descriptor) => splits
                .entry(descriptor.source())
                .or_default()
                .entry(descriptor.group())
                .or_default()
                .push(name.as_str()),
            None => plan.unroutable.push(name.clone()),
        }
    }

    let base = base_params(context);
    for (source, groups) in splits {
        let Some(endpoint) = registry.source_url(source) else {
            warn!("No endpoint for source {}", source);
            plan.unroutable
                .extend(groups.into_values().flatten().map(String::from));
            continue;
        };

        for (group, modules) in groups {
            let mut request_base = base.clone();
            if let Some(user) = &context.user_name {
                if group == Some(context.user_group) {
                    request_base.insert("user".to_string(), user.clone());
                }
            }
            let base_length = make_query_string(&request_base).len() + MODULES_AND_VERSION_LENGTH;

            let mut length = 0;
            let mut module_map: IndexMap<String, Vec<String>> = IndexMap::new();
            for name in modules {
                let (prefix, suffix) = split_prefix(name);
                let cost = |module_map: &IndexMap<String, Vec<String>>| {
                    if module_map.contains_key(prefix) {
                        suffix.len() + SEPARATOR_LENGTH
                    } else {
                        name.len() + SEPARATOR_LENGTH
                    }
                };
                let mut bytes_added = cost(&module_map);
                if length > 0 && length + base_length + bytes_added > max_query_length {
                    plan.requests.push(build_request(
                        registry,
                        source,
                        endpoint,
                        group,
                        &request_base,
                        &module_map,
                    ));
                    length = 0;
                    module_map.clear();
                    // The first module of a fresh request carries its full prefix
                    bytes_added = cost(&module_map);
                }
                length += bytes_added;
                module_map
                    .entry(prefix.to_string())
                    .or_default()
                    .push(suffix.to_string());
            }
            plan.requests.push(build_request(
                registry,
                source,
                endpoint,
                group,
                &request_base,
                &module_map,
            ));
        }
    }
    plan
}
