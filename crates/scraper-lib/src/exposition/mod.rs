//! Prometheus text exposition parsing
//!
//! A single declarative table ([`FAMILIES`]) lists every metric family the
//! scraper consumes, which exporter publishes it, which labels identify the
//! container or pod, and how the sample value is interpreted. One generic
//! line matcher consumes the table:
//! - lines that do not start with a known family name followed by `{` are skipped
//! - the label block is the text between the first `{` and its matching `}`
//! - the value is the first token after the block; a second token is the
//!   optional explicit timestamp

mod resolver;

pub use resolver::{resolve, ResolvedIdentity};

use std::collections::HashMap;

/// Label set of one sample
pub type Labels = HashMap<String, String>;

/// Exporter a metric family is scraped from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exporter {
    /// Per-node container runtime exporter (cAdvisor)
    Usage,
    /// Cluster state exporter (kube-state-metrics)
    State,
}

/// What a metric family measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    CpuUsageSeconds,
    MemoryUsageBytes,
    ResourceRequests,
    ResourceLimits,
    PodInfo,
    PodOwner,
}

/// How a raw sample value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTransform {
    /// Counters and gauges are kept unchanged
    Raw,
    /// Info-style series carry their payload in labels; only `1` marks a live series
    InfoMarker,
}

impl ValueTransform {
    pub fn apply(self, value: f64) -> Option<f64> {
        match self {
            ValueTransform::Raw => Some(value),
            ValueTransform::InfoMarker if value == 1.0 => Some(value),
            ValueTransform::InfoMarker => None,
        }
    }
}

/// Label names used to resolve identity, in order of preference
#[derive(Debug)]
pub struct IdentityLabels {
    pub namespace: &'static [&'static str],
    pub pod: &'static [&'static str],
    pub container: &'static [&'static str],
    pub node: &'static [&'static str],
}

/// cAdvisor labels, with the `container_label_io_kubernetes_*` scheme as fallback
pub const USAGE_IDENTITY: IdentityLabels = IdentityLabels {
    namespace: &["namespace", "container_label_io_kubernetes_pod_namespace"],
    pod: &["pod", "container_label_io_kubernetes_pod_name"],
    container: &["container", "container_label_io_kubernetes_container_name"],
    node: &["node"],
};

/// kube-state-metrics labels
pub const STATE_IDENTITY: IdentityLabels = IdentityLabels {
    namespace: &["namespace"],
    pod: &["pod"],
    container: &["container"],
    node: &["node"],
};

/// One row of the family table
#[derive(Debug)]
pub struct MetricFamily {
    pub name: &'static str,
    pub exporter: Exporter,
    pub kind: MetricKind,
    pub identity: &'static IdentityLabels,
    /// Labels a sample must carry to be kept
    pub required: &'static [&'static str],
    pub transform: ValueTransform,
}

/// Every metric family the scraper consumes
pub const FAMILIES: &[MetricFamily] = &[
    MetricFamily {
        name: "container_cpu_usage_seconds_total",
        exporter: Exporter::Usage,
        kind: MetricKind::CpuUsageSeconds,
        identity: &USAGE_IDENTITY,
        required: &[],
        transform: ValueTransform::Raw,
    },
    MetricFamily {
        name: "container_memory_usage_bytes",
        exporter: Exporter::Usage,
        kind: MetricKind::MemoryUsageBytes,
        identity: &USAGE_IDENTITY,
        required: &[],
        transform: ValueTransform::Raw,
    },
    MetricFamily {
        name: "kube_pod_container_resource_requests",
        exporter: Exporter::State,
        kind: MetricKind::ResourceRequests,
        identity: &STATE_IDENTITY,
        required: &["resource"],
        transform: ValueTransform::Raw,
    },
    MetricFamily {
        name: "kube_pod_container_resource_limits",
        exporter: Exporter::State,
        kind: MetricKind::ResourceLimits,
        identity: &STATE_IDENTITY,
        required: &["resource"],
        transform: ValueTransform::Raw,
    },
    MetricFamily {
        name: "kube_pod_info",
        exporter: Exporter::State,
        kind: MetricKind::PodInfo,
        identity: &STATE_IDENTITY,
        required: &["node"],
        transform: ValueTransform::InfoMarker,
    },
    MetricFamily {
        name: "kube_pod_owner",
        exporter: Exporter::State,
        kind: MetricKind::PodOwner,
        identity: &STATE_IDENTITY,
        required: &["owner_kind"],
        transform: ValueTransform::InfoMarker,
    },
];

/// A typed sample extracted from one exposition line
#[derive(Debug, Clone)]
pub struct Sample {
    pub family: &'static MetricFamily,
    pub labels: Labels,
    pub value: f64,
}

impl Sample {
    pub fn kind(&self) -> MetricKind {
        self.family.kind
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Resolve this sample's identity using its family's label scheme
    pub fn identity(&self) -> ResolvedIdentity {
        resolve(&self.labels, self.family.identity)
    }
}

/// Lazily parse every sample of the given exporter's families from `text`.
///
/// Unknown families, comments and malformed lines are skipped.
pub fn samples(text: &str, exporter: Exporter) -> impl Iterator<Item = Sample> + '_ {
    text.lines()
        .filter_map(move |line| parse_line(line, exporter))
}

/// Parse one line against the families of `exporter`
pub fn parse_line(line: &str, exporter: Exporter) -> Option<Sample> {
    let (family, rest) = match_family(line, exporter)?;
    let (block, tail) = split_label_block(rest)?;
    let value = parse_value(tail)?;
    let value = family.transform.apply(value)?;

    let labels = parse_labels(block);
    if family
        .required
        .iter()
        .any(|name| labels.get(*name).map_or(true, |v| v.is_empty()))
    {
        return None;
    }

    Some(Sample {
        family,
        labels,
        value,
    })
}

/// Find the family whose name starts the line, immediately followed by `{`
fn match_family(line: &str, exporter: Exporter) -> Option<(&'static MetricFamily, &str)> {
    if line.starts_with('#') {
        return None;
    }

    FAMILIES
        .iter()
        .filter(|family| family.exporter == exporter)
        .find_map(|family| {
            line.strip_prefix(family.name)
                .filter(|rest| rest.starts_with('{'))
                .map(|rest| (family, rest))
        })
}

/// Split `{...} tail` into the label block and the tail, honouring quotes
fn split_label_block(rest: &str) -> Option<(&str, &str)> {
    let body = rest.strip_prefix('{')?;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some((&body[..i], &body[i + 1..])),
            _ => {}
        }
    }

    None
}

/// Parse the numeric value following the label block.
///
/// `value` or `value timestamp`; anything else is malformed.
fn parse_value(tail: &str) -> Option<f64> {
    let mut tokens = tail.split_whitespace();
    let value = tokens.next()?;
    let _timestamp = tokens.next();
    if tokens.next().is_some() {
        return None;
    }

    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a label block (`k="v",k2=v2`) into a map.
///
/// Pairs are split at their first `=`; pairs without `=` are ignored.
pub fn parse_labels(block: &str) -> Labels {
    let mut labels = Labels::new();

    for pair in split_pairs(block) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        labels.insert(key.to_string(), strip_quotes(value.trim()));
    }

    labels
}

/// Split on commas that are not inside a quoted value
fn split_pairs(block: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, ch) in block.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                pairs.push(&block[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pairs.push(&block[start..]);

    pairs
}

fn strip_quotes(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        unescape(&value[1..value.len() - 1])
    } else {
        value.trim_matches('"').to_string()
    }
}

fn unescape(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
