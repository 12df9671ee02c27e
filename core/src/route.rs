//! The in-memory routing model: host buckets of ingress records, each
//! holding ordered path rules, plus the per-request matching walk.

use crate::{IngressRef, ServiceRef};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use regex::Regex;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use std::cmp::Ordering;

/// A compiled path matcher.
#[derive(Clone, Debug)]
pub enum PathMatch {
    /// Segment-bounded prefix: `/foo` matches `/foo`, `/foo/bar` but not
    /// `/foobar`.
    Prefix(String),
    Exact(String),
    /// Legacy glob: a trailing `/*` means "anything at or under"; without it
    /// only the path itself (with or without a trailing slash) matches.
    Glob(String),
    /// Anchored regex; the match length is the length of the match at
    /// offset zero.
    Regex(Regex),
}

/// The outcome of matching one rule against a request path: how much of the
/// path the rule claimed, and whether the claim was exact.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MatchLen {
    pub len: usize,
    pub exact: bool,
}

impl PathMatch {
    /// Builds a prefix matcher with the canonical form: an empty path is
    /// `/`, and a single trailing slash is trimmed.
    pub fn prefix(path: &str) -> Self {
        if path.is_empty() {
            return PathMatch::Prefix("/".to_string());
        }
        let mut path = path.to_string();
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        PathMatch::Prefix(path)
    }

    pub fn exact(path: &str) -> Self {
        if path.is_empty() {
            PathMatch::Exact("/".to_string())
        } else {
            PathMatch::Exact(path.to_string())
        }
    }

    pub fn glob(path: &str) -> Self {
        PathMatch::Glob(path.to_string())
    }

    /// Compiles an anchored regex matcher, forcing a leading `^`.
    pub fn regex(path: &str) -> Result<Self> {
        let path = if path.is_empty() { "/" } else { path };
        let anchored = if path.starts_with('^') {
            path.to_string()
        } else {
            format!("^{path}")
        };
        match Regex::new(&anchored) {
            Ok(re) => Ok(PathMatch::Regex(re)),
            Err(error) => bail!("invalid path regex {anchored:?}: {error}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PathMatch::Prefix(_) => "prefix",
            PathMatch::Exact(_) => "exact",
            PathMatch::Glob(_) => "glob",
            PathMatch::Regex(_) => "re",
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            PathMatch::Prefix(p) | PathMatch::Exact(p) | PathMatch::Glob(p) => p,
            PathMatch::Regex(re) => re.as_str(),
        }
    }

    /// Applies the matcher to a request path.
    pub fn matches(&self, path: &str) -> Option<MatchLen> {
        match self {
            PathMatch::Prefix(p) => {
                let bounded = p == "/"
                    || (path.starts_with(p.as_str())
                        && (path.len() == p.len() || path.as_bytes()[p.len()] == b'/'));
                if bounded && path.starts_with('/') {
                    Some(MatchLen {
                        len: p.len(),
                        exact: false,
                    })
                } else {
                    None
                }
            }

            PathMatch::Exact(p) => (path == p).then_some(MatchLen {
                len: p.len(),
                exact: true,
            }),

            PathMatch::Glob(g) => {
                if let Some(stem) = g.strip_suffix("/*") {
                    if stem.is_empty() {
                        return path.starts_with('/').then_some(MatchLen {
                            len: 1,
                            exact: false,
                        });
                    }
                    let under = path
                        .strip_prefix(stem)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
                    under.then_some(MatchLen {
                        len: stem.len(),
                        exact: false,
                    })
                } else {
                    let hit = path == g || path.strip_suffix('/') == Some(g.as_str());
                    hit.then_some(MatchLen {
                        len: g.len(),
                        exact: false,
                    })
                }
            }

            PathMatch::Regex(re) => match re.find(path) {
                Some(m) if m.start() == 0 => Some(MatchLen {
                    len: m.end(),
                    exact: false,
                }),
                _ => None,
            },
        }
    }
}

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Prefix(l), Self::Prefix(r)) => l == r,
            (Self::Exact(l), Self::Exact(r)) => l == r,
            (Self::Glob(l), Self::Glob(r)) => l == r,
            (Self::Regex(l), Self::Regex(r)) => l.as_str() == r.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatch {}

impl Serialize for PathMatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PathMatch", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("path", self.pattern())?;
        s.end()
    }
}

/// One (host, path) → backend rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub path: PathMatch,
    pub backend: ServiceRef,
}

/// The routing-relevant projection of one Ingress resource for one host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRecord {
    pub ingress: IngressRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<ServiceRef>,
    pub redirect_http_to_https: bool,
    pub rules: Vec<PathRule>,
}

/// The best rule found for a request, or the owning record's default
/// backend when no rule claimed the path.
#[derive(Copy, Clone, Debug)]
pub struct RouteMatch<'a> {
    pub record: &'a IngressRecord,
    pub backend: &'a ServiceRef,
}

/// Host name → ordered group of ingress records. The empty host holds
/// host-less catch-all records.
#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RouteTable {
    set: HashMap<String, Vec<IngressRecord>>,
}

/// Rewrites the first DNS label to `*`, the form under which wildcard rules
/// and certificates are bucketed.
pub fn wildcard_host(host: &str) -> String {
    match host.split_once('.') {
        Some((_, rest)) => format!("*.{rest}"),
        None => "*".to_string(),
    }
}

fn group_order(a: &IngressRecord, b: &IngressRecord) -> Ordering {
    // Option's ordering puts None first, which is what we want: unprioritized
    // records sort ahead of prioritized ones.
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.ingress.name.cmp(&b.ingress.name))
        .then_with(|| a.ingress.namespace.cmp(&b.ingress.namespace))
}

impl RouteTable {
    /// Replaces every record owned by `ingress` with the given per-host
    /// records, re-sorting the touched host groups.
    pub fn apply(&mut self, ingress: &IngressRef, records: Vec<(String, IngressRecord)>) {
        self.remove(ingress);
        let mut touched = Vec::with_capacity(records.len());
        for (host, record) in records {
            self.set.entry(host.clone()).or_default().push(record);
            touched.push(host);
        }
        for host in touched {
            if let Some(group) = self.set.get_mut(&host) {
                group.sort_by(group_order);
            }
        }
    }

    /// Drops every record owned by `ingress`.
    pub fn delete(&mut self, ingress: &IngressRef) {
        self.remove(ingress);
    }

    fn remove(&mut self, ingress: &IngressRef) {
        self.set.retain(|_, group| {
            group.retain(|record| &record.ingress != ingress);
            !group.is_empty()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Number of host buckets.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Resolves a request to a backend: the exact host bucket first, then
    /// the wildcard form of the host, then the host-less catch-all.
    pub fn lookup(&self, host: &str, path: &str) -> Option<RouteMatch<'_>> {
        if let Some(m) = self.lookup_group(host, host, path) {
            return Some(m);
        }
        if !host.is_empty() {
            if let Some(m) = self.lookup_group(&wildcard_host(host), host, path) {
                return Some(m);
            }
        }
        self.lookup_group("", host, path)
    }

    fn lookup_group(&self, bucket: &str, host: &str, path: &str) -> Option<RouteMatch<'_>> {
        let group = self.set.get(bucket)?;

        // The first record in group order that declares a default backend
        // provides the group's fallback.
        let mut fallback = None;

        for record in group {
            if fallback.is_none() {
                if let Some(def) = &record.default_backend {
                    fallback = Some(RouteMatch {
                        record,
                        backend: def,
                    });
                }
            }

            let mut best: Option<(&PathRule, MatchLen)> = None;
            for rule in &record.rules {
                // A rule for another host is skipped; rules carrying the
                // bucket's own name (including its wildcard form) apply.
                if !rule.host.is_empty() && rule.host != host && rule.host != bucket {
                    continue;
                }
                if let Some(m) = rule.path.matches(path) {
                    let better = match best {
                        None => true,
                        Some((_, b)) => m.len > b.len || (m.len == b.len && m.exact && !b.exact),
                    };
                    if better {
                        best = Some((rule, m));
                    }
                }
            }

            if let Some((rule, _)) = best {
                return Some(RouteMatch {
                    record,
                    backend: &rule.backend,
                });
            }
        }

        fallback
    }
}
