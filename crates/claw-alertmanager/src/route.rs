//! The routing tree.
//!
//! A [`Route`] is built once per configuration from a [`RouteConfig`]. Every
//! child inherits the receiver, grouping and timings of its parent unless it
//! overrides them.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::{
    DEFAULT_GROUP_INTERVAL, DEFAULT_GROUP_WAIT, DEFAULT_REPEAT_INTERVAL, GROUP_BY_ALL, RouteConfig,
};
use crate::matchers::Matchers;
use crate::types::LabelSet;

/// The effective settings of a route after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOpts {
    /// Receiver notified for alerts ending at the route.
    pub receiver: String,
    /// Labels to group by.
    pub group_by: BTreeSet<String>,
    /// Group by every label.
    pub group_by_all: bool,
    /// Buffering before the first notification of a group.
    pub group_wait: Duration,
    /// Minimum time between notifications of a group.
    pub group_interval: Duration,
    /// Minimum time before re-sending an unchanged group.
    pub repeat_interval: Duration,
}

impl RouteOpts {
    fn inherit(parent: Option<&Self>, config: &RouteConfig) -> Self {
        let (group_by, group_by_all) = match &config.group_by {
            Some(labels) if labels.iter().any(|l| l == GROUP_BY_ALL) => (BTreeSet::new(), true),
            Some(labels) => (labels.iter().cloned().collect(), false),
            None => parent.map_or((BTreeSet::new(), false), |p| {
                (p.group_by.clone(), p.group_by_all)
            }),
        };
        Self {
            receiver: config
                .receiver
                .clone()
                .or_else(|| parent.map(|p| p.receiver.clone()))
                .unwrap_or_default(),
            group_by,
            group_by_all,
            group_wait: config
                .group_wait
                .or_else(|| parent.map(|p| p.group_wait))
                .unwrap_or(DEFAULT_GROUP_WAIT),
            group_interval: config
                .group_interval
                .or_else(|| parent.map(|p| p.group_interval))
                .unwrap_or(DEFAULT_GROUP_INTERVAL),
            repeat_interval: config
                .repeat_interval
                .or_else(|| parent.map(|p| p.repeat_interval))
                .unwrap_or(DEFAULT_REPEAT_INTERVAL),
        }
    }
}

/// A node of the routing tree.
#[derive(Debug, Clone)]
pub struct Route {
    key: String,
    id: String,
    matchers: Matchers,
    continue_matching: bool,
    opts: RouteOpts,
    routes: Vec<Route>,
}

impl Route {
    /// Builds the tree rooted at `config`.
    #[must_use]
    pub fn new(config: &RouteConfig) -> Self {
        Self::build(config, None, 0)
    }

    fn build(config: &RouteConfig, parent: Option<&Self>, index: usize) -> Self {
        let opts = RouteOpts::inherit(parent.map(|p| &p.opts), config);
        let (key, id) = match parent {
            None => {
                let key = config.matchers.to_string();
                (key.clone(), key)
            }
            Some(parent) => {
                let key = format!("{}/{}", parent.key, config.matchers);
                let id = format!("{key}/{index}");
                (key, id)
            }
        };
        let mut route = Self {
            key,
            id,
            matchers: config.matchers.clone(),
            continue_matching: config.continue_matching,
            opts,
            routes: Vec::with_capacity(config.routes.len()),
        };
        let children: Vec<Self> = config
            .routes
            .iter()
            .enumerate()
            .map(|(i, child)| Self::build(child, Some(&route), i))
            .collect();
        route.routes = children;
        route
    }

    /// Returns every route an alert with `labels` is delivered through.
    ///
    /// Children are tried in order; the first matching child ends the search
    /// unless it has `continue` set. A route with no matching child matches
    /// itself. Returns an empty list if the route's own matchers fail.
    #[must_use]
    pub fn match_labels(&self, labels: &LabelSet) -> Vec<&Self> {
        if !self.matchers.matches(labels) {
            return Vec::new();
        }
        let mut matched = Vec::new();
        for child in &self.routes {
            let child_matches = child.match_labels(labels);
            let hit = !child_matches.is_empty();
            matched.extend(child_matches);
            if hit && !child.continue_matching {
                break;
            }
        }
        if matched.is_empty() {
            matched.push(self);
        }
        matched
    }

    /// The labels of an alert that identify its aggregation group.
    #[must_use]
    pub fn group_labels(&self, labels: &LabelSet) -> LabelSet {
        if self.opts.group_by_all {
            return labels.clone();
        }
        labels
            .iter()
            .filter(|(name, _)| self.opts.group_by.contains(*name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Key identifying the route by its matcher path.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key that also distinguishes siblings with identical matchers.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Effective settings.
    #[must_use]
    pub const fn opts(&self) -> &RouteOpts {
        &self.opts
    }

    /// Child routes.
    #[must_use]
    pub fn routes(&self) -> &[Self] {
        &self.routes
    }

    /// Visits the route and all its descendants depth-first.
    pub fn walk<F: FnMut(&Self)>(&self, visit: &mut F) {
        visit(self);
        for child in &self.routes {
            child.walk(visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::Matcher;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn child(receiver: &str, name: &str, value: &str, continue_matching: bool) -> RouteConfig {
        RouteConfig {
            receiver: Some(receiver.into()),
            matchers: Matchers(vec![Matcher::equal(name, value).unwrap()]),
            continue_matching,
            ..RouteConfig::default()
        }
    }

    fn tree() -> Route {
        let mut db = child("db", "team", "db", false);
        db.routes = vec![child("db-pager", "severity", "critical", false)];
        db.group_wait = Some(Duration::from_secs(1));

        Route::new(&RouteConfig {
            receiver: Some("default".into()),
            group_by: Some(vec!["alertname".into()]),
            routes: vec![
                child("audit", "env", "prod", true),
                db,
                child("web", "team", "web", false),
                child("fallback-db", "team", "db", false),
            ],
            ..RouteConfig::default()
        })
    }

    fn receivers(routes: &[&Route]) -> Vec<String> {
        routes.iter().map(|r| r.opts().receiver.clone()).collect()
    }

    #[test]
    fn root_matches_unrouted() {
        let root = tree();
        assert_eq!(receivers(&root.match_labels(&labels(&[("team", "infra")]))), vec!["default"]);
    }

    #[test]
    fn first_match_wins() {
        let root = tree();
        assert_eq!(receivers(&root.match_labels(&labels(&[("team", "db")]))), vec!["db"]);
    }

    #[test]
    fn nested_match_descends() {
        let root = tree();
        let matched = root.match_labels(&labels(&[("team", "db"), ("severity", "critical")]));
        assert_eq!(receivers(&matched), vec!["db-pager"]);
    }

    #[test]
    fn continue_keeps_matching_siblings() {
        let root = tree();
        let matched = root.match_labels(&labels(&[("env", "prod"), ("team", "web")]));
        assert_eq!(receivers(&matched), vec!["audit", "web"]);
    }

    #[test]
    fn children_inherit_options() {
        let root = tree();
        let db = &root.routes()[1];
        let pager = &db.routes()[0];

        assert_eq!(db.opts().group_by, root.opts().group_by);
        assert_eq!(db.opts().group_wait, Duration::from_secs(1));
        assert_eq!(pager.opts().group_wait, Duration::from_secs(1));
        assert_eq!(pager.opts().repeat_interval, DEFAULT_REPEAT_INTERVAL);
        assert_eq!(root.opts().group_interval, DEFAULT_GROUP_INTERVAL);
    }

    #[test]
    fn keys_follow_matcher_path() {
        let root = tree();
        assert_eq!(root.key(), "{}");
        let db = &root.routes()[1];
        assert_eq!(db.key(), r#"{}/{team="db"}"#);
        assert_eq!(db.routes()[0].key(), r#"{}/{team="db"}/{severity="critical"}"#);

        let fallback = &root.routes()[3];
        assert_eq!(fallback.key(), db.key());
        assert_ne!(fallback.id(), db.id());
    }

    #[test]
    fn group_labels_subset_and_all() {
        let root = tree();
        let alert = labels(&[("alertname", "HighCPU"), ("node", "n1")]);
        assert_eq!(root.group_labels(&alert), labels(&[("alertname", "HighCPU")]));

        let all = Route::new(&RouteConfig {
            receiver: Some("default".into()),
            group_by: Some(vec![GROUP_BY_ALL.into()]),
            ..RouteConfig::default()
        });
        assert!(all.opts().group_by_all);
        assert_eq!(all.group_labels(&alert), alert);
    }

    #[test]
    fn walk_visits_every_route() {
        let mut count = 0;
        tree().walk(&mut |_| count += 1);
        assert_eq!(count, 6);
    }
}
