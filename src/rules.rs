//! Ordered rule table mapping intercepted requests to caching strategies.
//!
//! Rules are declared in the config file, evaluated in declaration order,
//! and the first match wins. A request matching no rule passes through to
//! the network untouched.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::cache::{generation, EvictionPolicy};
use crate::request::{Destination, InterceptedRequest, Method};

/// The four resolution algorithms the strategy engine implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

/// Side-effect-free test against an intercepted request. All present fields
/// must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePredicate {
  /// Accepted methods; any method matches when omitted
  pub methods: Option<Vec<Method>>,
  /// Host pattern, `*` wildcards allowed (e.g. `api.*.example`)
  pub host: Option<String>,
  /// Path pattern, `*` wildcards allowed (e.g. `/api/scores/*`)
  pub path: Option<String>,
  pub destination: Option<Destination>,
  /// Full-page navigation to one of the configured app-shell routes
  #[serde(default)]
  pub app_shell: bool,
}

/// One declared rule, as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
  #[serde(rename = "match", default)]
  pub predicate: RulePredicate,
  pub strategy: StrategyKind,
  /// Base cache name; the generation tag is appended at startup
  pub cache: Option<String>,
  pub eviction: Option<EvictionPolicy>,
  /// NetworkFirst race timeout
  pub timeout_seconds: Option<u64>,
  /// Retry queue fed by failed mutating requests under NetworkOnly
  pub queue: Option<String>,
}

/// A validated rule with its cache name tagged for the current generation.
#[derive(Debug, Clone)]
pub struct Rule {
  pub predicate: RulePredicate,
  pub strategy: StrategyKind,
  pub cache_name: Option<String>,
  pub eviction: Option<EvictionPolicy>,
  pub timeout_seconds: Option<u64>,
  pub queue: Option<String>,
}

/// The ordered rule table. Static after startup.
#[derive(Debug, Clone)]
pub struct RuleSet {
  rules: Vec<Rule>,
  shell_routes: BTreeSet<String>,
}

impl RuleSet {
  /// Validate the declared rules and tag cache names with the current
  /// generation.
  pub fn build(
    configs: Vec<RuleConfig>,
    shell_routes: impl IntoIterator<Item = String>,
    version: &str,
  ) -> Result<Self> {
    let mut rules = Vec::with_capacity(configs.len());

    for (i, config) in configs.into_iter().enumerate() {
      let cache_name = match (&config.strategy, config.cache) {
        (StrategyKind::NetworkOnly, cache) => cache.map(|c| generation::tagged(&c, version)),
        (_, Some(cache)) => Some(generation::tagged(&cache, version)),
        (strategy, None) => {
          return Err(eyre!(
            "Rule {} uses {:?} but declares no cache name",
            i,
            strategy
          ))
        }
      };

      if config.queue.is_some() && config.strategy != StrategyKind::NetworkOnly {
        return Err(eyre!(
          "Rule {} declares a retry queue but is not network-only",
          i
        ));
      }

      rules.push(Rule {
        predicate: config.predicate,
        strategy: config.strategy,
        cache_name,
        eviction: config.eviction,
        timeout_seconds: config.timeout_seconds,
        queue: config.queue,
      });
    }

    Ok(Self {
      rules,
      shell_routes: shell_routes.into_iter().collect(),
    })
  }

  /// First rule whose predicate matches, or None for pass-through.
  pub fn resolve(&self, request: &InterceptedRequest) -> Option<&Rule> {
    self
      .rules
      .iter()
      .find(|rule| self.matches(&rule.predicate, request))
  }

  /// Queue names declared across the table.
  pub fn queue_names(&self) -> Vec<&str> {
    self
      .rules
      .iter()
      .filter_map(|rule| rule.queue.as_deref())
      .collect()
  }

  fn matches(&self, predicate: &RulePredicate, request: &InterceptedRequest) -> bool {
    let desc = &request.descriptor;

    if let Some(methods) = &predicate.methods {
      if !methods.contains(&desc.method) {
        return false;
      }
    }

    if let Some(host) = &predicate.host {
      if !pattern_matches(host, desc.host()) {
        return false;
      }
    }

    if let Some(path) = &predicate.path {
      if !pattern_matches(path, desc.path()) {
        return false;
      }
    }

    if let Some(destination) = &predicate.destination {
      if *destination != desc.destination {
        return false;
      }
    }

    if predicate.app_shell {
      if desc.destination != Destination::Document {
        return false;
      }
      if !self.shell_routes.contains(desc.path()) {
        return false;
      }
    }

    true
  }
}

/// Wildcard match where `*` spans any run of characters.
fn pattern_matches(pattern: &str, text: &str) -> bool {
  let p: Vec<char> = pattern.chars().collect();
  let t: Vec<char> = text.chars().collect();

  let (mut pi, mut ti) = (0usize, 0usize);
  let mut star: Option<(usize, usize)> = None;

  while ti < t.len() {
    if pi < p.len() && (p[pi] == t[ti]) {
      pi += 1;
      ti += 1;
    } else if pi < p.len() && p[pi] == '*' {
      star = Some((pi, ti));
      pi += 1;
    } else if let Some((sp, st)) = star {
      // Backtrack: let the last * absorb one more character
      pi = sp + 1;
      ti = st + 1;
      star = Some((sp, st + 1));
    } else {
      return false;
    }
  }

  while pi < p.len() && p[pi] == '*' {
    pi += 1;
  }

  pi == p.len()
}
