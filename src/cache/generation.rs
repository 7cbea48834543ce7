//! Cache generation tagging and activation-time reconciliation.
//!
//! Every cache name carries the deployment version as a `::`-separated
//! suffix. On activation the store is reconciled so that exactly the caches
//! of the current generation survive.

use color_eyre::Result;
use tracing::info;

use super::store::CacheStore;

const TAG_SEPARATOR: &str = "::";

/// Tag a base cache name with a generation, e.g. `articles` + `v7` ⇒
/// `articles::v7`.
pub fn tagged(base: &str, version: &str) -> String {
  format!("{}{}{}", base, TAG_SEPARATOR, version)
}

/// Extract the generation tag from a cache name, if it has one.
pub fn version_of(cache_name: &str) -> Option<&str> {
  cache_name
    .rsplit_once(TAG_SEPARATOR)
    .map(|(_, version)| version)
}

/// Delete every cache whose generation tag differs from `current_version`
/// (untagged caches count as stale). Returns the deleted names.
///
/// Runs once per activation, before the engine serves any request.
pub fn reconcile(store: &dyn CacheStore, current_version: &str) -> Result<Vec<String>> {
  let mut deleted = Vec::new();

  for name in store.list_caches()? {
    if version_of(&name) == Some(current_version) {
      continue;
    }

    store.delete_cache(&name)?;
    info!(cache = %name, "dropped cache from previous generation");
    deleted.push(name);
  }

  Ok(deleted)
}
