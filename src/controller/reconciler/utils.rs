//! Convergence plumbing shared by the ensure-style steps.
//!
//! Owned objects are converged with read-then-merge-patch: a merge patch
//! carries only the desired fields, so platform-managed fields (assigned
//! cluster IPs, node ports, default tolerations) are never clobbered, and a
//! pass that finds nothing to change performs no write at all.

use crate::crd::Cluster;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Outcome of an ensure step, used for update logging and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnsureResult {
    Unchanged,
    Created,
    Updated,
}

impl EnsureResult {
    pub(crate) fn changed(self) -> bool {
        !matches!(self, EnsureResult::Unchanged)
    }
}

impl fmt::Display for EnsureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsureResult::Unchanged => f.write_str("unchanged"),
            EnsureResult::Created => f.write_str("created"),
            EnsureResult::Updated => f.write_str("updated"),
        }
    }
}

/// Create-or-update an owned object. `patch` holds the desired subset of
/// fields (spec, data, annotations) merged into the live object when it
/// already exists; identical state results in no write.
pub(crate) async fn ensure_object<K>(
    api: &Api<K>,
    desired: &K,
    patch: Value,
) -> Result<EnsureResult, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    let name = desired.name_any();

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), desired).await?;
            Ok(EnsureResult::Created)
        }
        Some(current) => {
            let current_value = serde_json::to_value(&current).map_err(kube::Error::SerdeError)?;
            if merge_would_change(&current_value, &patch) {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(EnsureResult::Updated)
            } else {
                Ok(EnsureResult::Unchanged)
            }
        }
    }
}

/// Create an object only if absent; already-exists is not an error. Used for
/// configuration content that is never updated in place once created.
pub(crate) async fn create_if_absent<K>(api: &Api<K>, desired: &K) -> Result<bool, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => Ok(false),
        Err(err) => Err(err),
    }
}

/// Delete an object, treating not-found as already converged.
pub(crate) async fn delete_ignore_not_found<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// Owner references pointing at the Cluster as controller, for cascade
/// delete. `None` only before the Cluster has been persisted (no uid yet).
pub(crate) fn owner_refs(cluster: &Cluster) -> Option<Vec<OwnerReference>> {
    cluster.controller_owner_ref(&()).map(|r| vec![r])
}

/// Would merging `patch` into `current` change anything? Follows JSON merge
/// patch semantics for objects; scalars and arrays compare wholesale.
pub(crate) fn merge_would_change(current: &Value, patch: &Value) -> bool {
    match (current, patch) {
        (Value::Object(current_map), Value::Object(patch_map)) => {
            patch_map.iter().any(|(key, value)| match current_map.get(key) {
                Some(existing) => merge_would_change(existing, value),
                None => !value.is_null(),
            })
        }
        (current, patch) => current != patch,
    }
}
