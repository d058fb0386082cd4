//! Common utilities for generated Kubernetes objects
//!
//! Shared constants, labels and owner references used by every object the
//! operator writes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Operator field manager name for server-side apply and patches
pub const FIELD_MANAGER: &str = "postgres-provisioner";

/// Label carrying the name of the resource a generated object belongs to
pub const OWNER_LABEL: &str = "postgres-operator.smoketurner.com/owner";

/// Label carrying the kind of the resource a generated object belongs to
pub const OWNER_KIND_LABEL: &str = "postgres-operator.smoketurner.com/owner-kind";

/// Generate an owner reference pointing at `owner`
///
/// Generated objects are garbage collected together with their owner.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels for objects generated on behalf of `owner`
pub fn standard_labels<K>(owner: &K) -> BTreeMap<String, String>
where
    K: Resource<DynamicType = ()>,
{
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (OWNER_LABEL.to_string(), owner.name_any()),
        (OWNER_KIND_LABEL.to_string(), K::kind(&()).to_string()),
    ])
}
