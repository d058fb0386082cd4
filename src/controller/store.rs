//! Access to the declarative object store
//!
//! Reconcilers read and write records only through [`ResourceStore`] and
//! [`SecretStore`]. The Kubernetes implementations below translate these calls
//! into API requests; tests substitute in-memory stores.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::controller::error::{Error, Result};
use crate::resources::FIELD_MANAGER;

/// Typed access to one kind of record
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Current revision of a record, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Every record in scope
    async fn list(&self) -> Result<Vec<K>>;

    /// Replace metadata and spec; fails with `PatchConflict` on a stale revision
    async fn update(&self, obj: &K) -> Result<K>;

    /// Write the status against the revision `obj` was read at
    async fn patch_status(&self, obj: &K) -> Result<K>;
}

/// Read and write access to secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create or overwrite the secret
    async fn apply(&self, secret: &Secret) -> Result<()>;
}

fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

fn map_write_error<K: Resource>(obj: &K, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref ae) if ae.code == 409 => Error::PatchConflict(object_key(obj)),
        e => Error::Kube(e),
    }
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
}

impl KubeStore {
    /// `namespace` limits `list` to one namespace (`None` = cluster-wide)
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<K>> {
        let api: Api<K> = match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        self.api::<K>(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(obj, e))
    }

    async fn patch_status(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });

        self.api::<K>(&namespace)
            .patch_status(
                &obj.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_write_error(obj, e))
    }
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply(&self, secret: &Secret) -> Result<()> {
        let namespace = secret
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }
}
