//! Cluster API seam – discovery and paged listing over kube.
//!
//! The export core consumes the [`ClusterApi`] trait as its sole source of
//! cluster state; [`KubeClusterApi`] is the kube-backed implementation, and
//! tests substitute their own.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use kube::{
    api::{Api, DynamicObject, ListParams},
    core::ApiResource,
    discovery::{verbs, Discovery, Scope},
    Client,
};

use kubexporter_core::{ClusterError, GroupResource};

/// One page of a list call. An absent continue token means the listing is
/// drained.
#[derive(Debug, Clone, Default)]
pub struct ResourcePage {
    pub items: Vec<Value>,
    pub continue_token: Option<String>,
}

/// The cluster-facing operations the export core depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Discover every kind that supports list.
    async fn discover(&self) -> Result<Vec<GroupResource>>;

    /// Fetch one page of instances of a kind. Requests are namespace-scoped
    /// when `namespace` is set, cluster-scoped otherwise.
    async fn list_page(
        &self,
        res: &GroupResource,
        namespace: Option<&str>,
        continue_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<ResourcePage, ClusterError>;

    /// Fetch a single object by namespace and name.
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClusterError>;
}

/// kube-backed [`ClusterApi`]. Discovery runs once at construction; the
/// resolved `ApiResource`s are cached for the lifetime of the handle.
pub struct KubeClusterApi {
    client: Client,
    resources: HashMap<String, (ApiResource, bool)>,
    discovered: Vec<GroupResource>,
}

impl KubeClusterApi {
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await.context("building cluster client")?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context("running api discovery")?;
        let mut resources = HashMap::new();
        let mut discovered = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let gr = GroupResource::new(&ar.group, &ar.version, &ar.kind, namespaced);
                resources.insert(gr.group_kind(), (ar.clone(), namespaced));
                discovered.push(gr);
            }
        }
        info!(kinds = discovered.len(), "discovered listable kinds");
        Ok(Self {
            client,
            resources,
            discovered,
        })
    }

    fn api_for(
        &self,
        group_kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self
            .resources
            .get(group_kind)
            .ok_or(ClusterError::NotFound)?;
        let api = if *namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
                None => Api::all_with(self.client.clone(), ar),
            }
        } else {
            Api::all_with(self.client.clone(), ar)
        };
        Ok(api)
    }
}

fn classify(err: kube::Error) -> ClusterError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound,
        kube::Error::Api(resp) if resp.code == 405 => ClusterError::NotAllowed,
        _ => ClusterError::Other(err.to_string()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn discover(&self) -> Result<Vec<GroupResource>> {
        Ok(self.discovered.clone())
    }

    async fn list_page(
        &self,
        res: &GroupResource,
        namespace: Option<&str>,
        continue_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<ResourcePage, ClusterError> {
        let api = self.api_for(&res.group_kind(), namespace)?;
        let mut lp = ListParams::default();
        lp.limit = limit;
        lp.continue_token = continue_token.map(str::to_string);
        let list = api.list(&lp).await.map_err(classify)?;
        let continue_token = list.metadata.continue_.clone().filter(|c| !c.is_empty());
        let items = list
            .items
            .iter()
            .map(|o| serde_json::to_value(o).map_err(|e| ClusterError::Other(e.to_string())))
            .collect::<Result<Vec<_>, ClusterError>>()?;
        debug!(
            kind = %res.group_kind(),
            items = items.len(),
            more = continue_token.is_some(),
            "listed page"
        );
        Ok(ResourcePage {
            items,
            continue_token,
        })
    }

    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClusterError> {
        let group_kind = match api_version.split_once('/') {
            Some((group, _version)) => format!("{group}.{kind}"),
            None => kind.to_string(),
        };
        let api = self.api_for(&group_kind, namespace)?;
        let obj = api.get(name).await.map_err(classify)?;
        serde_json::to_value(&obj).map_err(|e| ClusterError::Other(e.to_string()))
    }
}
