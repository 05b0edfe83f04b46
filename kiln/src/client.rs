//! Thin typed wrapper over the control-plane REST surface.
//!
//! Rendered manifests are dynamic objects; their apiVersion/kind pairs are
//! resolved against API discovery once at startup. Transient failures (429,
//! 5xx, connection problems) are retried with exponential backoff bounded by
//! the caller's deadline; everything else surfaces immediately.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    core::{GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Errors surfaced by the API gateway after retry handling.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The object already exists. Tolerated for namespaces and run-once
    /// objects.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the existing object.
        kind: String,
        /// Name of the existing object.
        name: String,
    },
    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object.
        kind: String,
        /// Name of the missing object.
        name: String,
    },
    /// A transient error persisted past the wait budget.
    #[error("wait budget exhausted retrying transient api error: {0}")]
    Timeout(#[source] kube::Error),
    /// A non-retriable API error.
    #[error("api error: {0}")]
    Permanent(#[source] kube::Error),
    /// A blocking wait outlived its budget.
    #[error("timed out waiting for {0}")]
    WaitExpired(String),
    /// The manifest lacks apiVersion/kind or a name.
    #[error("malformed manifest: {0}")]
    Manifest(String),
    /// The cluster does not serve this apiVersion/kind.
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    /// The operation observed job cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

enum ErrorClass {
    AlreadyExists,
    NotFound,
    Transient,
    Permanent,
}

fn classify(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => match resp.reason.as_str() {
            "AlreadyExists" => ErrorClass::AlreadyExists,
            "NotFound" => ErrorClass::NotFound,
            _ if resp.code == 429 || resp.code >= 500 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Typed wrapper over the control plane for one run.
pub struct ClusterClient {
    client: Client,
    discovery: Discovery,
}

impl ClusterClient {
    /// Wrap `client`, resolving the cluster's served API groups.
    pub async fn try_new(client: Client) -> Result<Self, kube::Error> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self { client, discovery })
    }

    /// Wrap `client` without running discovery. Dynamic-object operations
    /// will not resolve; namespace operations work.
    #[cfg(test)]
    pub(crate) fn new_undiscovered(client: Client) -> Self {
        let discovery = Discovery::new(client.clone());
        Self { client, discovery }
    }

    /// The underlying client, for typed watchers.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a dynamic API handle for `types`, scoped to `namespace` when
    /// the resource is namespaced.
    pub fn api_for(
        &self,
        types: &TypeMeta,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ApiError> {
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let (resource, capabilities) = self
            .discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| ApiError::UnknownKind(format!("{}/{}", types.api_version, types.kind)))?;
        Ok(match capabilities.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or("default"),
                &resource,
            ),
        })
    }

    /// Create a rendered object.
    pub async fn create(
        &self,
        obj: &DynamicObject,
        namespace: Option<&str>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, ApiError> {
        let (api, kind, name) = self.dynamic_target(obj, namespace)?;
        let obj = obj.clone();
        self.with_retries(&kind, &name, deadline, cancel, || {
            let api = api.clone();
            let obj = obj.clone();
            async move { api.create(&PostParams::default(), &obj).await }
        })
        .await
    }

    /// Merge-patch an object from a rendered document.
    pub async fn patch(
        &self,
        obj: &DynamicObject,
        namespace: Option<&str>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, ApiError> {
        let (api, kind, name) = self.dynamic_target(obj, namespace)?;
        let patch = serde_json::to_value(obj)
            .map_err(|err| ApiError::Manifest(format!("unserializable manifest: {err}")))?;
        self.with_retries(&kind, &name, deadline, cancel, || {
            let api = api.clone();
            let name = name.clone();
            let patch = patch.clone();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
            }
        })
        .await
    }

    /// Fetch one object identified by a rendered document.
    pub async fn get(
        &self,
        obj: &DynamicObject,
        namespace: Option<&str>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, ApiError> {
        let (api, kind, name) = self.dynamic_target(obj, namespace)?;
        self.with_retries(&kind, &name, deadline, cancel, || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get(&name).await }
        })
        .await
    }

    /// Delete one object identified by a rendered document. A missing
    /// object is not an error.
    pub async fn delete(
        &self,
        obj: &DynamicObject,
        namespace: Option<&str>,
        grace_period: Option<u32>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let (api, kind, name) = self.dynamic_target(obj, namespace)?;
        let params = match grace_period {
            Some(seconds) => DeleteParams::default().grace_period(seconds),
            None => DeleteParams::default(),
        };
        let result = self
            .with_retries(&kind, &name, deadline, cancel, || {
                let api = api.clone();
                let name = name.clone();
                let params = params.clone();
                async move { api.delete(&name, &params).await }
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound { kind, name }) => {
                debug!(%kind, %name, "already deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// List objects of a kind by label selector.
    pub async fn list(
        &self,
        types: &TypeMeta,
        namespace: Option<&str>,
        selector: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let api = self.api_for(types, namespace)?;
        let params = ListParams::default().labels(selector);
        let list = self
            .with_retries(&types.kind, "<list>", deadline, cancel, || {
                let api = api.clone();
                let params = params.clone();
                async move { api.list(&params).await }
            })
            .await?;
        Ok(list.items)
    }

    /// Create a namespace with the given labels. An existing namespace is a
    /// warning, not a failure.
    pub async fn create_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            ..Default::default()
        };
        let result = self
            .with_retries("Namespace", name, deadline, cancel, || {
                let namespaces = namespaces.clone();
                let namespace = namespace.clone();
                async move { namespaces.create(&PostParams::default(), &namespace).await }
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ApiError::AlreadyExists { kind, name }) => {
                warn!(%kind, %name, "already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a namespace, optionally blocking until it is gone.
    pub async fn delete_namespace(
        &self,
        name: &str,
        wait: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let result = self
            .with_retries("Namespace", name, deadline, cancel, || {
                let namespaces = namespaces.clone();
                let name = name.to_owned();
                async move { namespaces.delete(&name, &DeleteParams::default()).await }
            })
            .await;
        match result {
            Ok(_) => {}
            Err(ApiError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }
        if !wait {
            return Ok(());
        }
        loop {
            match namespaces.get_opt(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(err) if matches!(classify(&err), ErrorClass::Transient) => {
                    warn!(%err, namespace = name, "transient error polling namespace deletion");
                }
                Err(err) => return Err(ApiError::Permanent(err)),
            }
            if Instant::now() >= deadline {
                return Err(ApiError::WaitExpired(format!("deletion of namespace {name}")));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// List namespaces by label selector.
    pub async fn list_namespaces(
        &self,
        selector: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Namespace>, ApiError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        let list = self
            .with_retries("Namespace", "<list>", deadline, cancel, || {
                let namespaces = namespaces.clone();
                let params = params.clone();
                async move { namespaces.list(&params).await }
            })
            .await?;
        Ok(list.items)
    }

    fn dynamic_target(
        &self,
        obj: &DynamicObject,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, String, String), ApiError> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| ApiError::Manifest("manifest without apiVersion/kind".to_owned()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApiError::Manifest("manifest without metadata.name".to_owned()))?;
        let api = self.api_for(types, namespace)?;
        Ok((api, types.kind.clone(), name))
    }

    async fn with_retries<T, F, Fut>(
        &self,
        kind: &str,
        name: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, kube::Error>>,
    {
        let mut delay = INITIAL_BACKOFF;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match classify(&err) {
                    ErrorClass::AlreadyExists => {
                        return Err(ApiError::AlreadyExists {
                            kind: kind.to_owned(),
                            name: name.to_owned(),
                        })
                    }
                    ErrorClass::NotFound => {
                        return Err(ApiError::NotFound {
                            kind: kind.to_owned(),
                            name: name.to_owned(),
                        })
                    }
                    ErrorClass::Permanent => return Err(ApiError::Permanent(err)),
                    ErrorClass::Transient => {
                        if Instant::now() + delay >= deadline {
                            return Err(ApiError::Timeout(err));
                        }
                        warn!(%err, %kind, %name, ?delay, "transient api error, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http::{Request, Response, StatusCode};
    use hyper::Body;
    use serde_json::json;

    use super::*;

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn mock_cluster() -> (ClusterClient, ApiServerHandle) {
        let (mock_service, handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        (ClusterClient::new_undiscovered(client), handle)
    }

    fn status_body(code: u16, reason: &str) -> Body {
        Body::from(
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": reason,
                "reason": reason,
                "code": code,
            })
            .to_string(),
        )
    }

    fn namespace_body(name: &str) -> Body {
        Body::from(
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": name},
            })
            .to_string(),
        )
    }

    async fn respond(handle: &mut ApiServerHandle, status: StatusCode, body: Body) {
        let (_request, send) = handle.next_request().await.expect("request expected");
        send.send_response(
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_namespace_retries_transient_errors() {
        let (cluster, mut handle) = mock_cluster();
        let server = tokio::spawn(async move {
            respond(
                &mut handle,
                StatusCode::TOO_MANY_REQUESTS,
                status_body(429, "TooManyRequests"),
            )
            .await;
            respond(
                &mut handle,
                StatusCode::INTERNAL_SERVER_ERROR,
                status_body(500, "InternalError"),
            )
            .await;
            respond(&mut handle, StatusCode::CREATED, namespace_body("kiln-1")).await;
        });

        let deadline = Instant::now() + Duration::from_secs(60);
        cluster
            .create_namespace("kiln-1", BTreeMap::new(), deadline, &CancellationToken::new())
            .await
            .expect("create should succeed after retries");
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn create_namespace_tolerates_already_exists() {
        let (cluster, mut handle) = mock_cluster();
        let server = tokio::spawn(async move {
            respond(
                &mut handle,
                StatusCode::CONFLICT,
                status_body(409, "AlreadyExists"),
            )
            .await;
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        cluster
            .create_namespace("kiln-1", BTreeMap::new(), deadline, &CancellationToken::new())
            .await
            .expect("already-existing namespace is tolerated");
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_surface_immediately() {
        let (cluster, mut handle) = mock_cluster();
        let server = tokio::spawn(async move {
            respond(
                &mut handle,
                StatusCode::FORBIDDEN,
                status_body(403, "Forbidden"),
            )
            .await;
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = cluster
            .create_namespace("kiln-1", BTreeMap::new(), deadline, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Permanent(_)), "got {err:?}");
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_time_out_against_the_deadline() {
        let (cluster, mut handle) = mock_cluster();
        let server = tokio::spawn(async move {
            loop {
                let Some((_request, send)) = handle.next_request().await else {
                    break;
                };
                send.send_response(
                    Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .header("content-type", "application/json")
                        .body(status_body(503, "ServiceUnavailable"))
                        .unwrap(),
                );
            }
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = cluster
            .create_namespace("kiln-1", BTreeMap::new(), deadline, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)), "got {err:?}");
        drop(cluster);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let (cluster, mut handle) = mock_cluster();
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                respond(
                    &mut handle,
                    StatusCode::SERVICE_UNAVAILABLE,
                    status_body(503, "ServiceUnavailable"),
                )
                .await;
                cancel.cancel();
            })
        };

        let deadline = Instant::now() + Duration::from_secs(3600);
        let err = cluster
            .create_namespace("kiln-1", BTreeMap::new(), deadline, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Cancelled), "got {err:?}");
        drop(cluster);
        server.await.unwrap();
    }
}
