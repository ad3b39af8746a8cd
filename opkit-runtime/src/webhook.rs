//! Admission webhook server
//!
//! An HTTPS endpoint receiving `AdmissionReview` envelopes, routed by
//! (path, group/version/resource, operation) to validating or mutating
//! handlers. Mutating handlers return the desired object; the server
//! synthesizes the RFC 6902 patch itself, so handlers never hand-write
//! patch operations.

use crate::patch;
use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::{
    api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
        ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
use opkit_core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Handler errors are opaque to the server; they only feed the failure policy
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load webhook TLS material: {0}")]
    Tls(#[source] std::io::Error),
    #[error("webhook server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// What the apiserver should do when this webhook cannot be reached or fails
/// internally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fail open: a webhook error admits the request
    Ignore,
    /// Fail closed: a webhook error rejects the request
    Fail,
}

impl FailurePolicy {
    fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Ignore => "Ignore",
            FailurePolicy::Fail => "Fail",
        }
    }
}

/// Side-effect class declared in the registration manifest, passed through
/// unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectClass {
    None,
    NoneOnDryRun,
    Some,
    Unknown,
}

impl SideEffectClass {
    fn as_str(&self) -> &'static str {
        match self {
            SideEffectClass::None => "None",
            SideEffectClass::NoneOnDryRun => "NoneOnDryRun",
            SideEffectClass::Some => "Some",
            SideEffectClass::Unknown => "Unknown",
        }
    }
}

/// Manifest match policy, passed through unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    Exact,
    Equivalent,
}

impl MatchPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Exact => "Exact",
            MatchPolicy::Equivalent => "Equivalent",
        }
    }
}

/// Manifest reinvocation policy for mutating webhooks, passed through
/// unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinvocationPolicy {
    Never,
    IfNeeded,
}

impl ReinvocationPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            ReinvocationPolicy::Never => "Never",
            ReinvocationPolicy::IfNeeded => "IfNeeded",
        }
    }
}

/// The resource scope a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Namespaced,
    Cluster,
    /// Matches both scopes (`"*"` in the manifest)
    Any,
}

impl RuleScope {
    fn as_str(&self) -> &'static str {
        match self {
            RuleScope::Namespaced => "Namespaced",
            RuleScope::Cluster => "Cluster",
            RuleScope::Any => "*",
        }
    }
}

/// One matching tuple of a webhook registration.
///
/// A request matches when every field matches, with `"*"` wildcarding.
#[derive(Debug, Clone)]
pub struct WebhookRule {
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    /// Operation names (`CREATE`, `UPDATE`, `DELETE`, `CONNECT`) or `"*"`
    pub operations: Vec<String>,
    pub scope: RuleScope,
}

impl Default for WebhookRule {
    /// Matches everything
    fn default() -> Self {
        Self {
            api_groups: vec!["*".to_string()],
            api_versions: vec!["*".to_string()],
            resources: vec!["*".to_string()],
            operations: vec!["*".to_string()],
            scope: RuleScope::Any,
        }
    }
}

fn wildcard_match(allowed: &[String], value: &str) -> bool {
    allowed.iter().any(|a| a == "*" || a == value)
}

impl WebhookRule {
    fn matches(&self, req: &AdmissionRequest<DynamicObject>) -> bool {
        let scope_ok = match self.scope {
            RuleScope::Any => true,
            RuleScope::Namespaced => req.namespace.is_some(),
            RuleScope::Cluster => req.namespace.is_none(),
        };
        scope_ok
            && wildcard_match(&self.api_groups, &req.resource.group)
            && wildcard_match(&self.api_versions, &req.resource.version)
            && wildcard_match(&self.resources, &req.resource.resource)
            && wildcard_match(&self.operations, req.operation.as_str())
    }

    fn to_manifest(&self) -> RuleWithOperations {
        RuleWithOperations {
            api_groups: Some(self.api_groups.clone()),
            api_versions: Some(self.api_versions.clone()),
            resources: Some(self.resources.clone()),
            operations: Some(self.operations.clone()),
            scope: Some(self.scope.as_str().to_string()),
        }
    }
}

/// The outcome of a validating handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Allow,
    /// Denials must explain themselves; an empty message is replaced with a
    /// generic one
    Deny(String),
}

/// A validating admission handler
#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate(&self, req: &AdmissionRequest<DynamicObject>) -> Result<Validation, BoxError>;
}

/// A mutating admission handler
///
/// Returns the desired form of the incoming object; returning it unchanged
/// produces a response without a patch.
#[async_trait]
pub trait Mutator: Send + Sync + 'static {
    async fn mutate(&self, req: &AdmissionRequest<DynamicObject>) -> Result<DynamicObject, BoxError>;
}

/// Declarative half of a webhook registration, mirrored into the
/// `*WebhookConfiguration` manifests
#[derive(Debug, Clone)]
pub struct WebhookSpec {
    /// Manifest webhook name, e.g. `vwidget.example.io`
    pub name: String,
    /// HTTP path this webhook serves under, e.g. `/validate-widgets`
    pub path: String,
    pub rules: Vec<WebhookRule>,
    pub failure_policy: FailurePolicy,
    pub side_effects: SideEffectClass,
    pub timeout_seconds: Option<i32>,
    pub match_policy: MatchPolicy,
    /// Only meaningful for mutating webhooks
    pub reinvocation_policy: ReinvocationPolicy,
}

impl WebhookSpec {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            rules: vec![WebhookRule::default()],
            failure_policy: FailurePolicy::Fail,
            side_effects: SideEffectClass::None,
            timeout_seconds: Some(10),
            match_policy: MatchPolicy::Equivalent,
            reinvocation_policy: ReinvocationPolicy::Never,
        }
    }

    #[must_use]
    pub fn rules(mut self, rules: Vec<WebhookRule>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

enum Handler {
    Validating(Arc<dyn Validator>),
    Mutating(Arc<dyn Mutator>),
}

struct Registration {
    spec: WebhookSpec,
    handler: Handler,
}

impl Registration {
    async fn admit(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let base = AdmissionResponse::from(req);
        let attempted: Result<AdmissionResponse, BoxError> = match &self.handler {
            Handler::Validating(validator) => match validator.validate(req).await {
                Ok(Validation::Allow) => Ok(base),
                Ok(Validation::Deny(message)) => Ok(base.deny(message)),
                Err(err) => Err(err),
            },
            Handler::Mutating(mutator) => match mutator.mutate(req).await {
                Ok(returned) => self.mutation_response(base, req, &returned),
                Err(err) => Err(err),
            },
        };
        match attempted {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    webhook = %self.spec.name,
                    error = %err,
                    policy = self.spec.failure_policy.as_str(),
                    "admission handler failed"
                );
                match self.spec.failure_policy {
                    FailurePolicy::Ignore => AdmissionResponse::from(req),
                    FailurePolicy::Fail => AdmissionResponse::from(req)
                        .deny(format!("webhook {} failed: {err}", self.spec.name)),
                }
            }
        }
    }

    /// Diff the incoming object against the handler's desired object and
    /// attach the resulting JSON patch. No difference means no patch fields
    /// at all.
    fn mutation_response(
        &self,
        base: AdmissionResponse,
        req: &AdmissionRequest<DynamicObject>,
        returned: &DynamicObject,
    ) -> Result<AdmissionResponse, BoxError> {
        let Some(incoming) = &req.object else {
            // nothing to mutate on e.g. DELETE
            return Ok(base);
        };
        let old = serde_json::to_value(incoming)?;
        let new = serde_json::to_value(returned)?;
        Ok(base.with_patch(patch::diff(&old, &new))?)
    }
}

async fn handle_review(
    State(registrations): State<Arc<Vec<Arc<Registration>>>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            tracing::error!(error = %err, "invalid admission review");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };
    let matched = registrations
        .iter()
        .find(|reg| reg.spec.rules.iter().any(|rule| rule.matches(&req)));
    let Some(registration) = matched else {
        tracing::warn!(
            resource = %req.resource.resource,
            operation = ?req.operation,
            "no webhook rule matched, admitting"
        );
        return Json(AdmissionResponse::from(&req).into_review());
    };
    Json(registration.admit(&req).await.into_review())
}

/// Supplies the endpoint reference the registration manifests advertise.
///
/// In-cluster deployments point at a `Service`; development setups (e.g. a
/// hosted tunnel) supply a URL instead.
pub trait ExternalEndpoint: Send + Sync {
    fn client_config(&self, path: &str, ca_bundle: Option<&[u8]>) -> WebhookClientConfig;
}

/// An in-cluster `Service` endpoint
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub namespace: String,
    pub name: String,
    pub port: Option<i32>,
}

impl ExternalEndpoint for ServiceEndpoint {
    fn client_config(&self, path: &str, ca_bundle: Option<&[u8]>) -> WebhookClientConfig {
        WebhookClientConfig {
            ca_bundle: ca_bundle.map(|ca| ByteString(ca.to_vec())),
            service: Some(ServiceReference {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                path: Some(path.to_string()),
                port: self.port,
            }),
            url: None,
        }
    }
}

/// A plain URL endpoint, e.g. a development tunnel in front of a local run
#[derive(Debug, Clone)]
pub struct UrlEndpoint {
    pub base: String,
}

impl ExternalEndpoint for UrlEndpoint {
    fn client_config(&self, path: &str, ca_bundle: Option<&[u8]>) -> WebhookClientConfig {
        WebhookClientConfig {
            ca_bundle: ca_bundle.map(|ca| ByteString(ca.to_vec())),
            service: None,
            url: Some(format!("{}{}", self.base.trim_end_matches('/'), path)),
        }
    }
}

/// The admission webhook HTTP server.
///
/// Runs independently of the reconcile pipeline and is not gated by leader
/// election: every replica answers admission requests.
pub struct WebhookServer {
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
    registrations: Vec<Arc<Registration>>,
}

impl WebhookServer {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            tls: None,
            registrations: Vec::new(),
        }
    }

    /// Terminate TLS with the given PEM certificate chain and private key.
    ///
    /// The apiserver refuses plain-text webhooks, so this is required for
    /// anything but tests and tunneled development setups.
    #[must_use]
    pub fn with_tls_pem_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert.into(), key.into()));
        self
    }

    #[must_use]
    pub fn register_validating(mut self, spec: WebhookSpec, handler: impl Validator) -> Self {
        self.registrations.push(Arc::new(Registration {
            spec,
            handler: Handler::Validating(Arc::new(handler)),
        }));
        self
    }

    #[must_use]
    pub fn register_mutating(mut self, spec: WebhookSpec, handler: impl Mutator) -> Self {
        self.registrations.push(Arc::new(Registration {
            spec,
            handler: Handler::Mutating(Arc::new(handler)),
        }));
        self
    }

    /// Build the axum router serving every registered path.
    ///
    /// Exposed separately from [`WebhookServer::run`] so tests can drive it
    /// without sockets or TLS.
    #[must_use]
    pub fn router(&self) -> Router {
        let mut by_path: HashMap<String, Vec<Arc<Registration>>> = HashMap::new();
        for registration in &self.registrations {
            by_path
                .entry(registration.spec.path.clone())
                .or_default()
                .push(registration.clone());
        }
        let mut router = Router::new();
        for (path, registrations) in by_path {
            router = router.route(
                &path,
                post(handle_review).with_state(Arc::new(registrations)),
            );
        }
        router.layer(TraceLayer::new_for_http())
    }

    /// Serve admission reviews until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let app = self.router();
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });
        tracing::info!(addr = %self.addr, tls = self.tls.is_some(), "webhook server listening");
        match &self.tls {
            Some((cert, key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key).await.map_err(Error::Tls)?;
                axum_server::bind_rustls(self.addr, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .map_err(Error::Serve)
            }
            None => axum_server::bind(self.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(Error::Serve),
        }
    }

    /// Generate the `ValidatingWebhookConfiguration` covering all validating
    /// registrations, or `None` if there are none.
    #[must_use]
    pub fn validating_configuration(
        &self,
        name: &str,
        endpoint: &dyn ExternalEndpoint,
        ca_bundle: Option<&[u8]>,
    ) -> Option<ValidatingWebhookConfiguration> {
        let webhooks: Vec<ValidatingWebhook> = self
            .registrations
            .iter()
            .filter(|reg| matches!(reg.handler, Handler::Validating(_)))
            .map(|reg| ValidatingWebhook {
                name: reg.spec.name.clone(),
                admission_review_versions: vec!["v1".to_string()],
                client_config: endpoint.client_config(&reg.spec.path, ca_bundle),
                failure_policy: Some(reg.spec.failure_policy.as_str().to_string()),
                match_policy: Some(reg.spec.match_policy.as_str().to_string()),
                rules: Some(reg.spec.rules.iter().map(WebhookRule::to_manifest).collect()),
                side_effects: reg.spec.side_effects.as_str().to_string(),
                timeout_seconds: reg.spec.timeout_seconds,
                ..Default::default()
            })
            .collect();
        if webhooks.is_empty() {
            return None;
        }
        Some(ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            webhooks: Some(webhooks),
        })
    }

    /// Generate the `MutatingWebhookConfiguration` covering all mutating
    /// registrations, or `None` if there are none.
    #[must_use]
    pub fn mutating_configuration(
        &self,
        name: &str,
        endpoint: &dyn ExternalEndpoint,
        ca_bundle: Option<&[u8]>,
    ) -> Option<MutatingWebhookConfiguration> {
        let webhooks: Vec<MutatingWebhook> = self
            .registrations
            .iter()
            .filter(|reg| matches!(reg.handler, Handler::Mutating(_)))
            .map(|reg| MutatingWebhook {
                name: reg.spec.name.clone(),
                admission_review_versions: vec!["v1".to_string()],
                client_config: endpoint.client_config(&reg.spec.path, ca_bundle),
                failure_policy: Some(reg.spec.failure_policy.as_str().to_string()),
                match_policy: Some(reg.spec.match_policy.as_str().to_string()),
                reinvocation_policy: Some(reg.spec.reinvocation_policy.as_str().to_string()),
                rules: Some(reg.spec.rules.iter().map(WebhookRule::to_manifest).collect()),
                side_effects: reg.spec.side_effects.as_str().to_string(),
                timeout_seconds: reg.spec.timeout_seconds,
                ..Default::default()
            })
            .collect();
        if webhooks.is_empty() {
            return None;
        }
        Some(MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            webhooks: Some(webhooks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FailurePolicy, Mutator, RuleScope, ServiceEndpoint, Validation, Validator, WebhookRule,
        WebhookServer, WebhookSpec,
    };
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use opkit_core::{admission::AdmissionRequest, DynamicObject};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn review(operation: &str, object: Value) -> Value {
        json!({
            "kind": "AdmissionReview",
            "apiVersion": "admission.k8s.io/v1",
            "request": {
                "uid": "req-1",
                "kind": { "group": "example.io", "version": "v1", "kind": "Widget" },
                "resource": { "group": "example.io", "version": "v1", "resource": "widgets" },
                "name": "w1",
                "namespace": "default",
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "dryRun": false,
            },
        })
    }

    async fn post_review(router: Router, path: &str, review: &Value) -> Value {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(review).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn widget_rules() -> Vec<WebhookRule> {
        vec![WebhookRule {
            api_groups: vec!["example.io".into()],
            api_versions: vec!["v1".into()],
            resources: vec!["widgets".into()],
            operations: vec!["CREATE".into(), "UPDATE".into()],
            scope: RuleScope::Namespaced,
        }]
    }

    struct DenyBig;
    #[async_trait]
    impl Validator for DenyBig {
        async fn validate(
            &self,
            req: &AdmissionRequest<DynamicObject>,
        ) -> Result<Validation, super::BoxError> {
            let size = req
                .object
                .as_ref()
                .and_then(|o| o.data["spec"]["size"].as_i64())
                .unwrap_or(0);
            if size > 10 {
                Ok(Validation::Deny("spec.size must be at most 10".into()))
            } else {
                Ok(Validation::Allow)
            }
        }
    }

    struct Defaulter;
    #[async_trait]
    impl Mutator for Defaulter {
        async fn mutate(
            &self,
            req: &AdmissionRequest<DynamicObject>,
        ) -> Result<DynamicObject, super::BoxError> {
            let mut obj = req.object.clone().expect("create carries an object");
            obj.data["spec"]["b"] = json!(3);
            obj.data["spec"]["c"] = json!(4);
            Ok(obj)
        }
    }

    struct Exploder;
    #[async_trait]
    impl Validator for Exploder {
        async fn validate(
            &self,
            _req: &AdmissionRequest<DynamicObject>,
        ) -> Result<Validation, super::BoxError> {
            Err("database unreachable".into())
        }
    }

    fn widget(spec: Value) -> Value {
        json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "default" },
            "spec": spec,
        })
    }

    #[tokio::test]
    async fn validating_deny_echoes_uid_and_carries_a_message() {
        let server = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_validating(
            WebhookSpec::new("vwidget.example.io", "/validate").rules(widget_rules()),
            DenyBig,
        );
        let out = post_review(server.router(), "/validate", &review("CREATE", widget(json!({"size": 42})))).await;
        let response = &out["response"];
        assert_eq!(response["uid"], "req-1");
        assert_eq!(response["allowed"], json!(false));
        assert_eq!(response["status"]["message"], "spec.size must be at most 10");

        let out = post_review(server.router(), "/validate", &review("CREATE", widget(json!({"size": 3})))).await;
        assert_eq!(out["response"]["allowed"], json!(true));
    }

    #[tokio::test]
    async fn mutating_webhook_produces_minimal_patch() {
        let server = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_mutating(
            WebhookSpec::new("mwidget.example.io", "/mutate").rules(widget_rules()),
            Defaulter,
        );
        let out = post_review(server.router(), "/mutate", &review("CREATE", widget(json!({"a": 1, "b": 2})))).await;
        let response = &out["response"];
        assert_eq!(response["allowed"], json!(true));
        assert_eq!(response["patchType"], "JSONPatch");
        let decoded: Value =
            serde_json::from_slice(&BASE64.decode(response["patch"].as_str().unwrap()).unwrap())
                .unwrap();
        assert_eq!(
            decoded,
            json!([
                { "op": "replace", "path": "/spec/b", "value": 3 },
                { "op": "add", "path": "/spec/c", "value": 4 },
            ])
        );
    }

    #[tokio::test]
    async fn unchanged_mutation_omits_the_patch() {
        let server = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_mutating(
            WebhookSpec::new("mwidget.example.io", "/mutate").rules(widget_rules()),
            Defaulter,
        );
        // the defaulter sets exactly the values the object already has
        let out = post_review(server.router(), "/mutate", &review("CREATE", widget(json!({"b": 3, "c": 4})))).await;
        let response = &out["response"];
        assert_eq!(response["allowed"], json!(true));
        assert!(response.get("patch").is_none());
        assert!(response.get("patchType").is_none());
    }

    #[tokio::test]
    async fn unmatched_rules_admit_with_passthrough() {
        let server = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_validating(
            WebhookSpec::new("vwidget.example.io", "/validate").rules(widget_rules()),
            DenyBig,
        );
        // DELETE is not in the registered operations
        let out = post_review(server.router(), "/validate", &review("DELETE", widget(json!({"size": 42})))).await;
        assert_eq!(out["response"]["allowed"], json!(true));
    }

    #[tokio::test]
    async fn handler_errors_follow_the_failure_policy() {
        let failing = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_validating(
            WebhookSpec::new("vwidget.example.io", "/validate")
                .rules(widget_rules())
                .failure_policy(FailurePolicy::Fail),
            Exploder,
        );
        let out = post_review(failing.router(), "/validate", &review("CREATE", widget(json!({})))).await;
        assert_eq!(out["response"]["allowed"], json!(false));
        assert!(out["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("database unreachable"));

        let ignoring = WebhookServer::new(([127, 0, 0, 1], 0).into()).register_validating(
            WebhookSpec::new("vwidget.example.io", "/validate")
                .rules(widget_rules())
                .failure_policy(FailurePolicy::Ignore),
            Exploder,
        );
        let out = post_review(ignoring.router(), "/validate", &review("CREATE", widget(json!({})))).await;
        assert_eq!(out["response"]["allowed"], json!(true));
    }

    #[test]
    fn registration_manifests_mirror_the_declared_rules() {
        let server = WebhookServer::new(([127, 0, 0, 1], 0).into())
            .register_validating(
                WebhookSpec::new("vwidget.example.io", "/validate").rules(widget_rules()),
                DenyBig,
            )
            .register_mutating(
                WebhookSpec::new("mwidget.example.io", "/mutate").rules(widget_rules()),
                Defaulter,
            );
        let endpoint = ServiceEndpoint {
            namespace: "opkit-system".into(),
            name: "opkit-webhooks".into(),
            port: Some(8443),
        };
        let vwc = server
            .validating_configuration("widgets.example.io", &endpoint, Some(b"CERT"))
            .unwrap();
        let webhooks = vwc.webhooks.unwrap();
        assert_eq!(webhooks.len(), 1);
        let hook = &webhooks[0];
        assert_eq!(hook.name, "vwidget.example.io");
        assert_eq!(hook.side_effects, "None");
        assert_eq!(hook.admission_review_versions, vec!["v1"]);
        let client = &hook.client_config;
        assert_eq!(client.service.as_ref().unwrap().path.as_deref(), Some("/validate"));
        assert!(client.ca_bundle.is_some());
        let rule = &hook.rules.as_ref().unwrap()[0];
        assert_eq!(rule.scope.as_deref(), Some("Namespaced"));
        assert_eq!(rule.resources.as_deref(), Some(&["widgets".to_string()][..]));

        let mwc = server
            .mutating_configuration("widgets.example.io", &endpoint, Some(b"CERT"))
            .unwrap();
        assert_eq!(mwc.webhooks.unwrap()[0].reinvocation_policy.as_deref(), Some("Never"));
    }
}
