//! Types for implementing admission controllers.
//!
//! For more information on admission controllers, see:
//! <https://kubernetes.io/docs/reference/access-authn-authz/admission-controllers/>
//! <https://github.com/kubernetes/api/blob/master/admission/v1/types.go>

use crate::{
    dynamic::DynamicObject,
    error::Status,
    gvk::{GroupVersionKind, GroupVersionResource},
    metadata::TypeMeta,
    resource::Resource,
};

use std::collections::HashMap;

use k8s_openapi::{
    api::authentication::v1::UserInfo, apimachinery::pkg::runtime::RawExtension, ByteString,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to serialize patch")]
/// Failed to serialize patch.
pub struct SerializePatchError(#[source] serde_json::Error);

#[derive(Debug, Error)]
#[error("failed to convert AdmissionReview into AdmissionRequest")]
/// Failed to convert `AdmissionReview` into `AdmissionRequest`.
pub struct ConvertAdmissionReviewError;

/// The `kind` field in [`TypeMeta`].
pub const META_KIND: &str = "AdmissionReview";
/// The `api_version` field in [`TypeMeta`] on the v1 version.
pub const META_API_VERSION_V1: &str = "admission.k8s.io/v1";
/// The `api_version` field in [`TypeMeta`] on the v1beta1 version.
pub const META_API_VERSION_V1BETA1: &str = "admission.k8s.io/v1beta1";

/// The top level struct used for serializing and deserializing AdmissionReview
/// requests and responses.
///
/// This is both the input type received by admission controllers, and the
/// output type admission controllers should return.
///
/// An admission controller should start by inspecting the [`AdmissionRequest`].
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview<T: Resource> {
    /// Contains the API version and type of the request.
    #[serde(flatten)]
    pub types: TypeMeta,
    /// Describes the attributes for the admission request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest<T>>,
    /// Describes the attributes for the admission response.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub response: Option<AdmissionResponse>,
}

impl<T: Resource> TryInto<AdmissionRequest<T>> for AdmissionReview<T> {
    type Error = ConvertAdmissionReviewError;

    fn try_into(self) -> Result<AdmissionRequest<T>, Self::Error> {
        match self.request {
            Some(mut req) => {
                req.types = self.types;
                Ok(req)
            }
            None => Err(ConvertAdmissionReviewError),
        }
    }
}

/// An incoming [`AdmissionReview`] request.
///
/// In an admission controller scenario, this is extracted from an
/// [`AdmissionReview`] via [`TryInto`]. Based on its contents, construct an
/// [`AdmissionResponse`] using:
///
/// - [`AdmissionResponse::deny`] for illegal/rejected requests
/// - [`AdmissionResponse::invalid`] for malformed requests
/// - [`AdmissionResponse::from`] for the happy path
///
/// then wrap the chosen response in an [`AdmissionReview`] via
/// [`AdmissionResponse::into_review`].
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest<T: Resource> {
    /// Copied from the containing [`AdmissionReview`] and used to specify a
    /// response type and version when constructing an [`AdmissionResponse`].
    #[serde(skip)]
    pub types: TypeMeta,
    /// An identifier for the individual request/response. The UID is meant to
    /// track the round trip (request/response) between the apiserver and the
    /// webhook, not the user request, and must be echoed in the response.
    pub uid: String,
    /// The fully-qualified type of object being submitted.
    pub kind: GroupVersionKind,
    /// The fully-qualified resource being requested.
    pub resource: GroupVersionResource,
    /// The subresource being requested, if any (for example, "status" or
    /// "scale").
    #[serde(default)]
    pub sub_resource: Option<String>,
    /// The name of the object as presented in the request. On a CREATE
    /// operation, the client may omit name and rely on the server to generate
    /// the name. If that is the case, this field will contain an empty string.
    #[serde(default)]
    pub name: String,
    /// The namespace associated with the request (if any).
    #[serde(default)]
    pub namespace: Option<String>,
    /// The operation being performed. This may be different than the operation
    /// requested. e.g. a patch can result in either a CREATE or UPDATE
    /// Operation.
    pub operation: Operation,
    /// Information about the requesting user.
    pub user_info: UserInfo,
    /// The object from the incoming request. It's `None` for
    /// [`DELETE`](Operation::Delete) operations.
    pub object: Option<T>,
    /// The existing object. Only populated for DELETE and UPDATE requests.
    pub old_object: Option<T>,
    /// Specifies that modifications will definitely not be persisted for this
    /// request.
    #[serde(default)]
    pub dry_run: bool,
    /// The operation option structure of the operation being performed. e.g.
    /// `meta.k8s.io/v1.DeleteOptions` or `meta.k8s.io/v1.CreateOptions`.
    #[serde(default)]
    pub options: Option<RawExtension>,
}

/// The operation specified in an [`AdmissionRequest`].
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// An operation that creates a resource.
    Create,
    /// An operation that updates a resource.
    Update,
    /// An operation that deletes a resource.
    Delete,
    /// An operation that connects to a resource.
    Connect,
}

impl Operation {
    /// The SCREAMING_SNAKE_CASE name used in registration manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        }
    }
}

/// An outgoing [`AdmissionReview`] response. Constructed from the
/// corresponding [`AdmissionRequest`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Copied from the corresponding constructing [`AdmissionRequest`].
    #[serde(skip)]
    pub types: TypeMeta,
    /// Identifier for the individual request/response. This must be copied
    /// over from the corresponding AdmissionRequest.
    pub uid: String,
    /// Indicates whether or not the admission request was permitted.
    pub allowed: bool,
    /// Extra details into why an admission request was denied. This field IS
    /// NOT consulted in any way if "allowed" is "true".
    #[serde(rename = "status", default, skip_serializing_if = "is_default_status")]
    pub result: Status,
    /// The patch body. We only support "JSONPatch" (RFC 6902), serialized as
    /// base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    /// The type of Patch. We only allow "JSONPatch", and only emit the field
    /// when a patch is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_type: Option<PatchType>,
    /// An unstructured key value map set by a remote admission controller
    /// (e.g. error=image-blacklisted), added as context to the audit log for
    /// this request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub audit_annotations: HashMap<String, String>,
    /// A list of warning messages to return to the requesting API client.
    /// Limit warnings to 120 characters if possible; over 256 characters and
    /// large numbers of warnings may be truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

fn is_default_status(s: &Status) -> bool {
    *s == Status::default()
}

impl<T: Resource> From<&AdmissionRequest<T>> for AdmissionResponse {
    fn from(req: &AdmissionRequest<T>) -> Self {
        Self {
            types: req.types.clone(),
            uid: req.uid.clone(),
            allowed: true,
            result: Default::default(),
            patch: None,
            patch_type: None,
            audit_annotations: Default::default(),
            warnings: None,
        }
    }
}

impl AdmissionResponse {
    /// Constructs an invalid [`AdmissionResponse`]. It doesn't copy the uid
    /// from the corresponding [`AdmissionRequest`], so should only be used
    /// when the original request cannot be read.
    pub fn invalid<T: ToString>(reason: T) -> Self {
        Self {
            types: TypeMeta {
                kind: META_KIND.to_owned(),
                api_version: META_API_VERSION_V1.to_owned(),
            },
            uid: Default::default(),
            allowed: false,
            result: Status::failure(&reason.to_string(), "InvalidRequest"),
            patch: None,
            patch_type: None,
            audit_annotations: Default::default(),
            warnings: None,
        }
    }

    /// Deny the request with a reason. The reason will be sent to the original caller.
    #[must_use]
    pub fn deny<T: ToString>(mut self, reason: T) -> Self {
        self.allowed = false;
        self.result.message = reason.to_string();
        if self.result.message.is_empty() {
            // A rejection must always carry a human-readable explanation.
            self.result.message = "admission denied".to_string();
        }
        self.result.status = "Failure".to_string();
        self
    }

    /// Add JSON patches to the response, modifying the object from the request.
    ///
    /// An empty patch is dropped: the response then carries neither `patch`
    /// nor `patchType`.
    pub fn with_patch(mut self, patch: json_patch::Patch) -> Result<Self, SerializePatchError> {
        if patch.0.is_empty() {
            self.patch = None;
            self.patch_type = None;
            return Ok(self);
        }
        self.patch = Some(ByteString(
            serde_json::to_vec(&patch).map_err(SerializePatchError)?,
        ));
        self.patch_type = Some(PatchType::JsonPatch);
        Ok(self)
    }

    /// Converts an [`AdmissionResponse`] into a generic [`AdmissionReview`]
    /// that can be used as a webhook response.
    pub fn into_review(self) -> AdmissionReview<DynamicObject> {
        AdmissionReview {
            types: self.types.clone(),
            request: None,
            response: Some(self),
        }
    }
}

/// The type of patch returned in an [`AdmissionResponse`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum PatchType {
    /// Specifies the patch body implements JSON Patch under RFC 6902.
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

#[cfg(test)]
mod test {
    use super::{AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError};
    use crate::dynamic::DynamicObject;
    use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation};
    use serde_json::json;

    fn review_body() -> serde_json::Value {
        json!({
            "kind": "AdmissionReview",
            "apiVersion": "admission.k8s.io/v1",
            "request": {
                "uid": "0c9a8d74-9cb7-44dd-b98e-09fd62def2f4",
                "kind": { "group": "example.io", "version": "v1", "kind": "Widget" },
                "resource": { "group": "example.io", "version": "v1", "resource": "widgets" },
                "name": "w1",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": { "username": "admin", "groups": ["system:authenticated"] },
                "object": {
                    "apiVersion": "example.io/v1",
                    "kind": "Widget",
                    "metadata": { "name": "w1", "namespace": "default" },
                    "spec": { "size": 1 },
                },
                "oldObject": null,
                "dryRun": false,
            },
        })
    }

    #[test]
    fn v1_review_unmarshals() {
        serde_json::from_value::<AdmissionReview<DynamicObject>>(review_body()).unwrap();
    }

    #[test]
    fn uid_and_version_pass_through() -> Result<(), ConvertAdmissionReviewError> {
        let rev: AdmissionReview<DynamicObject> = serde_json::from_value(review_body()).unwrap();
        let types = rev.types.clone();
        let req: AdmissionRequest<_> = rev.try_into()?;
        let res = AdmissionResponse::from(&req).into_review();
        assert_eq!(types, res.types);
        assert_eq!(
            res.response.unwrap().uid,
            "0c9a8d74-9cb7-44dd-b98e-09fd62def2f4"
        );
        Ok(())
    }

    #[test]
    fn deny_always_has_a_message() {
        let rev: AdmissionReview<DynamicObject> = serde_json::from_value(review_body()).unwrap();
        let req: AdmissionRequest<_> = rev.try_into().unwrap();
        let res = AdmissionResponse::from(&req).deny("");
        assert!(!res.allowed);
        assert!(!res.result.message.is_empty());
    }

    #[test]
    fn patch_serializes_as_base64_and_empty_patch_is_omitted() {
        let rev: AdmissionReview<DynamicObject> = serde_json::from_value(review_body()).unwrap();
        let req: AdmissionRequest<_> = rev.try_into().unwrap();

        let unchanged = AdmissionResponse::from(&req).with_patch(Patch(vec![])).unwrap();
        let out = serde_json::to_value(unchanged).unwrap();
        assert!(out.get("patch").is_none());
        assert!(out.get("patchType").is_none());

        let patched = AdmissionResponse::from(&req)
            .with_patch(Patch(vec![PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "flag"]),
                value: json!(true),
            })]))
            .unwrap();
        let out = serde_json::to_value(patched).unwrap();
        assert_eq!(out["patchType"], "JSONPatch");
        // ByteString serializes to base64 on the wire
        let b64 = out["patch"].as_str().unwrap();
        assert!(!b64.contains('['));
    }
}
