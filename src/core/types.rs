//! # Core Types Module
//!
//! Data shared by every layer of the aggregator:
//!
//! - [`BackendDescriptor`]: the registration object for one backend group/version
//! - [`BackendKind`]: whether a descriptor is the legacy core API or a named group
//! - [`UserInfo`]: the authenticated caller, propagated to backends
//! - the discovery documents served under `/apis`
//!
//! Wire names follow the usual API discovery conventions (camelCase, `kind`
//! and `apiVersion` on top-level documents).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the descriptor standing for the legacy core API, served at `/api`.
pub const LEGACY_BACKEND_NAME: &str = "v1.";

/// Version the legacy core API is served under.
pub const LEGACY_VERSION: &str = "v1";

/// Registration of one backend serving a single group/version.
///
/// `name` is always `<version>.<group>`; the legacy core API uses `v1.`
/// with an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub name: String,

    #[serde(default)]
    pub group: String,

    pub version: String,

    /// `host:port` the aggregator connects to
    pub internal_host: String,

    /// Lower is preferred in discovery ordering
    #[serde(default = "default_priority")]
    pub priority: i64,

    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// PEM encoded CA certificates used to verify the backend, base64 on the wire
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub ca_bundle: Vec<u8>,
}

fn default_priority() -> i64 {
    100
}

/// Base64 encoding for byte fields, matching how certificates travel in API objects
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}

impl BackendDescriptor {
    /// Create a descriptor for `group`/`version`, deriving the name.
    ///
    /// An empty group with version `v1` yields the legacy descriptor `v1.`.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        internal_host: impl Into<String>,
        priority: i64,
    ) -> Self {
        let group = group.into();
        let version = version.into();
        Self {
            name: format!("{}.{}", version, group),
            group,
            version,
            internal_host: internal_host.into(),
            priority,
            insecure_skip_tls_verify: false,
            ca_bundle: Vec::new(),
        }
    }

    /// Builder-style setter for the CA bundle
    pub fn with_ca_bundle(mut self, ca_bundle: Vec<u8>) -> Self {
        self.ca_bundle = ca_bundle;
        self
    }

    /// Builder-style setter for skipping backend certificate verification
    pub fn with_insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_tls_verify = insecure;
        self
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::from_descriptor(self)
    }

    /// `<group>/<version>`, or just `<version>` for the legacy API
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Legacy core API versus a named API group.
///
/// The legacy sentinel never appears in `/apis` and gets no group discovery
/// handler; everything else is routed under `/apis/<group>/<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Legacy,
    Group { group: String, version: String },
}

impl BackendKind {
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        if descriptor.name == LEGACY_BACKEND_NAME {
            Self::Legacy
        } else {
            Self::Group {
                group: descriptor.group.clone(),
                version: descriptor.version.clone(),
            }
        }
    }

    /// Path prefix proxied to the backend
    pub fn route_path(&self) -> String {
        match self {
            Self::Legacy => "/api".to_string(),
            Self::Group { group, version } => format!("/apis/{}/{}", group, version),
        }
    }

    /// Path of the group discovery document, `None` for the legacy API
    pub fn group_path(&self) -> Option<String> {
        match self {
            Self::Legacy => None,
            Self::Group { group, .. } => Some(format!("/apis/{}", group)),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Group { group, version } => write!(f, "{}/{}", group, version),
        }
    }
}

/// The authenticated caller of a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.extra.insert(key.into(), values);
        self
    }

    /// Identity assigned to requests without credentials when anonymous access is on
    pub fn anonymous() -> Self {
        Self::new("system:anonymous").with_groups(["system:unauthenticated"])
    }
}

/// One group/version entry in a discovery document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionForDiscovery {
    pub group_version: String,
    pub version: String,
}

/// Discovery document for one API group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroup {
    #[serde(default = "api_group_kind")]
    pub kind: String,
    #[serde(default = "discovery_api_version")]
    pub api_version: String,
    pub name: String,
    pub versions: Vec<GroupVersionForDiscovery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<GroupVersionForDiscovery>,
}

impl ApiGroup {
    /// Build a group document; the preferred version is the first listed
    pub fn new(name: impl Into<String>, versions: Vec<GroupVersionForDiscovery>) -> Self {
        Self {
            kind: api_group_kind(),
            api_version: discovery_api_version(),
            name: name.into(),
            preferred_version: versions.first().cloned(),
            versions,
        }
    }
}

/// Discovery document listing every group, served at `/apis`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroupList {
    #[serde(default = "api_group_list_kind")]
    pub kind: String,
    #[serde(default = "discovery_api_version")]
    pub api_version: String,
    pub groups: Vec<ApiGroup>,
}

impl ApiGroupList {
    pub fn new(groups: Vec<ApiGroup>) -> Self {
        Self {
            kind: api_group_list_kind(),
            api_version: discovery_api_version(),
            groups,
        }
    }
}

/// One resource served by a group/version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    pub name: String,
    pub namespaced: bool,
    pub kind: String,
    pub verbs: Vec<String>,
}

/// Resource listing for one group/version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    #[serde(default = "api_resource_list_kind")]
    pub kind: String,
    #[serde(default = "discovery_api_version")]
    pub api_version: String,
    pub group_version: String,
    pub resources: Vec<ApiResource>,
}

fn api_group_kind() -> String {
    "APIGroup".to_string()
}

fn api_group_list_kind() -> String {
    "APIGroupList".to_string()
}

fn api_resource_list_kind() -> String {
    "APIResourceList".to_string()
}

fn discovery_api_version() -> String {
    "v1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_name_derivation() {
        let descriptor = BackendDescriptor::new("metrics.example.io", "v1beta1", "10.0.0.1:443", 10);
        assert_eq!(descriptor.name, "v1beta1.metrics.example.io");
        assert_eq!(descriptor.group_version(), "metrics.example.io/v1beta1");

        let legacy = BackendDescriptor::new("", "v1", "10.0.0.2:443", 1);
        assert_eq!(legacy.name, LEGACY_BACKEND_NAME);
        assert_eq!(legacy.group_version(), "v1");
    }

    #[test]
    fn test_kind_and_paths() {
        let legacy = BackendDescriptor::new("", "v1", "10.0.0.2:443", 1);
        assert!(legacy.kind().is_legacy());
        assert_eq!(legacy.kind().route_path(), "/api");
        assert_eq!(legacy.kind().group_path(), None);

        let grouped = BackendDescriptor::new("foo.io", "v2", "10.0.0.3:443", 1);
        assert_eq!(grouped.kind().route_path(), "/apis/foo.io/v2");
        assert_eq!(grouped.kind().group_path().as_deref(), Some("/apis/foo.io"));
    }

    #[test]
    fn test_descriptor_wire_format() {
        let yaml = r#"
name: v1.foo.io
group: foo.io
version: v1
internalHost: "backend.svc:8443"
priority: 5
insecureSkipTLSVerify: true
caBundle: aGVsbG8=
"#;
        let descriptor: BackendDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.internal_host, "backend.svc:8443");
        assert!(descriptor.insecure_skip_tls_verify);
        assert_eq!(descriptor.ca_bundle, b"hello");

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["caBundle"], "aGVsbG8=");
        assert_eq!(json["insecureSkipTLSVerify"], true);
    }

    #[test]
    fn test_api_group_preferred_version_is_first() {
        let group = ApiGroup::new(
            "foo.io",
            vec![
                GroupVersionForDiscovery {
                    group_version: "foo.io/v2".into(),
                    version: "v2".into(),
                },
                GroupVersionForDiscovery {
                    group_version: "foo.io/v1".into(),
                    version: "v1".into(),
                },
            ],
        );
        assert_eq!(group.preferred_version.unwrap().version, "v2");

        let json = serde_json::to_value(ApiGroupList::new(vec![])).unwrap();
        assert_eq!(json["kind"], "APIGroupList");
        assert_eq!(json["apiVersion"], "v1");
    }
}
