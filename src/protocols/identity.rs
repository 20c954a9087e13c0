//! Caller identity: how proxies obtain it from a request and how it is
//! written onto the outbound request to a backend.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;

use crate::core::config::IdentityConfig;
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::UserInfo;

/// Extracts the authenticated caller from a request
pub type IdentityAccessor = Arc<dyn Fn(&Request) -> Option<UserInfo> + Send + Sync>;

/// Read the `UserInfo` the authentication middleware stored in the request extensions
pub fn user_from_extensions(request: &Request) -> Option<UserInfo> {
    request
        .extensions()
        .get::<Arc<UserInfo>>()
        .map(|user| UserInfo::clone(user))
}

pub fn default_identity_accessor() -> IdentityAccessor {
    Arc::new(user_from_extensions)
}

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Header scheme used to hand the caller's identity to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityPropagation {
    /// One header for the user name, one repeated header per group and one
    /// header per extra key under a prefix
    RequestHeader {
        username: HeaderName,
        group: HeaderName,
        extra_prefix: String,
    },
    /// `Impersonate-User`, `Impersonate-Group` and `Impersonate-Extra-<key>`
    Impersonation,
}

impl Default for IdentityPropagation {
    fn default() -> Self {
        Self::RequestHeader {
            username: HeaderName::from_static("x-remote-user"),
            group: HeaderName::from_static("x-remote-group"),
            extra_prefix: "x-remote-extra-".to_string(),
        }
    }
}

impl IdentityPropagation {
    pub fn from_config(config: &IdentityConfig) -> AggregatorResult<Self> {
        match config {
            IdentityConfig::RequestHeader {
                username_header,
                group_header,
                extra_header_prefix,
            } => {
                let parse = |value: &str| {
                    HeaderName::from_bytes(value.as_bytes()).map_err(|e| {
                        AggregatorError::config(format!("Invalid identity header '{}': {}", value, e))
                    })
                };
                Ok(Self::RequestHeader {
                    username: parse(username_header)?,
                    group: parse(group_header)?,
                    extra_prefix: extra_header_prefix.to_ascii_lowercase(),
                })
            }
            IdentityConfig::Impersonation => Ok(Self::Impersonation),
        }
    }

    fn names(&self) -> (HeaderName, HeaderName, &str) {
        match self {
            Self::RequestHeader {
                username,
                group,
                extra_prefix,
            } => (username.clone(), group.clone(), extra_prefix.as_str()),
            Self::Impersonation => (
                HeaderName::from_static(IMPERSONATE_USER),
                HeaderName::from_static(IMPERSONATE_GROUP),
                IMPERSONATE_EXTRA_PREFIX,
            ),
        }
    }

    /// Remove identity headers a client may have supplied itself.
    ///
    /// The impersonation and default request-header families are removed
    /// whatever scheme is configured, along with the configured names.
    pub fn strip(&self, headers: &mut HeaderMap) {
        strip_family(headers, self.names());
        strip_family(headers, Self::Impersonation.names());
        if *self == Self::Impersonation {
            strip_family(headers, Self::default().names());
        }
    }

    /// Replace any identity headers in `headers` with those describing `user`
    pub fn apply(&self, headers: &mut HeaderMap, user: &UserInfo) -> AggregatorResult<()> {
        self.strip(headers);
        let (username, group, extra_prefix) = self.names();

        headers.insert(username, header_value(&user.username)?);
        for member in &user.groups {
            headers.append(group.clone(), header_value(member)?);
        }
        for (key, values) in &user.extra {
            // Extra keys may hold characters that are not legal in header names.
            let name = format!("{}{}", extra_prefix, urlencoding::encode(&key.to_ascii_lowercase()));
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AggregatorError::internal(format!("invalid identity extra key '{}': {}", key, e))
            })?;
            for value in values {
                headers.append(name.clone(), header_value(value)?);
            }
        }
        Ok(())
    }
}

fn strip_family(headers: &mut HeaderMap, (username, group, extra_prefix): (HeaderName, HeaderName, &str)) {
    headers.remove(&username);
    headers.remove(&group);

    let extras: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(extra_prefix))
        .cloned()
        .collect();
    for name in extras {
        headers.remove(&name);
    }
}

fn header_value(value: &str) -> AggregatorResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AggregatorError::internal(format!("identity value not valid in a header: {}", e)))
}
