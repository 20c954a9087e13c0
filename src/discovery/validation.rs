//! Validation of backend descriptors before they enter the registry.

use regex::Regex;
use std::sync::OnceLock;

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::{BackendDescriptor, LEGACY_VERSION};

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const DNS1035_LABEL_MAX_LENGTH: usize = 63;

fn dns1123_subdomain() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("static regex")
    })
}

fn dns1035_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("static regex"))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
///
/// The port must be numeric. Returns the host without brackets.
pub fn split_host_port(value: &str) -> AggregatorResult<(String, u16)> {
    let invalid = |reason: &str| {
        AggregatorError::bad_request(format!("invalid host:port '{}': {}", value, reason))
    };

    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@'))
    {
        return Err(invalid(&format!("unexpected character {:?}", c)));
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = value.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| invalid("port must be a number between 0 and 65535"))?;

    Ok((host.to_string(), port))
}

/// Check that a CA bundle holds at least one PEM certificate and nothing malformed
pub fn validate_ca_bundle(ca_bundle: &[u8]) -> Result<usize, String> {
    let mut reader = ca_bundle;
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        cert.map_err(|e| format!("caBundle is not valid PEM: {}", e))?;
        count += 1;
    }
    if count == 0 {
        return Err("caBundle contains no PEM certificates".to_string());
    }
    Ok(count)
}

/// Validate a descriptor, reporting every problem found.
///
/// `reserved_group` is the aggregator's own group, which no backend may claim.
pub fn validate_descriptor(
    descriptor: &BackendDescriptor,
    reserved_group: &str,
) -> AggregatorResult<()> {
    let mut errors = Vec::new();

    let required_name = format!("{}.{}", descriptor.version, descriptor.group);
    if descriptor.name.is_empty() {
        errors.push("name is required".to_string());
    } else if descriptor.name.contains('/') || descriptor.name.contains('%') {
        errors.push(format!("name '{}' may not contain '/' or '%'", descriptor.name));
    } else if descriptor.name != required_name {
        errors.push(format!("name must be version + \".\" + group: \"{}\"", required_name));
    }

    if descriptor.group.is_empty() {
        if descriptor.version != LEGACY_VERSION {
            errors.push("group: only v1 may have an empty group (the legacy core API)".to_string());
        }
    } else {
        if descriptor.group.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
            errors.push(format!(
                "group must be no more than {} characters",
                DNS1123_SUBDOMAIN_MAX_LENGTH
            ));
        }
        if !dns1123_subdomain().is_match(&descriptor.group) {
            errors.push(format!(
                "group '{}' must be a lowercase RFC 1123 subdomain",
                descriptor.group
            ));
        }
        if descriptor.group == reserved_group {
            errors.push(format!("group '{}' is reserved", descriptor.group));
        }
    }

    if descriptor.version.len() > DNS1035_LABEL_MAX_LENGTH {
        errors.push(format!(
            "version must be no more than {} characters",
            DNS1035_LABEL_MAX_LENGTH
        ));
    }
    if !dns1035_label().is_match(&descriptor.version) {
        errors.push(format!(
            "version '{}' must be a lowercase RFC 1035 label",
            descriptor.version
        ));
    }

    if descriptor.priority <= 0 {
        errors.push(format!("priority must be positive, got {}", descriptor.priority));
    }

    if descriptor.internal_host.is_empty() {
        errors.push("internalHost is required".to_string());
    } else if let Err(e) = split_host_port(&descriptor.internal_host) {
        errors.push(format!("internalHost: {}", e));
    }

    if !descriptor.ca_bundle.is_empty() {
        if descriptor.insecure_skip_tls_verify {
            errors.push("caBundle may not be set together with insecureSkipTLSVerify".to_string());
        }
        if let Err(e) = validate_ca_bundle(&descriptor.ca_bundle) {
            errors.push(e);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AggregatorError::validation("backend", &descriptor.name, errors))
    }
}
