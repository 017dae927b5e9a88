use super::RollingDeployRequest;

/// Longest release name accepted; object names derived from it need headroom
pub const MAX_RELEASE_NAME_LEN: usize = 53;

const MAX_NAMESPACE_LEN: usize = 63;

/// Validate a rollout request before anything touches the cluster
///
/// # Validation Rules
/// - `releaseName` is a DNS-1123 label of at most 53 characters
/// - `namespace` is a DNS-1123 label
/// - `timeoutMinutes` is > 0
pub fn validate_request(request: &RollingDeployRequest) -> Result<(), String> {
    if !is_dns1123_label(&request.release_name, MAX_RELEASE_NAME_LEN) {
        return Err(format!(
            "releaseName {:?} must be a lowercase DNS-1123 label of at most {} characters",
            request.release_name, MAX_RELEASE_NAME_LEN
        ));
    }

    if !is_dns1123_label(&request.namespace, MAX_NAMESPACE_LEN) {
        return Err(format!(
            "namespace {:?} must be a lowercase DNS-1123 label",
            request.namespace
        ));
    }

    if request.timeout_minutes == 0 {
        return Err("timeoutMinutes must be > 0".to_string());
    }

    Ok(())
}

fn is_dns1123_label(value: &str, max_len: usize) -> bool {
    let bytes = value.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    value.len() <= max_len
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
