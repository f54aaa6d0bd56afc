use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// True if `s` can be placed in a shell script or systemd unit unquoted.
pub fn is_shell_safe(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_safe() {
        assert!(is_shell_safe("google/medgemma-4b-it"));
        assert!(is_shell_safe("0.8.3"));
        assert!(is_shell_safe("arn:aws:secretsmanager:us-east-1:123456789012:secret:hf-AbCdEf"));
        assert!(!is_shell_safe("x; rm -rf /"));
        assert!(!is_shell_safe("$(id)"));
        assert!(!is_shell_safe("ubuntu user"));
        assert!(!is_shell_safe(""));
    }
}
