/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to the empty string.
pub fn resolve_env(s: &str) -> String {
    let mut result = s.to_string();
    let mut search_from = 0;

    while let Some(offset) = result[search_from..].find("${") {
        let start = search_from + offset;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        search_from = start + value.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env() {
        std::env::set_var("WALSYNC_TEST_PASSWORD", "s3cret");
        assert_eq!(resolve_env("${WALSYNC_TEST_PASSWORD}"), "s3cret");
        assert_eq!(
            resolve_env("pw=${WALSYNC_TEST_PASSWORD}!"),
            "pw=s3cret!"
        );
        assert_eq!(resolve_env("plain"), "plain");
        assert_eq!(resolve_env("${WALSYNC_TEST_UNSET_VAR}"), "");
        assert_eq!(resolve_env("${unterminated"), "${unterminated");
    }

    #[test]
    fn test_resolved_value_is_not_rescanned() {
        std::env::set_var("WALSYNC_TEST_NESTED", "${WALSYNC_TEST_NESTED}");
        assert_eq!(resolve_env("${WALSYNC_TEST_NESTED}"), "${WALSYNC_TEST_NESTED}");
    }
}
