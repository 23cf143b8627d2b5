//! Paths that skip identity extraction and auditing.

/// Prefixes exempt from identity extraction and audit observation:
/// schema/docs surfaces, health probes, and static assets.
const EXEMPT_PREFIXES: &[&str] = &[
    "/admin",
    "/api/docs",
    "/api/schema",
    "/api/redoc",
    "/health",
    "/favicon.ico",
];

/// True if the request path is on the exempt list.
pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES.iter().any(|prefix| {
        path == *prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_prefixes_match() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/health/live"));
        assert!(is_exempt("/api/docs/index.html"));
        assert!(is_exempt("/favicon.ico"));
    }

    #[test]
    fn lookalikes_are_not_exempt() {
        assert!(!is_exempt("/healthcheck"));
        assert!(!is_exempt("/api/documents"));
        assert!(!is_exempt("/pos/orders"));
    }
}
