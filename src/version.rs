//! Version information.

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent by [`ApiClient`](crate::http::ApiClient): `skuld/{version}`.
pub fn user_agent() -> String {
    format!("skuld/{PKG_VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_contains_pkg_version() {
        let agent = user_agent();
        assert!(agent.starts_with("skuld/"));
        assert!(
            agent.ends_with(PKG_VERSION),
            "user agent should end with pkg version"
        );
    }
}
