use backend_core::ConnectionMode;

pub const DEFAULT_BRIDGE_URL: &str = "http://localhost:8080";
pub const DEFAULT_ORIGIN_SCHEME: &str = "https";

/// Maps a connection mode to the address a protocol handle is built against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEndpoints {
    bridge_url: String,
    origin_scheme: String,
}

impl Default for TransportEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_URL, DEFAULT_ORIGIN_SCHEME)
    }
}

impl TransportEndpoints {
    pub fn new(bridge_url: impl Into<String>, origin_scheme: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into().trim_end_matches('/').to_owned(),
            origin_scheme: origin_scheme.into(),
        }
    }

    pub fn bridge_url(&self) -> &str {
        &self.bridge_url
    }

    /// Enhanced handles address the overlay-aware bridge; standard ones the origin server.
    pub fn base_url_for(&self, mode: ConnectionMode, server_name: &str) -> String {
        match mode {
            ConnectionMode::Enhanced => self.bridge_url.clone(),
            ConnectionMode::Standard => self.origin_url(server_name),
        }
    }

    fn origin_url(&self, server_name: &str) -> String {
        let server_name = server_name.trim().trim_end_matches('/');
        if server_name.contains("://") {
            server_name.to_owned()
        } else {
            format!("{}://{server_name}", self.origin_scheme)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_mode_uses_bridge() {
        let endpoints = TransportEndpoints::new("http://localhost:8080/", "https");
        assert_eq!(
            endpoints.base_url_for(ConnectionMode::Enhanced, "matrix.org"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn standard_mode_uses_origin_server() {
        let endpoints = TransportEndpoints::default();
        assert_eq!(
            endpoints.base_url_for(ConnectionMode::Standard, "matrix.org"),
            "https://matrix.org"
        );
        assert_eq!(
            endpoints.base_url_for(ConnectionMode::Standard, "http://127.0.0.1:8008/"),
            "http://127.0.0.1:8008"
        );
    }
}
