//! Server configuration
//!
//! The server is configured from a JSON file (usually written by
//! `warden-sds init`). TCP listeners require TLS material and optionally pin
//! the authorized client; UNIX domain sockets skip transport authentication.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration used to initialize the SDS service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener network: tcp, tcp4, tcp6, unix or unixpacket
    pub network: String,
    /// Listen address (host:port) or socket path
    pub address: String,
    /// Root CA bundle used to verify client certificates (TCP mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Server TLS certificate (TCP mode)
    #[serde(rename = "crt", default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,
    /// Server TLS certificate key (TCP mode)
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<PathBuf>,
    /// Password decrypting the server key, if encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Common name the client certificate must present
    #[serde(rename = "authorizedIdentity", default, skip_serializing_if = "Option::is_none")]
    pub authorized_identity: Option<String>,
    /// SHA-256 fingerprint the client certificate must match
    #[serde(rename = "authorizedFingerprint", default, skip_serializing_if = "Option::is_none")]
    pub authorized_fingerprint: Option<String>,
    /// Upstream CA provisioner credential
    pub provisioner: ProvisionerConfig,
    /// Free-form logger settings (format, trace header)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub logger: serde_json::Value,
}

impl Config {
    /// Returns true if the network is tcp, tcp4, or tcp6.
    pub fn is_tcp(&self) -> bool {
        matches!(self.network.as_str(), "tcp" | "tcp4" | "tcp6")
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.network.is_empty() {
            return Err(Error::config("network cannot be empty"));
        }
        if self.address.is_empty() {
            return Err(Error::config("address cannot be empty"));
        }
        if !self.is_tcp() && self.network != "unix" && self.network != "unixpacket" {
            return Err(Error::config(format!(
                "invalid value \"{}\" for \"network\", options are tcp, tcp4, tcp6, unix or unixpacket",
                self.network
            )));
        }
        if self.is_tcp() {
            // root can be empty if the client certs are trusted by the system
            if self.certificate.is_none() {
                return Err(Error::config(format!(
                    "crt cannot be empty if network is {}",
                    self.network
                )));
            }
            if self.certificate_key.is_none() {
                return Err(Error::config(format!(
                    "key cannot be empty if network is {}",
                    self.network
                )));
            }
        }
        self.provisioner.validate()
    }

    /// Parses the given file as JSON and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("error opening {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("error parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration used to initialize the CA provisioner
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvisionerConfig {
    /// Provisioner name, used as the token issuer
    pub issuer: String,
    /// Key identifier of the provisioner signing key
    #[serde(rename = "kid")]
    pub key_id: String,
    /// Password decrypting the provisioner signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Base URL of the upstream certificate authority
    #[serde(rename = "ca-url")]
    pub ca_url: String,
    /// Path to the PEM root certificate pinning the CA
    #[serde(rename = "root")]
    pub ca_root: PathBuf,
    /// Path to the PEM provisioner signing key
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

impl ProvisionerConfig {
    /// Validates the provisioner configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.issuer.is_empty() {
            return Err(Error::config("provisioner.issuer cannot be empty"));
        }
        if self.key_id.is_empty() {
            return Err(Error::config("provisioner.kid cannot be empty"));
        }
        if self.ca_url.is_empty() {
            return Err(Error::config("provisioner.ca-url cannot be empty"));
        }
        if self.ca_root.as_os_str().is_empty() {
            return Err(Error::config("provisioner.root cannot be empty"));
        }
        match &self.key {
            None => Err(Error::config("provisioner.key cannot be empty")),
            Some(key) if key.as_os_str().is_empty() => {
                Err(Error::config("provisioner.key cannot be empty"))
            }
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner() -> ProvisionerConfig {
        ProvisionerConfig {
            issuer: "sds@example.com".to_string(),
            key_id: "oA1x2nV3yClaf2kQdPOJ_LEzTGw5ow4r2A5SWl3MfMg".to_string(),
            password: Some("password".to_string()),
            ca_url: "https://ca.example.com".to_string(),
            ca_root: PathBuf::from("testdata/root_ca.crt"),
            key: Some(PathBuf::from("testdata/provisioner_key")),
        }
    }

    fn tcp_config() -> Config {
        Config {
            network: "tcp".to_string(),
            address: "127.0.0.1:8443".to_string(),
            root: Some(PathBuf::from("testdata/root_ca.crt")),
            certificate: Some(PathBuf::from("testdata/sds_server.crt")),
            certificate_key: Some(PathBuf::from("testdata/sds_server_key")),
            provisioner: provisioner(),
            ..Default::default()
        }
    }

    #[test]
    fn network_kinds() {
        for network in ["tcp", "tcp4", "tcp6"] {
            let mut c = tcp_config();
            c.network = network.to_string();
            assert!(c.is_tcp());
            assert!(c.validate().is_ok());
        }
        for network in ["unix", "unixpacket"] {
            let c = Config {
                network: network.to_string(),
                address: "/tmp/sds.sock".to_string(),
                provisioner: provisioner(),
                ..Default::default()
            };
            assert!(!c.is_tcp());
            assert!(c.validate().is_ok());
        }
    }

    #[test]
    fn validation_failures() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("network", Box::new(|c| c.network.clear())),
            ("address", Box::new(|c| c.address.clear())),
            ("network", Box::new(|c| c.network = "udp".to_string())),
            ("crt", Box::new(|c| c.certificate = None)),
            ("key", Box::new(|c| c.certificate_key = None)),
            ("provisioner.issuer", Box::new(|c| c.provisioner.issuer.clear())),
            ("provisioner.kid", Box::new(|c| c.provisioner.key_id.clear())),
            ("provisioner.ca-url", Box::new(|c| c.provisioner.ca_url.clear())),
            ("provisioner.root", Box::new(|c| c.provisioner.ca_root = PathBuf::new())),
            ("provisioner.key", Box::new(|c| c.provisioner.key = None)),
        ];
        for (want, mutate) in cases {
            let mut c = tcp_config();
            mutate(&mut c);
            let err = c.validate().expect_err(want).to_string();
            assert!(err.contains(want), "error {err:?} should mention {want}");
        }
    }

    #[test]
    fn uds_does_not_require_tls_material() {
        let c = Config {
            network: "unix".to_string(),
            address: "/tmp/sds.sock".to_string(),
            provisioner: provisioner(),
            ..Default::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parses_persisted_json() {
        let raw = r#"{
            "network": "tcp",
            "address": "127.0.0.1:8443",
            "root": "secrets/root_ca.crt",
            "crt": "secrets/sds_server.crt",
            "key": "secrets/sds_server_key",
            "authorizedIdentity": "envoy.example.com",
            "authorizedFingerprint": "ab12",
            "provisioner": {
                "issuer": "sds@example.com",
                "kid": "kid-value",
                "ca-url": "https://ca.example.com",
                "root": "secrets/ca_root.crt",
                "key": "secrets/provisioner_key",
                "password": "secret"
            },
            "logger": {"format": "json"}
        }"#;
        let c: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(c.certificate, Some(PathBuf::from("secrets/sds_server.crt")));
        assert_eq!(c.authorized_identity.as_deref(), Some("envoy.example.com"));
        assert_eq!(c.provisioner.ca_url, "https://ca.example.com");
        assert_eq!(c.provisioner.key_id, "kid-value");
        assert_eq!(c.logger["format"], "json");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("testdata/does-not-exist.json").unwrap_err();
        assert!(err.to_string().contains("does-not-exist.json"));
    }
}
