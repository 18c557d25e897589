use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub store: StoreBackend,
    pub db_url: Option<String>,
    pub policy_keys: PolicyKeySource,
    pub key_server: String,
    pub format_version: String,
    pub store_timeout_ms: u64,
    pub crypto_workers: usize,
    pub max_payload_bytes: usize,
    pub problem_base_uri: String,
    pub events_api_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Where policy key material comes from. Hex strings are kept out of
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub enum PolicyKeySource {
    SigningSeedHex(String),
    VerifyingKeyHex(String),
    Ephemeral,
}

impl std::fmt::Debug for PolicyKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKeySource::SigningSeedHex(_) => write!(f, "SigningSeedHex(<redacted>)"),
            PolicyKeySource::VerifyingKeyHex(hex) => write!(f, "VerifyingKeyHex({})", hex),
            PolicyKeySource::Ephemeral => write!(f, "Ephemeral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("AIRLOCK_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("AIRLOCK_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "AIRLOCK_BIND_ADDR",
        )?;

        let allow_nonlocal_bind = parse_bool(kv.get("AIRLOCK_ALLOW_NONLOCAL_BIND")).unwrap_or(false);
        if !bind_addr.ip().is_loopback() && !allow_nonlocal_bind {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REFUSED",
                message: "non-local bind requires AIRLOCK_ALLOW_NONLOCAL_BIND=true; refuse startup"
                    .to_string(),
            });
        }

        let store = parse_store_backend(kv.get("AIRLOCK_STORE"))?;
        let db_url = match store {
            StoreBackend::Postgres => Some(require_nonempty(kv, "AIRLOCK_DB_URL")?),
            StoreBackend::Memory => optional(kv, "AIRLOCK_DB_URL"),
        };

        let policy_keys = parse_policy_keys(kv)?;

        let key_server = optional(kv, "AIRLOCK_KEY_SERVER")
            .unwrap_or_else(|| format!("http://{}", bind_addr))
            .trim_end_matches('/')
            .to_string();
        if !(key_server.starts_with("http://") || key_server.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "AIRLOCK_KEY_SERVER must be an http(s) URL".to_string(),
            });
        }

        let format_version =
            optional(kv, "AIRLOCK_FORMAT_VERSION").unwrap_or_else(|| "1".to_string());

        let store_timeout_ms = parse_u64(
            kv.get("AIRLOCK_STORE_TIMEOUT_MS"),
            2000,
            "AIRLOCK_STORE_TIMEOUT_MS",
        )?;
        if store_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "AIRLOCK_STORE_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let crypto_workers = parse_usize(
            kv.get("AIRLOCK_CRYPTO_WORKERS"),
            4,
            "AIRLOCK_CRYPTO_WORKERS",
        )?;
        if !(1..=64).contains(&crypto_workers) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "AIRLOCK_CRYPTO_WORKERS must be between 1 and 64".to_string(),
            });
        }

        let max_payload_bytes = parse_usize(
            kv.get("AIRLOCK_MAX_PAYLOAD_BYTES"),
            1024 * 1024,
            "AIRLOCK_MAX_PAYLOAD_BYTES",
        )?;
        if max_payload_bytes == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "AIRLOCK_MAX_PAYLOAD_BYTES must be >= 1".to_string(),
            });
        }

        let problem_base_uri = optional(kv, "AIRLOCK_PROBLEM_BASE_URI")
            .unwrap_or_else(|| "/probs".to_string())
            .trim_end_matches('/')
            .to_string();

        let events_api_enabled = match kv.get("AIRLOCK_EVENTS_API_ENABLED") {
            None => true,
            Some(raw) if raw.trim().is_empty() => true,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "AIRLOCK_EVENTS_API_ENABLED must be a boolean".to_string(),
            })?,
        };

        Ok(Self {
            bind_addr,
            store,
            db_url,
            policy_keys,
            key_server,
            format_version,
            store_timeout_ms,
            crypto_workers,
            max_payload_bytes,
            problem_base_uri,
            events_api_enabled,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn key_uri(&self, key_id: &str) -> String {
        format!("{}/keys/{}", self.key_server, key_id)
    }

    pub fn problem_type(&self, slug: &str) -> String {
        format!("{}/{}", self.problem_base_uri, slug)
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_store_backend(value: Option<&String>) -> Result<StoreBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("memory");

    match backend {
        "memory" => Ok(StoreBackend::Memory),
        "postgres" => Ok(StoreBackend::Postgres),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "AIRLOCK_STORE must be memory or postgres".to_string(),
        }),
    }
}

fn parse_policy_keys(kv: &HashMap<String, String>) -> Result<PolicyKeySource, StartupError> {
    let signing = optional(kv, "AIRLOCK_SIGNING_KEY_HEX");
    let verifying = optional(kv, "AIRLOCK_VERIFYING_KEY_HEX");

    match (signing, verifying) {
        (Some(_), Some(_)) => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "set only one of AIRLOCK_SIGNING_KEY_HEX or AIRLOCK_VERIFYING_KEY_HEX"
                .to_string(),
        }),
        (Some(seed), None) => {
            if !is_hex_of_len(&seed, 64) {
                return Err(StartupError {
                    code: "ERR_INVALID_SIGNING_KEY",
                    message: "AIRLOCK_SIGNING_KEY_HEX must be 64 hex chars".to_string(),
                });
            }
            Ok(PolicyKeySource::SigningSeedHex(seed))
        }
        (None, Some(public)) => {
            if !is_hex_of_len(&public, 64) {
                return Err(StartupError {
                    code: "ERR_INVALID_VERIFYING_KEY",
                    message: "AIRLOCK_VERIFYING_KEY_HEX must be 64 hex chars".to_string(),
                });
            }
            Ok(PolicyKeySource::VerifyingKeyHex(public))
        }
        (None, None) => Ok(PolicyKeySource::Ephemeral),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_local_and_in_memory() {
        let cfg = GatewayConfig::from_kv(&HashMap::new()).expect("defaults should load");
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080".parse().expect("addr"));
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.policy_keys, PolicyKeySource::Ephemeral);
        assert_eq!(cfg.key_server, "http://127.0.0.1:8080");
        assert_eq!(cfg.format_version, "1");
        assert_eq!(cfg.store_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.crypto_workers, 4);
        assert!(cfg.events_api_enabled);
        assert_eq!(cfg.key_uri("01ABC"), "http://127.0.0.1:8080/keys/01ABC");
        assert_eq!(cfg.problem_type("policy-validation"), "/probs/policy-validation");
    }

    #[test]
    fn non_local_bind_requires_opt_in() {
        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_BIND_ADDR", "0.0.0.0:8080")]))
            .unwrap_err();
        assert_eq!(err.code, "ERR_NONLOCAL_BIND_REFUSED");

        let cfg = GatewayConfig::from_kv(&env(&[
            ("AIRLOCK_BIND_ADDR", "0.0.0.0:8080"),
            ("AIRLOCK_ALLOW_NONLOCAL_BIND", "true"),
        ]))
        .expect("opt-in should allow non-local bind");
        assert!(!cfg.bind_addr.ip().is_loopback());
    }

    #[test]
    fn postgres_store_requires_db_url() {
        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_STORE", "postgres")])).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");

        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_STORE", "sqlite")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn key_material_is_validated_and_redacted() {
        let seed = "ab".repeat(32);
        let cfg = GatewayConfig::from_kv(&env(&[("AIRLOCK_SIGNING_KEY_HEX", seed.as_str())]))
            .expect("seed should load");
        assert!(!format!("{:?}", cfg).contains(seed.as_str()));

        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_SIGNING_KEY_HEX", "abc")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_SIGNING_KEY");

        let err = GatewayConfig::from_kv(&env(&[
            ("AIRLOCK_SIGNING_KEY_HEX", seed.as_str()),
            ("AIRLOCK_VERIFYING_KEY_HEX", seed.as_str()),
        ]))
        .unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn numeric_limits_are_enforced() {
        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_CRYPTO_WORKERS", "0")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_CRYPTO_WORKERS", "65")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
        let err =
            GatewayConfig::from_kv(&env(&[("AIRLOCK_STORE_TIMEOUT_MS", "soon")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn key_server_and_events_switch_are_configurable() {
        let cfg = GatewayConfig::from_kv(&env(&[
            ("AIRLOCK_KEY_SERVER", "https://keys.example.test/"),
            ("AIRLOCK_EVENTS_API_ENABLED", "false"),
            ("AIRLOCK_PROBLEM_BASE_URI", "https://airlock.example.test/probs/"),
        ]))
        .expect("config should load");
        assert_eq!(cfg.key_uri("k1"), "https://keys.example.test/keys/k1");
        assert!(!cfg.events_api_enabled);
        assert_eq!(
            cfg.problem_type("policy-claim-verification"),
            "https://airlock.example.test/probs/policy-claim-verification"
        );

        let err = GatewayConfig::from_kv(&env(&[("AIRLOCK_KEY_SERVER", "ftp://x")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn env_file_lines_are_parsed_with_quotes() {
        let path = std::env::temp_dir().join(format!("airlock-config-{}.env", std::process::id()));
        std::fs::write(
            &path,
            "# comment\nAIRLOCK_FORMAT_VERSION=\"2\"\n\nAIRLOCK_STORE='memory'\n",
        )
        .expect("write temp config");

        let kv = parse_env_file(path.to_str().expect("utf-8 path")).expect("file should parse");
        let _ = std::fs::remove_file(&path);
        assert_eq!(kv.get("AIRLOCK_FORMAT_VERSION").map(String::as_str), Some("2"));
        assert_eq!(kv.get("AIRLOCK_STORE").map(String::as_str), Some("memory"));
    }
}
