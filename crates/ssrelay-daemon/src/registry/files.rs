//! On-disk formats of a relay directory.
//!
//! `config.env` (or the older `info`) holds `KEY=VALUE` metadata and
//! `config.json` is the relay's own configuration. Relays created by the web
//! panel carry an `info.txt` of `label: value` lines instead. Reading is lenient:
//! unknown keys are ignored, and if no metadata file exists the credential
//! and backend are recovered from `config.json`.

use std::fmt::Write as _;

use serde_json::{Value, json};

use ssrelay_core::{BackendAuth, Endpoint, LifecycleState, RelayCredential, RelayRecord};

pub const CONFIG_JSON: &str = "config.json";
pub const ENV_FILE: &str = "config.env";
pub const LEGACY_INFO: &str = "info";
pub const INFO_TXT: &str = "info.txt";
pub const PID_FILE: &str = "xray.pid";
pub const LOG_FILE: &str = "xray.log";

pub const KEY_SOFT_DELETED_AT: &str = "SOFT_DELETED_AT";

/// Ordered `KEY=VALUE` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    entries: Vec<(String, String)>,
}

impl EnvFile {
    /// Blank lines, `#` comments and lines without `=` are skipped. Values may
    /// be wrapped in single or double quotes.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty value for `key`.
    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Translate an `info.txt` into metadata keys. Its creation time and
/// validity are display strings and are left out.
pub fn env_from_info_txt(content: &str) -> EnvFile {
    let mut env = EnvFile::default();
    for (key, value) in content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
    {
        match key {
            "节点名称" => env.set("NODE_NAME", value),
            "Shadowsocks密码" => env.set("PASSWORD", value),
            "加密方式" => env.set("METHOD", value),
            "SOCKS5后端" => {
                if let Some((host, port)) = value.rsplit_once(':') {
                    env.set("SOCKS_IP", host);
                    env.set("SOCKS_PORT", port);
                }
            }
            "SOCKS5认证" => {
                if let Some((user, pass)) = value.split_once(':') {
                    env.set("SOCKS_USER", user);
                    env.set("SOCKS_PASS", pass);
                }
            }
            _ => {}
        }
    }
    env
}

/// Metadata lines for `record`.
pub fn record_to_env(record: &RelayRecord, edited_at: Option<u64>) -> EnvFile {
    let mut env = EnvFile::default();
    env.set("PORT", record.port.to_string());
    env.set("PASSWORD", record.credential.secret.clone());
    env.set("METHOD", record.credential.method.as_str());
    env.set("NODE_NAME", record.label.clone());
    env.set("SOCKS_IP", record.backend.host.clone());
    env.set("SOCKS_PORT", record.backend.port.to_string());
    let (user, pass) = record
        .backend_auth
        .as_ref()
        .map_or(("", ""), |a| (a.user.as_str(), a.pass.as_str()));
    env.set("SOCKS_USER", user);
    env.set("SOCKS_PASS", pass);
    env.set("CREATED_AT", record.created_at.to_string());
    env.set("EXPIRES_AT", record.expires_at.unwrap_or(0).to_string());
    if let Some(at) = edited_at {
        env.set("EDITED_AT", at.to_string());
    }
    if let Some(at) = record.soft_deleted_at {
        env.set(KEY_SOFT_DELETED_AT, at.to_string());
    }
    env
}

/// Build a record from metadata. The directory name is authoritative for the
/// port; `fallback_created` is used when `CREATED_AT` is absent or not a unix
/// timestamp. The returned state is a placeholder for the caller to fill in.
pub fn record_from_env(port: u16, env: &EnvFile, fallback_created: u64) -> Result<RelayRecord, String> {
    let secret = env.value("PASSWORD").ok_or("missing PASSWORD")?;
    let method = env.value("METHOD").unwrap_or(ssrelay_core::model::DEFAULT_CIPHER);
    let host = env.value("SOCKS_IP").ok_or("missing SOCKS_IP")?;
    let backend_port = env
        .value("SOCKS_PORT")
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or("missing or invalid SOCKS_PORT")?;

    let backend_auth = match (env.value("SOCKS_USER"), env.value("SOCKS_PASS")) {
        (Some(user), Some(pass)) => Some(BackendAuth {
            user: user.to_string(),
            pass: pass.to_string(),
        }),
        _ => None,
    };

    Ok(RelayRecord {
        port,
        label: env
            .value("NODE_NAME")
            .map_or_else(|| default_label(port), str::to_string),
        backend: Endpoint::new(host, backend_port),
        backend_auth,
        credential: RelayCredential::new(method, secret),
        created_at: timestamp(env, "CREATED_AT").unwrap_or(fallback_created),
        expires_at: timestamp(env, "EXPIRES_AT").filter(|at| *at != 0),
        lifecycle_state: LifecycleState::Stopped,
        soft_deleted_at: timestamp(env, KEY_SOFT_DELETED_AT),
    })
}

fn timestamp(env: &EnvFile, key: &str) -> Option<u64> {
    env.value(key).and_then(|v| v.parse().ok())
}

/// Label given to relays whose metadata carries none.
pub fn default_label(port: u16) -> String {
    format!("port_{port}")
}

/// Relay configuration: one Shadowsocks inbound forwarding to one SOCKS outbound.
pub fn relay_config(record: &RelayRecord) -> Value {
    let mut server = json!({
        "address": record.backend.host,
        "port": record.backend.port,
    });
    if let Some(auth) = &record.backend_auth {
        server["users"] = json!([{ "user": auth.user, "pass": auth.pass }]);
    }
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "port": record.port,
            "protocol": "shadowsocks",
            "settings": {
                "method": record.credential.method.as_str(),
                "password": record.credential.secret,
            }
        }],
        "outbounds": [{
            "protocol": "socks",
            "settings": { "servers": [server] }
        }]
    })
}

/// Recover a record from a relay configuration alone.
pub fn record_from_relay_config(
    port: u16,
    config: &Value,
    fallback_created: u64,
) -> Result<RelayRecord, String> {
    let settings = &config["inbounds"][0]["settings"];
    let secret = settings["password"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or("config.json has no inbound password")?;
    let method = settings["method"]
        .as_str()
        .unwrap_or(ssrelay_core::model::DEFAULT_CIPHER);

    let server = &config["outbounds"][0]["settings"]["servers"][0];
    let host = server["address"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or("config.json has no outbound address")?;
    let backend_port = server["port"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or("config.json has no valid outbound port")?;
    let user = &server["users"][0];
    let backend_auth = match (user["user"].as_str(), user["pass"].as_str()) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(BackendAuth {
            user: u.to_string(),
            pass: p.to_string(),
        }),
        _ => None,
    };

    Ok(RelayRecord {
        port,
        label: default_label(port),
        backend: Endpoint::new(host, backend_port),
        backend_auth,
        credential: RelayCredential::new(method, secret),
        created_at: fallback_created,
        expires_at: None,
        lifecycle_state: LifecycleState::Stopped,
        soft_deleted_at: None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> RelayRecord {
        RelayRecord {
            port: 23456,
            label: "tokyo 1".into(),
            backend: Endpoint::new("10.0.0.2", 1080),
            backend_auth: Some(BackendAuth {
                user: "alice".into(),
                pass: "s3cret".into(),
            }),
            credential: RelayCredential::new("chacha20-ietf-poly1305", "abcdEFGH12345678"),
            created_at: 1_700_000_000,
            expires_at: Some(1_800_000_000),
            lifecycle_state: LifecycleState::Stopped,
            soft_deleted_at: None,
        }
    }

    #[test]
    fn env_parse_skips_noise() {
        let env = EnvFile::parse("# comment\n\nPORT=1\nNOEQUALS\nNAME=\"quoted value\"\nX='y'\n");
        assert_eq!(env.get("PORT"), Some("1"));
        assert_eq!(env.get("NAME"), Some("quoted value"));
        assert_eq!(env.get("X"), Some("y"));
        assert_eq!(env.get("NOEQUALS"), None);
    }

    #[test]
    fn env_set_replaces() {
        let mut env = EnvFile::parse("A=1\nB=2\n");
        env.set("A", "3");
        env.remove("B");
        assert_eq!(env.render(), "A=3\n");
    }

    #[test]
    fn record_survives_env() {
        let record = sample();
        let env = EnvFile::parse(&record_to_env(&record, Some(5)).render());
        assert_eq!(env.get("EDITED_AT"), Some("5"));
        let back = record_from_env(record.port, &env, 0).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn legacy_iso_created_at_falls_back() {
        let env = EnvFile::parse(
            "PASSWORD=p\nNODE_NAME=\nSOCKS_IP=1.1.1.1\nSOCKS_PORT=1080\nSOCKS_USER=u\nSOCKS_PASS=\nCREATED_AT=2024-05-01T10:00:00\n",
        );
        let record = record_from_env(40000, &env, 42).unwrap();
        assert_eq!(record.created_at, 42);
        assert_eq!(record.label, "port_40000");
        assert!(record.backend_auth.is_none());
        assert!(record.expires_at.is_none());
        assert_eq!(record.credential.method.as_str(), "chacha20-ietf-poly1305");
    }

    #[test]
    fn env_missing_password_is_rejected() {
        let env = EnvFile::parse("SOCKS_IP=1.1.1.1\nSOCKS_PORT=1080\n");
        assert!(record_from_env(1, &env, 0).is_err());
    }

    #[test]
    fn info_txt_is_translated() {
        let env = env_from_info_txt(
            "节点名称: 东京 01\nShadowsocks端口: 23456\nShadowsocks密码: pw:with:colons\n协议: Shadowsocks\n\
             加密方式: chacha20-ietf-poly1305\nSOCKS5后端: 10.0.0.2:1080\nSOCKS5认证: alice:s3cret\n\
             创建时间: 2024-05-01 10:00:00\n有效期: 永久\n",
        );
        let record = record_from_env(23456, &env, 9).unwrap();
        assert_eq!(record.label, "东京 01");
        assert_eq!(record.credential.secret, "pw:with:colons");
        assert_eq!(record.backend, Endpoint::new("10.0.0.2", 1080));
        assert_eq!(record.backend_auth.unwrap().user, "alice");
        assert_eq!(record.created_at, 9);
    }

    #[test]
    fn info_txt_without_auth() {
        let env = env_from_info_txt("Shadowsocks密码: pw\nSOCKS5后端: 1.1.1.1:1080\nSOCKS5认证: 无\n");
        let record = record_from_env(1, &env, 0).unwrap();
        assert!(record.backend_auth.is_none());
        assert_eq!(record.label, "port_1");
    }

    #[test]
    fn relay_config_shape() {
        let mut record = sample();
        let config = relay_config(&record);
        assert_eq!(config["inbounds"][0]["port"], 23456);
        assert_eq!(config["inbounds"][0]["protocol"], "shadowsocks");
        assert_eq!(config["outbounds"][0]["protocol"], "socks");
        assert_eq!(
            config["outbounds"][0]["settings"]["servers"][0]["users"][0]["user"],
            "alice"
        );

        record.backend_auth = None;
        let config = relay_config(&record);
        assert!(config["outbounds"][0]["settings"]["servers"][0].get("users").is_none());
    }

    #[test]
    fn record_recovered_from_relay_config() {
        let record = sample();
        let recovered = record_from_relay_config(record.port, &relay_config(&record), 7).unwrap();
        assert_eq!(recovered.credential, record.credential);
        assert_eq!(recovered.backend, record.backend);
        assert_eq!(recovered.backend_auth, record.backend_auth);
        assert_eq!(recovered.created_at, 7);
    }
}
