use bloodlink_core::config::ENV_PREFIX;
use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;

/// Server-level settings, read from the `[server]` table of the same file
/// and environment (`BLOODLINK__SERVER__PORT=8080`) as the security settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// HS256 signing secret. A random per-process secret is used when unset.
    pub jwt_secret: Option<SecretString>,
    pub token_ttl_secs: i64,
    /// Take the client IP from `X-Forwarded-For` instead of the socket.
    pub trust_proxy: bool,
    pub max_body_bytes: usize,
    pub session_cookie: String,
    pub secure_cookies: bool,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<SecretString>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            log_level: "info".to_string(),
            jwt_secret: None,
            token_ttl_secs: 60 * 60,
            trust_proxy: false,
            max_body_bytes: 1024 * 1024,
            session_cookie: "bl_session".to_string(),
            secure_cookies: true,
            bootstrap_admin_email: None,
            bootstrap_admin_password: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Root {
    server: ServerSettings,
}

impl ServerSettings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let root: Root = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(root.server)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = ServerSettings::load(None).unwrap();
        assert_eq!(settings.session_cookie, "bl_session");
        assert!(settings.secure_cookies);
    }

    #[test]
    fn test_server_table_is_read_from_file() {
        let dir = std::env::temp_dir().join(format!("bloodlink-server-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bloodlink.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"0.0.0.0\"\nport = 8088\ntrust_proxy = true\n\n[lockout]\nthreshold = 3\n",
        )
        .unwrap();

        let settings = ServerSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.bind_address(), "0.0.0.0:8088");
        assert!(settings.trust_proxy);
        assert_eq!(settings.token_ttl_secs, 3600);

        std::fs::remove_dir_all(dir).ok();
    }
}
