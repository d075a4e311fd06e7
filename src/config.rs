use crate::prelude::*;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Populated once at startup from the environment. There is no
/// process-wide mutable state beyond this struct, the token cache, and the
/// scheduler's in-flight table.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: PathBuf,
    pub max_concurrent_jobs: usize,
    pub bisect_timeout: Duration,
    pub sandbox_image: String,
    pub forge_app_id: String,
    pub forge_private_key_path: PathBuf,
    pub forge_webhook_secret: String,
    pub encryption_key: Option<String>,

    // Derived tuning constants, independently overridable for tests but
    // otherwise fixed at their defaults.
    pub heartbeat_interval: Duration,
    pub recovery_interval: Duration,
    pub pending_grace: Duration,
    pub heartbeat_stale_after: Duration,
    pub progress_min_interval: Duration,
    pub bind_addr: std::net::SocketAddr,
}

pub const MAX_ATTEMPTS: i64 = 3;

fn env_var(name: &str) -> Fallible<String> {
    env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn env_var_opt(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Fallible<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid value for {name}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> Fallible<Self> {
        let database_url = PathBuf::from(env_var("DATABASE_URL")?);
        let max_concurrent_jobs = env_parse("MAX_CONCURRENT_JOBS", 4usize)?;
        let bisect_timeout = Duration::from_secs(env_parse("BISECT_TIMEOUT_SECONDS", 1800u64)?);
        let sandbox_image = env_var("SANDBOX_IMAGE")?;
        let forge_app_id = env_var("FORGE_APP_ID")?;
        let forge_private_key_path = PathBuf::from(env_var("FORGE_PRIVATE_KEY_PATH")?);
        let forge_webhook_secret = env_var("FORGE_WEBHOOK_SECRET")?;
        let encryption_key = env_var_opt("ENCRYPTION_KEY");
        let bind_addr = env_parse("BIND_ADDR", "0.0.0.0:8080".to_string())?
            .parse()
            .context("invalid BIND_ADDR")?;

        let config = Config {
            database_url,
            max_concurrent_jobs,
            bisect_timeout,
            sandbox_image,
            forge_app_id,
            forge_private_key_path,
            forge_webhook_secret,
            encryption_key,
            heartbeat_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            pending_grace: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(5 * 60),
            progress_min_interval: Duration::from_secs(5),
            bind_addr,
        };

        config.check()?;
        Ok(config)
    }

    /// Fail fast at startup on configuration that would otherwise surface as
    /// a confusing runtime error much later.
    fn check(&self) -> Fallible<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("MAX_CONCURRENT_JOBS must be at least 1");
        }

        if !self.forge_private_key_path.exists() {
            bail!(
                "FORGE_PRIVATE_KEY_PATH {} does not exist",
                self.forge_private_key_path.display()
            );
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = self.forge_private_key_path.metadata()?.permissions().mode();
            if mode & 0o077 != 0 {
                bail!(
                    "FORGE_PRIVATE_KEY_PATH {} must not be readable by group or other (mode 0600)",
                    self.forge_private_key_path.display()
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_concurrency() {
        let mut cfg = test_config();
        cfg.max_concurrent_jobs = 0;
        assert!(cfg.check().is_err());
    }

    #[test]
    fn accepts_sane_defaults() {
        let cfg = test_config();
        assert!(cfg.check().is_ok());
    }

    pub(crate) fn test_config() -> Config {
        let key = tempfile::NamedTempFile::new().unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        // Leak the tempfile for the duration of the test process; tests are
        // short-lived and this avoids fighting the borrow checker over a
        // `Config` that outlives the guard.
        let path = key.path().to_path_buf();
        std::mem::forget(key);

        Config {
            database_url: PathBuf::from(":memory:"),
            max_concurrent_jobs: 4,
            bisect_timeout: Duration::from_secs(1800),
            sandbox_image: "bisect-sandbox:latest".into(),
            forge_app_id: "123".into(),
            forge_private_key_path: path,
            forge_webhook_secret: "secret".into(),
            encryption_key: None,
            heartbeat_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            pending_grace: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(5 * 60),
            progress_min_interval: Duration::from_secs(5),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }
}
