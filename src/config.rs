//! Node configuration and working-directory layout.
//!
//! Everything the node needs lives under one working directory: the
//! rendered config file, the auth cookie, GeoIP data, the PID file, and one
//! subdirectory per named hidden service. [`NodeConfig`] describes how to
//! launch a node there; [`WorkDirLayout`] knows where each file goes.

use crate::error::Result;
use crate::observer::{polling_observer_factory, ObserverFactory};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const FILE_TORRC: &str = "torrc";
const FILE_PID: &str = "pid";
const FILE_GEOIP: &str = "geoip";
const FILE_GEOIP6: &str = "geoip6";
const FILE_HOSTNAME: &str = "hostname";
const FILE_PRIVATE_KEY: &str = "private_key";
const DIR_HS_ROOT: &str = "hiddenservice";
const REL_COOKIE: &str = ".tor/control_auth_cookie";

/// How to launch and supervise a node.
#[derive(Clone)]
pub struct NodeConfig {
    /// Directory owning all node state.
    pub working_dir: PathBuf,
    /// Path to the node executable.
    pub executable: PathBuf,
    /// Extra config lines rendered into the config file, in order. Keys
    /// here replace the built-in baseline values.
    pub config_overrides: Vec<(String, String)>,
    /// Bridge lines; non-empty enables bridge usage.
    pub bridges: Vec<String>,
    /// Launch attempts before giving up.
    pub attempts: u32,
    /// Deadline for one attempt, spawn to bootstrapped.
    pub attempt_timeout: Duration,
    /// How long to wait for the auth cookie to appear.
    pub cookie_timeout: Duration,
    /// How long to wait for a hidden service's hostname file.
    pub hostname_timeout: Duration,
    /// Interval between bootstrap progress probes.
    pub bootstrap_poll: Duration,
    /// Builds the file observers used for cookie and hostname waits.
    pub observer_factory: ObserverFactory,
}

impl NodeConfig {
    /// Configuration with the standard timeouts for a node binary at
    /// `executable`, keeping state under `working_dir`.
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            working_dir: working_dir.into(),
            executable: executable.into(),
            config_overrides: Vec::new(),
            bridges: Vec::new(),
            attempts: 5,
            attempt_timeout: Duration::from_secs(240),
            cookie_timeout: Duration::from_secs(10),
            hostname_timeout: Duration::from_secs(30),
            bootstrap_poll: Duration::from_secs(1),
            observer_factory: polling_observer_factory(),
        }
    }

    /// Add a config line. Later calls with the same key win.
    pub fn config_line(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_overrides.push((key.into(), value.into()));
        self
    }

    /// Add a bridge line. Lines too short to be real are dropped.
    pub fn bridge(mut self, line: impl Into<String>) -> Self {
        let line = line.into();
        if line.len() > 10 {
            self.bridges.push(line);
        }
        self
    }

    /// Set the number of launch attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the per-attempt deadline.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the cookie-file wait bound.
    pub fn cookie_timeout(mut self, timeout: Duration) -> Self {
        self.cookie_timeout = timeout;
        self
    }

    /// Set the hostname-file wait bound.
    pub fn hostname_timeout(mut self, timeout: Duration) -> Self {
        self.hostname_timeout = timeout;
        self
    }

    /// Replace the file-observer implementation.
    pub fn observer_factory(mut self, factory: ObserverFactory) -> Self {
        self.observer_factory = factory;
        self
    }

    /// The layout rooted at this config's working directory.
    pub fn layout(&self) -> WorkDirLayout {
        WorkDirLayout::new(&self.working_dir)
    }

    /// Render the complete config file contents.
    pub fn render_config(&self) -> String {
        let layout = self.layout();
        let mut lines: Vec<(String, String)> = vec![
            ("ControlPort".into(), "auto".into()),
            ("SocksPort".into(), "auto".into()),
            ("CookieAuthentication".into(), "1".into()),
            ("DisableNetwork".into(), "1".into()),
        ];
        for (key, value) in &self.config_overrides {
            match lines.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => lines.push((key.clone(), value.clone())),
            }
        }
        // Path directives always point into the working directory and are
        // not overridable.
        let fixed = [
            ("CookieAuthFile", layout.cookie_file()),
            ("DataDirectory", layout.root().to_path_buf()),
            ("GeoIPFile", layout.geoip_file()),
            ("GeoIPv6File", layout.geoip6_file()),
            ("PidFile", layout.pid_file()),
        ];
        for (key, path) in fixed {
            let rendered = path.display().to_string();
            match lines.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = rendered,
                None => lines.push((key.to_string(), rendered)),
            }
        }

        let mut out = String::new();
        for (key, value) in &lines {
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        if !self.bridges.is_empty() {
            out.push_str("UseBridges 1\n");
            for bridge in &self.bridges {
                out.push_str("Bridge ");
                out.push_str(bridge);
                out.push('\n');
            }
        }
        out
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("working_dir", &self.working_dir)
            .field("executable", &self.executable)
            .field("attempts", &self.attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// File locations under one working directory.
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    root: PathBuf,
}

impl WorkDirLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDirLayout { root: root.into() }
    }

    /// The working directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The auth cookie the node writes at startup.
    pub fn cookie_file(&self) -> PathBuf {
        self.root.join(REL_COOKIE)
    }

    /// The rendered config file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(FILE_TORRC)
    }

    /// The node's PID file.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join(FILE_PID)
    }

    /// GeoIP database for IPv4.
    pub fn geoip_file(&self) -> PathBuf {
        self.root.join(FILE_GEOIP)
    }

    /// GeoIP database for IPv6.
    pub fn geoip6_file(&self) -> PathBuf {
        self.root.join(FILE_GEOIP6)
    }

    /// Root directory holding all persistent hidden services.
    pub fn hidden_service_root(&self) -> PathBuf {
        self.root.join(DIR_HS_ROOT)
    }

    /// Directory of one named hidden service.
    pub fn hidden_service_dir(&self, name: &str) -> PathBuf {
        self.hidden_service_root().join(name)
    }

    /// `hostname` file of one named hidden service.
    pub fn hostname_file(&self, name: &str) -> PathBuf {
        self.hidden_service_dir(name).join(FILE_HOSTNAME)
    }

    /// `private_key` file of one named hidden service.
    pub fn private_key_file(&self, name: &str) -> PathBuf {
        self.hidden_service_dir(name).join(FILE_PRIVATE_KEY)
    }

    /// Create the working directory, write the config file, and pre-create
    /// an empty cookie file for the observer to watch.
    pub async fn prepare(&self, config_contents: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.config_file(), config_contents).await?;
        let cookie = self.cookie_file();
        if let Some(parent) = cookie.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !cookie.exists() {
            tokio::fs::write(&cookie, b"").await?;
        }
        Ok(())
    }

    /// Delete everything under the working directory except the hidden
    /// service root. Stale descriptor caches can keep a node from ever
    /// bootstrapping; key material must survive.
    pub async fn clear_all_but_hidden_services(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if entry.file_name() == DIR_HS_ROOT {
                    continue;
                }
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            debug!(path = %path.display(), "removed stale node state");
        }
        Ok(())
    }

    /// Create a hidden service directory with owner-only permissions where
    /// the platform supports them. The node refuses world-readable service
    /// directories.
    pub fn create_hidden_service_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.hidden_service_dir(name);
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).map_err(
                |e| {
                    crate::error::TorError::Config(format!(
                        "cannot restrict permissions on {}: {e}",
                        dir.display()
                    ))
                },
            )?;
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = WorkDirLayout::new("/work");
        assert_eq!(
            layout.cookie_file(),
            PathBuf::from("/work/.tor/control_auth_cookie")
        );
        assert_eq!(
            layout.hostname_file("svc"),
            PathBuf::from("/work/hiddenservice/svc/hostname")
        );
        assert_eq!(layout.config_file(), PathBuf::from("/work/torrc"));
    }

    #[test]
    fn rendered_config_carries_baseline_and_paths() {
        let config = NodeConfig::new("/bin/tor", "/work");
        let rendered = config.render_config();
        assert!(rendered.contains("ControlPort auto\n"));
        assert!(rendered.contains("DisableNetwork 1\n"));
        assert!(rendered.contains("DataDirectory /work\n"));
        assert!(rendered.contains("CookieAuthFile /work/.tor/control_auth_cookie\n"));
        assert!(!rendered.contains("UseBridges"));
    }

    #[test]
    fn overrides_replace_baseline_keys() {
        let config = NodeConfig::new("/bin/tor", "/work")
            .config_line("SocksPort", "19050")
            .config_line("AvoidDiskWrites", "1");
        let rendered = config.render_config();
        assert!(rendered.contains("SocksPort 19050\n"));
        assert!(!rendered.contains("SocksPort auto"));
        assert!(rendered.contains("AvoidDiskWrites 1\n"));
    }

    #[test]
    fn bridge_lines_render_and_short_ones_drop() {
        let config = NodeConfig::new("/bin/tor", "/work")
            .bridge("obfs4 192.0.2.1:443 ABCDEF cert=xyz iat-mode=0")
            .bridge("short");
        let rendered = config.render_config();
        assert!(rendered.contains("UseBridges 1\n"));
        assert!(rendered.contains("Bridge obfs4 192.0.2.1:443"));
        assert!(!rendered.contains("short"));
    }

    #[tokio::test]
    async fn clear_spares_hidden_services() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        tokio::fs::create_dir_all(layout.hidden_service_dir("svc"))
            .await
            .unwrap();
        tokio::fs::write(layout.hostname_file("svc"), "x.onion\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("cached-descriptors"), "stale")
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("diff-cache"))
            .await
            .unwrap();

        layout.clear_all_but_hidden_services().await.unwrap();

        assert!(layout.hostname_file("svc").exists());
        assert!(!dir.path().join("cached-descriptors").exists());
        assert!(!dir.path().join("diff-cache").exists());
    }

    #[tokio::test]
    async fn prepare_creates_cookie_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path().join("node"));
        layout.prepare("SocksPort auto\n").await.unwrap();
        assert!(layout.cookie_file().exists());
        assert_eq!(
            std::fs::read_to_string(layout.config_file()).unwrap(),
            "SocksPort auto\n"
        );
    }
}
