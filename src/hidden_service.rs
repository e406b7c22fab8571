//! Hidden-service publication.
//!
//! Two mechanisms, chosen by the caller ([`HsVariant`]): the ephemeral
//! variant asks the node to create a service in memory and returns the
//! generated address at once; the persistent variant installs
//! `HiddenServiceDir`/`HiddenServicePort` directives in the live
//! configuration and waits for the node to materialize the service
//! directory, so the key material survives restarts.
//!
//! All functions here run under the session lock: publication is a
//! read-modify-write of one shared configuration list.

use crate::client::ControlClient;
use crate::config::WorkDirLayout;
use crate::error::{Result, TorError};
use crate::events::HS_EVENTS;
use crate::observer::ObserverFactory;
use crate::types::{ConfigEntry, HiddenServiceRecord, HsVariant, OnionAddress};
use std::time::Duration;
use tracing::{debug, info};

const HS_OPTIONS: &str = "HiddenServiceOptions";
const HS_DIR: &str = "HiddenServiceDir";
const HS_PORT: &str = "HiddenServicePort";

/// What publication needs besides the control client.
pub(crate) struct HsEnvironment<'a> {
    /// Working-directory layout; `None` for attached sessions without one.
    pub layout: Option<&'a WorkDirLayout>,
    /// Observer factory for the hostname wait.
    pub observer_factory: &'a ObserverFactory,
    /// Bound on the hostname wait.
    pub hostname_timeout: Duration,
}

/// Publish a service and return its record. The caller adds the record to
/// the active set and registers any ready-callbacks.
pub(crate) async fn publish(
    client: &mut ControlClient,
    env: &HsEnvironment<'_>,
    name: &str,
    variant: HsVariant,
    service_port: u16,
    local_port: u16,
) -> Result<HiddenServiceRecord> {
    // Reachability is reported through descriptor-upload events.
    client.set_events(HS_EVENTS).await?;
    match variant {
        HsVariant::Ephemeral => {
            publish_ephemeral(client, env, name, service_port, local_port).await
        }
        HsVariant::Persistent => {
            publish_persistent(client, env, name, service_port, local_port).await
        }
    }
}

async fn publish_ephemeral(
    client: &mut ControlClient,
    env: &HsEnvironment<'_>,
    name: &str,
    service_port: u16,
    local_port: u16,
) -> Result<HiddenServiceRecord> {
    // A key persisted by an earlier run of the same service is reused, so
    // the address stays stable across restarts.
    let stored_key = match env.layout {
        Some(layout) => {
            let key_file = layout.private_key_file(name);
            match std::fs::read_to_string(&key_file) {
                Ok(key) => Some(key.trim().to_string()),
                Err(_) => None,
            }
        }
        None => None,
    };

    let (service_id, generated_key) = client
        .add_onion(service_port, local_port, stored_key.as_deref())
        .await?;
    let address = OnionAddress::from_service_id(&service_id);
    info!(%address, "ephemeral hidden service created");

    if let (Some(layout), Some(key)) = (env.layout, &generated_key) {
        persist_key_material(layout, name, &address, key)?;
    }

    Ok(HiddenServiceRecord {
        name: name.to_string(),
        address,
        service_port,
        local_port,
        variant: HsVariant::Ephemeral,
        directory: env.layout.map(|l| l.hidden_service_dir(name)),
        private_key: generated_key.or(stored_key),
    })
}

fn persist_key_material(
    layout: &WorkDirLayout,
    name: &str,
    address: &OnionAddress,
    key: &str,
) -> Result<()> {
    layout.create_hidden_service_dir(name)?;
    std::fs::write(layout.hostname_file(name), format!("{address}\n"))?;
    std::fs::write(layout.private_key_file(name), format!("{key}\n"))?;
    Ok(())
}

async fn publish_persistent(
    client: &mut ControlClient,
    env: &HsEnvironment<'_>,
    name: &str,
    service_port: u16,
    local_port: u16,
) -> Result<HiddenServiceRecord> {
    let layout = env.layout.ok_or_else(|| {
        TorError::Config("persistent hidden services need a working directory".into())
    })?;
    let dir = layout.hidden_service_dir(name);
    let dir_str = dir.display().to_string();

    let entries = client.get_conf(HS_OPTIONS).await?;
    let mut directives = service_directives(&entries);
    if directives.iter().any(|(k, v)| k == HS_DIR && *v == dir_str) {
        return Err(TorError::Conflict(format!(
            "hidden service {dir_str} is already published"
        )));
    }

    layout.create_hidden_service_dir(name)?;
    let hostname_file = layout.hostname_file(name);

    // A directory left over from a previous run already has its address on
    // disk; re-installing the directives is enough, no wait needed.
    let existing = std::fs::read_to_string(&hostname_file)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && layout.private_key_file(name).exists());

    directives.push((HS_DIR.to_string(), dir_str));
    directives.push((
        HS_PORT.to_string(),
        format!("{service_port} 127.0.0.1:{local_port}"),
    ));

    let address = match existing {
        Some(hostname) => {
            debug!(name, "reusing hidden service key material");
            client.set_conf(&directives).await?;
            client.save_conf().await?;
            OnionAddress::from_hostname(&hostname)
        }
        None => {
            // Pre-create the file so the observer has a baseline, then
            // watch it while the node provisions the directory.
            if !hostname_file.exists() {
                std::fs::write(&hostname_file, b"")?;
            }
            let mut observer = (env.observer_factory)(&hostname_file)?;
            client.set_conf(&directives).await?;
            client.save_conf().await?;
            if !observer.poll(env.hostname_timeout).await? {
                return Err(TorError::Timeout("hidden service hostname file"));
            }
            let hostname = std::fs::read_to_string(&hostname_file)?;
            OnionAddress::from_hostname(&hostname)
        }
    };

    info!(%address, name, "hidden service published");
    Ok(HiddenServiceRecord {
        name: name.to_string(),
        address,
        service_port,
        local_port,
        variant: HsVariant::Persistent,
        directory: Some(dir),
        private_key: None,
    })
}

/// Remove a published service. The caller drops the record from the active
/// set only when this returns `Ok`.
pub(crate) async fn unpublish(
    client: &mut ControlClient,
    env: &HsEnvironment<'_>,
    record: &HiddenServiceRecord,
) -> Result<()> {
    match record.variant {
        HsVariant::Ephemeral => client.del_onion(record.address.service_id()).await,
        HsVariant::Persistent => {
            let layout = env.layout.ok_or_else(|| {
                TorError::Config("persistent hidden services need a working directory".into())
            })?;
            let dir_str = layout.hidden_service_dir(&record.name).display().to_string();
            let entries = client.get_conf(HS_OPTIONS).await?;
            let (remaining, found) = without_service(&service_directives(&entries), &dir_str);
            if !found {
                debug!(name = %record.name, "service not in live config, nothing to remove");
                return Ok(());
            }
            if remaining.is_empty() {
                client.reset_conf(&[HS_DIR, HS_PORT]).await?;
            } else {
                client.set_conf(&remaining).await?;
            }
            client.save_conf().await?;
            Ok(())
        }
    }
}

/// The non-empty directive pairs from a GETCONF reply. A bare key line
/// means the option group is unset.
fn service_directives(entries: &[ConfigEntry]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter(|e| e.value.is_some())
        .map(ConfigEntry::to_directive)
        .collect()
}

/// Drop the directory line matching `dir` and the port line immediately
/// following it. Returns the remaining directives and whether a match was
/// removed.
fn without_service(
    directives: &[(String, String)],
    dir: &str,
) -> (Vec<(String, String)>, bool) {
    let mut remaining = Vec::with_capacity(directives.len());
    let mut found = false;
    let mut skip_next_port = false;
    for (key, value) in directives {
        if skip_next_port {
            skip_next_port = false;
            if key == HS_PORT {
                continue;
            }
        }
        if key == HS_DIR && value == dir {
            found = true;
            skip_next_port = true;
            continue;
        }
        remaining.push((key.clone(), value.clone()));
    }
    (remaining, found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> ConfigEntry {
        ConfigEntry {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    #[test]
    fn directive_extraction_skips_bare_keys() {
        let entries = vec![
            ConfigEntry {
                key: HS_OPTIONS.into(),
                value: None,
            },
            entry(HS_DIR, "/w/hiddenservice/a"),
            entry(HS_PORT, "80 127.0.0.1:8080"),
        ];
        let directives = service_directives(&entries);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].0, HS_DIR);
    }

    #[test]
    fn removal_takes_dir_and_following_port() {
        let directives = vec![
            (HS_DIR.to_string(), "/w/hiddenservice/a".to_string()),
            (HS_PORT.to_string(), "80 127.0.0.1:8080".to_string()),
            (HS_DIR.to_string(), "/w/hiddenservice/b".to_string()),
            (HS_PORT.to_string(), "81 127.0.0.1:8081".to_string()),
        ];
        let (remaining, found) = without_service(&directives, "/w/hiddenservice/a");
        assert!(found);
        assert_eq!(
            remaining,
            vec![
                (HS_DIR.to_string(), "/w/hiddenservice/b".to_string()),
                (HS_PORT.to_string(), "81 127.0.0.1:8081".to_string()),
            ]
        );
    }

    #[test]
    fn removal_of_unknown_dir_changes_nothing() {
        let directives = vec![
            (HS_DIR.to_string(), "/w/hiddenservice/a".to_string()),
            (HS_PORT.to_string(), "80 127.0.0.1:8080".to_string()),
        ];
        let (remaining, found) = without_service(&directives, "/w/hiddenservice/zzz");
        assert!(!found);
        assert_eq!(remaining, directives);
    }

    #[test]
    fn removal_of_last_service_leaves_empty_list() {
        let directives = vec![
            (HS_DIR.to_string(), "/w/hiddenservice/only".to_string()),
            (HS_PORT.to_string(), "80 127.0.0.1:8080".to_string()),
        ];
        let (remaining, found) = without_service(&directives, "/w/hiddenservice/only");
        assert!(found);
        assert!(remaining.is_empty());
    }
}
