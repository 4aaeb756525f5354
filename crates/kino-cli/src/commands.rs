//! CLI command implementations

use crate::output::{format_output, Report};
use anyhow::{bail, Context};
use bytes::Bytes;
use kino_protection::{
    memory::{InMemoryKeyStore, InMemoryPlatform, SessionBehavior},
    EventReceiver, KeySystem, KeySystemNegotiator, ProtectionConfig, ProtectionEvent, ProtectionModel, SessionType,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct NegotiationReport {
    attempts: Vec<String>,
    selected: Option<String>,
    error: Option<String>,
}

impl Report for NegotiationReport {
    fn text_lines(&self) -> Vec<String> {
        let mut lines = vec!["Negotiation:".to_string()];
        for (i, attempt) in self.attempts.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, attempt));
        }
        match (&self.selected, &self.error) {
            (Some(selected), _) => lines.push(format!("Selected: {selected}")),
            (None, Some(error)) => lines.push(format!("Failed: {error}")),
            (None, None) => {}
        }
        lines
    }
}

#[derive(Serialize)]
struct EventLine {
    topic: &'static str,
    detail: String,
    error: Option<String>,
}

#[derive(Serialize)]
struct LifecycleReport {
    key_system: String,
    events: Vec<EventLine>,
}

impl Report for LifecycleReport {
    fn text_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Lifecycle ({}):", self.key_system)];
        lines.extend(self.events.iter().map(|e| format!("  {}", e.detail)));
        lines
    }
}

fn load_config(path: &Path) -> anyhow::Result<ProtectionConfig> {
    let config = ProtectionConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if config.candidates.is_empty() {
        bail!("configuration has no key-system candidates");
    }
    Ok(config)
}

/// Platform accepting `accept`, or every configured candidate when empty
fn build_platform(config: &ProtectionConfig, accept: &[KeySystem], store: InMemoryKeyStore) -> InMemoryPlatform {
    let accepted: Vec<KeySystem> = if accept.is_empty() {
        config.candidates.iter().map(|c| c.key_system).collect()
    } else {
        accept.to_vec()
    };
    accepted
        .into_iter()
        .fold(InMemoryPlatform::new().with_key_store(Arc::new(store)), |p, ks| p.accept(ks))
}

/// Run the negotiation cascade over the configured candidates
pub async fn negotiate(config_path: &Path, accept: &[KeySystem], format: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let platform = Arc::new(build_platform(&config, accept, InMemoryKeyStore::new()));

    info!(candidates = config.candidates.len(), "Negotiating");
    let outcome = KeySystemNegotiator::new(platform.clone())
        .negotiate(&config.candidates)
        .await;

    let report = NegotiationReport {
        attempts: platform.attempts().iter().map(|ks| ks.to_string()).collect(),
        selected: outcome.as_ref().ok().map(|access| access.key_system().to_string()),
        error: outcome.err(),
    };
    println!("{}", format_output(&report, format));
    Ok(())
}

async fn wait_for(rx: &mut EventReceiver, topic: &str, seen: &mut Vec<EventLine>) -> anyhow::Result<ProtectionEvent> {
    let wait = async {
        loop {
            let event = rx.recv().await.context("event bus closed")?;
            debug!(event = %event, "Observed");
            seen.push(EventLine {
                topic: event.topic(),
                detail: event.to_string(),
                error: event.error().map(str::to_string),
            });
            if event.topic() == topic {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    };
    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .with_context(|| format!("timed out waiting for {topic}"))?
}

/// Negotiate, select, create sessions and tear everything down
pub async fn lifecycle(
    config_path: &Path,
    accept: &[KeySystem],
    sessions: usize,
    fail_close: bool,
    format: &str,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        fail_close,
        ..Default::default()
    });
    let platform = Arc::new(build_platform(&config, accept, store));
    let model = ProtectionModel::new(platform, config.clone());
    let mut rx = model.subscribe();
    let mut seen = Vec::new();

    model.request_key_system_access(config.candidates.clone());
    let access = match wait_for(&mut rx, "key_system_access_complete", &mut seen).await? {
        ProtectionEvent::KeySystemAccessComplete(Ok(access)) => access,
        other => bail!("negotiation failed: {other}"),
    };
    let key_system = access.key_system();

    model.select_key_system(access).await?;
    if let Some(error) = wait_for(&mut rx, "key_system_selected", &mut seen).await?.error() {
        bail!("selection failed: {error}");
    }

    for i in 0..sessions {
        let init_data = Bytes::from(format!("init-data-{i}"));
        model.create_key_session(init_data, SessionType::Temporary).await?;
        wait_for(&mut rx, "key_session_created", &mut seen).await?;
    }

    model.teardown().await?;
    wait_for(&mut rx, "teardown_complete", &mut seen).await?;

    let report = LifecycleReport {
        key_system: key_system.to_string(),
        events: seen,
    };
    println!("{}", format_output(&report, format));
    Ok(())
}
