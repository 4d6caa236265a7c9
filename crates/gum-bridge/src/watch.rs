//! Headless dashboard tabs that log everything they see.
//!
//! One design tab leads; `previews` preview tabs follow it over a shared
//! in-process bus, exactly as browser tabs of one session would.

use crate::config::AppConfig;
use gum_core::Endpoint;
use gum_ws::{BusHub, TabEnvironment, TransportManager, ANY_ACTION};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What to watch.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub exen: Endpoint,
    /// Device pattern to subscribe to.
    pub devices: String,
    pub previews: usize,
}

/// Connect the tabs, subscribe, list devices and log until `shutdown`.
pub async fn run_watch(
    config: &AppConfig,
    options: WatchOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bus = BusHub::new();
    let design = TransportManager::new(config.transport.clone(), TabEnvironment::design(bus.clone()));
    let decision = connect_and_wait(&design).await?;
    info!(tab_id = %decision.tab_id, role = %decision.role, "Design tab connected");
    watch_tab(&design, "design", &options)?;
    design.request_list(&options.exen)?;

    let mut tabs = vec![design];
    for n in 1..=options.previews {
        let query = format!("?parentTabId={}", decision.tab_id);
        let preview = TransportManager::new(
            config.transport.clone(),
            TabEnvironment::preview(bus.clone(), query),
        );
        let decision = connect_and_wait(&preview).await?;
        info!(preview = n, role = %decision.role, "Preview tab connected");
        watch_tab(&preview, &format!("preview-{n}"), &options)?;
        tabs.push(preview);
    }

    shutdown.cancelled().await;
    info!("Watch stopping");
    for tab in &tabs {
        tab.close();
    }
    Ok(())
}

async fn connect_and_wait(manager: &TransportManager) -> anyhow::Result<gum_ws::RoleDecision> {
    let (tx, rx) = oneshot::channel();
    let decision = manager.connect(move || {
        let _ = tx.send(());
    })?;
    rx.await
        .map_err(|_| anyhow::anyhow!("tab {} closed before connecting", decision.tab_id))?;
    Ok(decision)
}

fn watch_tab(manager: &TransportManager, label: &str, options: &WatchOptions) -> anyhow::Result<()> {
    let tab = label.to_string();
    manager.set_on_list(move |exen: &Endpoint, devices: &Value| {
        info!(%tab, %exen, %devices, "Device list");
    });
    let tab = label.to_string();
    manager.add_listener(
        &options.exen,
        options.devices.as_str(),
        move |action: &str, payload: &Value| {
            info!(%tab, action, %payload, "Event");
        },
        ANY_ACTION,
    )?;
    Ok(())
}
