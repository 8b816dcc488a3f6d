//! Manifest-backed trader registry (SPEC_FULL.md §4.13).

use crate::agent::types::{Trader, TraderStatus};
use crate::persist;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryFile {
    pub registered_agent_ids: Vec<String>,
    pub status_by_agent_id: HashMap<String, TraderStatus>,
}

pub struct TraderRegistry {
    manifests_dir: PathBuf,
    registry_path: PathBuf,
    available: RwLock<HashMap<String, Trader>>,
    registry: RwLock<RegistryFile>,
}

impl TraderRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            manifests_dir: data_dir.join("agents").join("manifests"),
            registry_path: data_dir.join("agents").join("registry.json"),
            available: RwLock::new(HashMap::new()),
            registry: RwLock::new(RegistryFile::default()),
        }
    }

    pub async fn load(&self) {
        if let Some(file) = persist::load_json::<RegistryFile>(&self.registry_path).await {
            *self.registry.write() = file;
        }
        self.rescan_manifests();
    }

    /// Re-scan the manifest directory. Missing manifests drop their trader
    /// from `available`; the registry itself is untouched (a manifest
    /// removal destroys the trader per spec.md §3 but does not silently
    /// un-register — the next register/unregister call observes the gap).
    pub fn rescan_manifests(&self) {
        let mut available = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.manifests_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    if let Ok(trader) = serde_json::from_str::<Trader>(&contents) {
                        available.insert(trader.trader_id.clone(), trader);
                    }
                }
            }
        }
        *self.available.write() = available;
    }

    pub fn available_agents(&self) -> Vec<Trader> {
        self.available.read().values().cloned().collect()
    }

    pub fn registered_traders(&self) -> Vec<Trader> {
        let registry = self.registry.read();
        let available = self.available.read();
        registry
            .registered_agent_ids
            .iter()
            .filter_map(|id| available.get(id).cloned())
            .map(|mut t| {
                t.status = registry
                    .status_by_agent_id
                    .get(&t.trader_id)
                    .copied()
                    .unwrap_or(TraderStatus::Stopped);
                t
            })
            .collect()
    }

    pub fn manifest_exists(&self, trader_id: &str) -> bool {
        self.available.read().contains_key(trader_id)
    }

    pub fn is_registered(&self, trader_id: &str) -> bool {
        self.registry
            .read()
            .registered_agent_ids
            .iter()
            .any(|id| id == trader_id)
    }

    pub async fn register(&self, trader_id: &str) -> anyhow::Result<()> {
        {
            let mut registry = self.registry.write();
            if !registry.registered_agent_ids.iter().any(|id| id == trader_id) {
                registry.registered_agent_ids.push(trader_id.to_string());
            }
            registry
                .status_by_agent_id
                .entry(trader_id.to_string())
                .or_insert(TraderStatus::Stopped);
        }
        self.persist().await
    }

    pub async fn unregister(&self, trader_id: &str) -> anyhow::Result<()> {
        {
            let mut registry = self.registry.write();
            registry.registered_agent_ids.retain(|id| id != trader_id);
            registry.status_by_agent_id.remove(trader_id);
        }
        self.persist().await
    }

    pub async fn set_status(&self, trader_id: &str, status: TraderStatus) -> anyhow::Result<()> {
        {
            let mut registry = self.registry.write();
            registry
                .status_by_agent_id
                .insert(trader_id.to_string(), status);
        }
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.registry.read().clone();
        persist::save_json(&self.registry_path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::{Exchange, RiskProfile, TradingStyle};

    fn write_manifest(dir: &std::path::Path, trader_id: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let trader = Trader {
            trader_id: trader_id.to_string(),
            trader_name: "Test".into(),
            ai_model: "x".into(),
            exchange_id: Exchange::Us,
            strategy_name: "s".into(),
            trading_style: TradingStyle::Balanced,
            risk_profile: RiskProfile::Balanced,
            stock_pool: vec!["AAPL".into()],
            avatar_url: None,
            status: TraderStatus::Stopped,
        };
        std::fs::write(
            dir.join(format!("{trader_id}.json")),
            serde_json::to_vec(&trader).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn register_then_start_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("agents").join("manifests"), "t_001");

        let registry = TraderRegistry::new(dir.path());
        registry.load().await;
        assert!(!registry.is_registered("t_001"));

        registry.register("t_001").await.unwrap();
        registry
            .set_status("t_001", TraderStatus::Running)
            .await
            .unwrap();

        let registry2 = TraderRegistry::new(dir.path());
        registry2.load().await;
        assert!(registry2.is_registered("t_001"));
        let traders = registry2.registered_traders();
        assert_eq!(traders[0].status, TraderStatus::Running);
    }
}
