//! Global kill switch (spec.md §4.6 "Kill switch"): a persisted document
//! protected by a single mutex (spec.md §5).

use crate::persist;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub activated_by: Option<String>,
    pub deactivated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub deactivated_by: Option<String>,
}

pub struct KillSwitch {
    path: PathBuf,
    state: RwLock<KillSwitchState>,
}

impl KillSwitch {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("runtime").join("kill-switch.json"),
            state: RwLock::new(KillSwitchState::default()),
        }
    }

    pub async fn load(&self) {
        if let Some(state) = persist::load_json(&self.path).await {
            *self.state.write() = state;
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn snapshot(&self) -> KillSwitchState {
        self.state.read().clone()
    }

    pub async fn activate(
        &self,
        reason: String,
        actor: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.write();
            state.active = true;
            state.reason = Some(reason);
            state.activated_by = Some(actor);
            state.activated_at = Some(now);
        }
        self.persist().await
    }

    pub async fn deactivate(
        &self,
        actor: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.write();
            state.active = false;
            state.deactivated_by = Some(actor);
            state.deactivated_at = Some(now);
        }
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.state.read().clone();
        persist::save_json(&self.path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path());
        switch
            .activate("drill".into(), "ops".into(), chrono::Utc::now())
            .await
            .unwrap();
        assert!(switch.is_active());

        let switch2 = KillSwitch::new(dir.path());
        switch2.load().await;
        assert!(switch2.is_active());
        assert_eq!(switch2.snapshot().reason.as_deref(), Some("drill"));
    }

    #[tokio::test]
    async fn deactivate_clears_active_flag() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(dir.path());
        switch
            .activate("x".into(), "ops".into(), chrono::Utc::now())
            .await
            .unwrap();
        switch.deactivate("ops".into(), chrono::Utc::now()).await.unwrap();
        assert!(!switch.is_active());
    }
}
