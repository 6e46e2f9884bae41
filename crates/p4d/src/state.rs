use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::ControllerStatus;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// In-process state shared by the control loop and the job worker.
pub struct SystemState {
    pub started_at: i64,
    /// Unix time of the next poll tick.
    pub next_at: i64,
    /// Last controller snapshot; overwritten by every successful poll.
    pub status: ControllerStatus,
    pub triggers: Triggers,
}

/// Requests from the job worker, handled by the control loop at its next
/// wake and then reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triggers {
    pub update_config: bool,
    pub update_schema_conf: bool,
    pub init_menu: bool,
    pub update_value_facts: bool,
    /// Rule ids to evaluate with a forced test mail.
    pub alert_tests: Vec<i64>,
}

impl Triggers {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    UpdateConfig,
    UpdateSchemaConf,
    InitMenu,
    UpdateValueFacts,
    AlertTest(i64),
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(started_at: i64) -> Self {
        Self {
            started_at,
            next_at: started_at,
            status: ControllerStatus::default(),
            triggers: Triggers::default(),
        }
    }

    pub fn shared(started_at: i64) -> SharedState {
        Arc::new(RwLock::new(Self::new(started_at)))
    }

    pub fn request(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::UpdateConfig => self.triggers.update_config = true,
            Trigger::UpdateSchemaConf => self.triggers.update_schema_conf = true,
            Trigger::InitMenu => self.triggers.init_menu = true,
            Trigger::UpdateValueFacts => self.triggers.update_value_facts = true,
            Trigger::AlertTest(id) => {
                if !self.triggers.alert_tests.contains(&id) {
                    self.triggers.alert_tests.push(id);
                }
            }
        }
    }

    /// Hand all pending triggers to the caller and reset them.
    pub fn take_triggers(&mut self) -> Triggers {
        std::mem::take(&mut self.triggers)
    }

    pub fn record_status(&mut self, status: ControllerStatus) {
        self.status = status;
    }

    pub fn uptime(&self, now: i64) -> i64 {
        (now - self.started_at).max(0)
    }
}
