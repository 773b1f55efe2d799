use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    SettlementStage,
    SettlementFailed,
    DepositRecorded,
    DepositDuplicate,
    RecordDegraded,
    EndpointSwitched,
    ProfileUpdated,
    LeaderboardReset,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub source: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, source: &str, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
            source: Some(source.into()),
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<EventType, Vec<Listener>>>>,
}

impl EventBus {
    pub fn subscribe<F>(&self, event_type: EventType, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.listeners.lock() {
            guard
                .entry(event_type)
                .or_default()
                .push(Arc::new(callback));
        }
    }

    pub fn unsubscribe_all(&self, event_type: EventType) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.remove(&event_type);
        }
    }

    pub fn emit(&self, event: Event) {
        // Listeners run outside the lock so they may subscribe or emit.
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard.get(&event.event_type).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&event);
        }
    }
}
