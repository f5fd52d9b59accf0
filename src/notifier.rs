//! Change and connectivity notifications.
//!
//! Listeners subscribe to a [`Notifier`] and receive [`NotifierEvent`]s over a
//! `tokio::sync::broadcast` channel. The notifier is owned by the process and
//! passed in at construction, there is no global instance.

use tokio::sync::broadcast;
use tracing::debug;

use crate::coordinator::ConnectivityState;
use crate::types::{ChangeNotification, ChangeOrigin, TableChange};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum NotifierEvent {
    /// Something may have changed; listeners should re-query.
    PotentiallyChanged { db_name: String },
    /// A committed write touched these tables.
    ActuallyChanged(ChangeNotification),
    ConnectivityStateChanged {
        db_name: String,
        state: ConnectivityState,
    },
}

/// Sink for data change and connectivity events.
pub trait Notifier: Send + Sync {
    fn potentially_changed(&self);

    fn actually_changed(&self, changes: Vec<TableChange>, origin: ChangeOrigin);

    fn connectivity_state_changed(&self, state: ConnectivityState);

    fn subscribe(&self) -> broadcast::Receiver<NotifierEvent>;
}

/// [`Notifier`] backed by a broadcast channel.
///
/// Sends never block; a lagging listener misses events and gets
/// `RecvError::Lagged`.
pub struct EventNotifier {
    db_name: String,
    tx: broadcast::Sender<NotifierEvent>,
}

impl EventNotifier {
    pub fn new(db_name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            db_name: db_name.into(),
            tx,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    fn emit(&self, event: NotifierEvent) {
        // No receivers is fine.
        if self.tx.send(event).is_err() {
            debug!(db = %self.db_name, "notification dropped, no listeners");
        }
    }
}

impl Notifier for EventNotifier {
    fn potentially_changed(&self) {
        self.emit(NotifierEvent::PotentiallyChanged {
            db_name: self.db_name.clone(),
        });
    }

    fn actually_changed(&self, changes: Vec<TableChange>, origin: ChangeOrigin) {
        if changes.is_empty() {
            return;
        }
        self.emit(NotifierEvent::ActuallyChanged(ChangeNotification {
            db_name: self.db_name.clone(),
            changes,
            origin,
        }));
    }

    fn connectivity_state_changed(&self, state: ConnectivityState) {
        crate::metrics::set_connectivity(state.as_str());
        self.emit(NotifierEvent::ConnectivityStateChanged {
            db_name: self.db_name.clone(),
            state,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.tx.subscribe()
    }
}
