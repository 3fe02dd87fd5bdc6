use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Result;
use crate::model::Model;

/// Models delivered by one fetch, keyed by identifier. Identifiers that were asked for but are missing from the map
/// don't exist in the store.
pub(crate) type Fetched = Arc<HashMap<String, Arc<Model>>>;

type Outcome = Option<Result<Fetched>>;

// One outstanding fetch to the persistence adapter. Every caller interested in any of the fetched identifiers holds a
// clone and waits on it; the single task doing the fetch holds the FlightSender.
#[derive(Clone)]
pub(crate) struct Flight {
    id: u64,
    rx: watch::Receiver<Outcome>,
}

pub(crate) struct FlightSender {
    tx: watch::Sender<Outcome>,
}

impl Flight {
    pub(crate) fn launch(id: u64) -> (FlightSender, Flight) {
        let (tx, rx) = watch::channel(None);
        (FlightSender { tx }, Flight { id, rx })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the fetch to land. `None` means the fetching task went away without reporting.
    pub(crate) async fn landed(mut self) -> Option<Result<Fetched>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        }
    }
}

impl FlightSender {
    pub(crate) fn land(self, outcome: Result<Fetched>) {
        // Nobody may be listening anymore; the slots have already been settled by then.
        self.tx.send_replace(Some(outcome));
    }
}

impl Debug for Flight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight").field("id", &self.id).finish()
    }
}
