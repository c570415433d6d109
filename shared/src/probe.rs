use tracing::{info, instrument, warn};

use crate::capabilities::{RemoteTables, SelectQuery, Table};
use crate::model::ConnectionMode;

/// Decides the session mode with one minimal read against the advice table.
/// Any failure, including a missing backend, means offline.
#[instrument(skip_all)]
pub async fn probe(remote: Option<&dyn RemoteTables>) -> ConnectionMode {
    let Some(remote) = remote else {
        info!("No remote backend configured, running offline");
        return ConnectionMode::Offline;
    };

    let query = SelectQuery::all().columns("key_id").limit(1);
    match remote.select(Table::MedicalAdvice, &query).await {
        Ok(_) => {
            info!("Remote backend reachable");
            ConnectionMode::Online
        }
        Err(e) => {
            warn!(error = %e, "Remote backend unreachable, falling back to offline storage");
            ConnectionMode::Offline
        }
    }
}
