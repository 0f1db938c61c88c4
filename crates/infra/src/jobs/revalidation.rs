//! Revalidation flag propagation.

use edgepurge_core::{GLOBAL_CONFIG_FILE, PendingFlag, RevalidationScope, USE_REVAL_PENDING_PARAMETER};

use crate::store::{JobTx, StoreError};

/// Mark the fleet serving the scoped delivery service's CDN.
///
/// The `use_reval_pending` global parameter is read inside the same
/// transaction, so toggling it takes effect on the next mutation.
pub async fn propagate(tx: &mut dyn JobTx, scope: &RevalidationScope) -> Result<u64, StoreError> {
    let toggle = tx
        .parameter(USE_REVAL_PENDING_PARAMETER, GLOBAL_CONFIG_FILE)
        .await?;
    let flag = PendingFlag::from_parameter(toggle.as_deref());
    let marked = tx.mark_fleet(scope, flag).await?;
    tracing::info!(%scope, flag = flag.column(), marked, "revalidation flags queued");
    Ok(marked)
}
