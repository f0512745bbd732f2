use crate::{OrderId, SellerProfileId};
use serde::{Deserialize, Serialize};

pub const PAYOUT_HISTORY_DEFAULT_LIMIT: i64 = 20;
pub const PAYOUT_HISTORY_MAX_LIMIT: i64 = 100;

/// Identify the seller whose payouts an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerPayouts {
    pub seller_profile_id: SellerProfileId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutHistory {
    pub seller_profile_id: SellerProfileId,
    /// Defaults to [`PAYOUT_HISTORY_DEFAULT_LIMIT`], capped at
    /// [`PAYOUT_HISTORY_MAX_LIMIT`].
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PayoutHistory {
    /// Clamp the requested page into the supported range.
    pub fn page(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(PAYOUT_HISTORY_DEFAULT_LIMIT)
            .clamp(1, PAYOUT_HISTORY_MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrderDelivered {
    pub order_id: OrderId,
}
