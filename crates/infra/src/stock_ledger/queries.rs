//! Reorder views over an org's stock levels.

use stockflow_core::{BranchId, OrgId};
use stockflow_inventory::StockLevel;

use super::StockLedger;
use crate::error::LedgerResult;

/// Levels with stock on hand at or below their `min_stock`.
pub async fn low_stock(
    ledger: &dyn StockLedger,
    org_id: OrgId,
    branch_id: Option<BranchId>,
) -> LedgerResult<Vec<StockLevel>> {
    filtered(ledger, org_id, branch_id, StockLevel::is_low_stock).await
}

/// Levels with nothing on hand.
pub async fn out_of_stock(
    ledger: &dyn StockLedger,
    org_id: OrgId,
    branch_id: Option<BranchId>,
) -> LedgerResult<Vec<StockLevel>> {
    filtered(ledger, org_id, branch_id, StockLevel::is_out_of_stock).await
}

async fn filtered(
    ledger: &dyn StockLedger,
    org_id: OrgId,
    branch_id: Option<BranchId>,
    keep: fn(&StockLevel) -> bool,
) -> LedgerResult<Vec<StockLevel>> {
    let levels = ledger.list_by_org(org_id).await?;
    Ok(levels
        .into_iter()
        .filter(|l| branch_id.is_none_or(|b| l.key.branch_id == b))
        .filter(keep)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::ProductId;
    use stockflow_inventory::StockKey;

    use crate::stock_ledger::InMemoryStockLedger;

    #[tokio::test]
    async fn low_and_out_of_stock_per_branch() {
        let ledger = InMemoryStockLedger::new(5);
        let org = OrgId::new();
        let (north, south) = (BranchId::new(), BranchId::new());
        let (a, b, c) = (ProductId::new(), ProductId::new(), ProductId::new());

        ledger.adjust(StockKey::new(org, north, a), 3).await.unwrap();
        ledger.adjust(StockKey::new(org, north, b), 40).await.unwrap();
        ledger.adjust(StockKey::new(org, south, c), 2).await.unwrap();
        ledger.adjust(StockKey::new(org, south, c), -2).await.unwrap();
        ledger.adjust(StockKey::new(OrgId::new(), north, a), 1).await.unwrap();

        let low = low_stock(&ledger, org, None).await.unwrap();
        assert_eq!(low.iter().map(|l| l.key.product_id).collect::<Vec<_>>(), vec![a]);

        let out = out_of_stock(&ledger, org, Some(south)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.product_id, c);
        assert!(out_of_stock(&ledger, org, Some(north)).await.unwrap().is_empty());
    }
}
