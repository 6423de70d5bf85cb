//! FIFO lot consumption.

use tracing::{debug, error, warn};

use stockflow_core::{ensure_positive_qty, OrgId};
use stockflow_inventory::{CogsResult, CostLine, StockKey};

use super::LotStore;
use crate::config::RetryPolicy;
use crate::error::{LedgerError, LedgerResult};

/// Consume `qty` units from the key's open lots, oldest first.
///
/// Each step is one conditional decrement of the oldest open lot. When that
/// decrement loses a race (another consumer drained the lot first) the loop
/// re-reads the oldest lot and tries again, up to `retry.max_attempts` times.
/// Running out of lots, exhausting the retry budget or any store failure gives
/// back everything consumed so far before returning the error, so on `Err`
/// no lot has changed.
pub async fn consume_lots_fifo(
    lots: &dyn LotStore,
    key: StockKey,
    qty: i64,
    retry: &RetryPolicy,
) -> LedgerResult<CogsResult> {
    ensure_positive_qty(qty)?;

    let mut remaining = qty;
    let mut cost_lines: Vec<CostLine> = Vec::new();
    let mut races = 0u32;

    while remaining > 0 {
        let lot = match lots.find_oldest_open(key).await {
            Ok(lot) => lot,
            Err(err) => {
                restore_cost_lines(lots, key.org_id, &cost_lines).await;
                return Err(if err.is_not_found() {
                    LedgerError::InsufficientLots {
                        product_id: key.product_id,
                    }
                } else {
                    err
                });
            }
        };

        let take = remaining.min(lot.qty_remaining);
        let line = match CostLine::from_lot(key.product_id, lot.id, take, lot.unit_cost) {
            Ok(line) => line,
            Err(err) => {
                restore_cost_lines(lots, key.org_id, &cost_lines).await;
                return Err(err.into());
            }
        };
        match lots.decrement_remaining(key.org_id, lot.id, take).await {
            Ok(_) => {
                debug!(lot_id = %lot.id, take, unit_cost = lot.unit_cost, "consumed lot");
                cost_lines.push(line);
                remaining -= take;
            }
            Err(err) if err.is_conflict() => {
                if !retry.should_retry(races) {
                    restore_cost_lines(lots, key.org_id, &cost_lines).await;
                    return Err(LedgerError::conflict(format!(
                        "lot consumption for {key} lost {} races in a row",
                        races + 1
                    )));
                }
                races += 1;
                warn!(lot_id = %lot.id, attempt = races, "oldest lot changed concurrently; retrying");
                tokio::time::sleep(retry.delay_for_attempt(races)).await;
            }
            Err(err) => {
                restore_cost_lines(lots, key.org_id, &cost_lines).await;
                return Err(err);
            }
        }
    }

    match CogsResult::from_lines(cost_lines.clone()) {
        Ok(cogs) => Ok(cogs),
        Err(err) => {
            restore_cost_lines(lots, key.org_id, &cost_lines).await;
            Err(err.into())
        }
    }
}

/// Give back the lot quantities behind `cost_lines`, newest first.
///
/// Average-cost lines touched no lot and are skipped. A failed increment is
/// logged and the remaining lines are still restored; returns how many failed.
pub async fn restore_cost_lines(lots: &dyn LotStore, org_id: OrgId, cost_lines: &[CostLine]) -> usize {
    let mut failed = 0;
    for line in cost_lines.iter().rev() {
        let Some(lot_id) = line.lot_id.lot_id() else {
            continue;
        };
        if let Err(err) = lots.increment_remaining(org_id, lot_id, line.quantity).await {
            failed += 1;
            error!(%lot_id, quantity = line.quantity, error = %err, "failed to restore lot quantity");
        }
    }
    failed
}
