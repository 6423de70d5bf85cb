//! Product records as the costing engine needs them.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{OrgId, ProductId};
use stockflow_products::{CostingMethod, Product};

use crate::error::LedgerResult;

pub use in_memory::InMemoryProductCatalog;
pub use postgres::PostgresProductCatalog;

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Store a new product; `Conflict` if the org already has its id or SKU.
    async fn insert(&self, product: Product) -> LedgerResult<Product>;

    /// `NotFound` when the product does not exist in the org.
    async fn get(&self, org_id: OrgId, product_id: ProductId) -> LedgerResult<Product>;

    async fn list(&self, org_id: OrgId) -> LedgerResult<Vec<Product>>;

    /// Cache the receipt's new average and add to the running quantity.
    async fn record_receipt_average(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        average_cost: i64,
        received_qty: i64,
    ) -> LedgerResult<Product>;

    /// Subtract sold units from the running quantity (floored at zero).
    async fn record_sale(&self, org_id: OrgId, product_id: ProductId, sold_qty: i64)
        -> LedgerResult<Product>;

    async fn set_cost(&self, org_id: OrgId, product_id: ProductId, cost: i64) -> LedgerResult<Product>;

    async fn switch_costing(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        method: CostingMethod,
        average_cost: Option<i64>,
    ) -> LedgerResult<Product>;
}

#[async_trait]
impl<S> ProductCatalog for Arc<S>
where
    S: ProductCatalog + ?Sized,
{
    async fn insert(&self, product: Product) -> LedgerResult<Product> {
        (**self).insert(product).await
    }

    async fn get(&self, org_id: OrgId, product_id: ProductId) -> LedgerResult<Product> {
        (**self).get(org_id, product_id).await
    }

    async fn list(&self, org_id: OrgId) -> LedgerResult<Vec<Product>> {
        (**self).list(org_id).await
    }

    async fn record_receipt_average(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        average_cost: i64,
        received_qty: i64,
    ) -> LedgerResult<Product> {
        (**self)
            .record_receipt_average(org_id, product_id, average_cost, received_qty)
            .await
    }

    async fn record_sale(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        sold_qty: i64,
    ) -> LedgerResult<Product> {
        (**self).record_sale(org_id, product_id, sold_qty).await
    }

    async fn set_cost(&self, org_id: OrgId, product_id: ProductId, cost: i64) -> LedgerResult<Product> {
        (**self).set_cost(org_id, product_id, cost).await
    }

    async fn switch_costing(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        method: CostingMethod,
        average_cost: Option<i64>,
    ) -> LedgerResult<Product> {
        (**self)
            .switch_costing(org_id, product_id, method, average_cost)
            .await
    }
}
