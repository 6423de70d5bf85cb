use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{DomainResult, OrgId, ProductId};
use stockflow_products::{CostingMethod, Product};

use super::ProductCatalog;
use crate::error::{poisoned, LedgerError, LedgerResult};

#[derive(Debug, Default)]
pub struct InMemoryProductCatalog {
    inner: RwLock<HashMap<(OrgId, ProductId), Product>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, org_id: OrgId, product_id: ProductId, f: F) -> LedgerResult<Product>
    where
        F: FnOnce(&mut Product) -> DomainResult<()>,
    {
        let mut map = self.inner.write().map_err(poisoned)?;
        let product = map
            .get_mut(&(org_id, product_id))
            .ok_or_else(|| product_not_found(product_id))?;
        let mut next = product.clone();
        f(&mut next)?;
        *product = next.clone();
        Ok(next)
    }
}

fn product_not_found(product_id: ProductId) -> LedgerError {
    LedgerError::not_found(format!("product {product_id}"))
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn insert(&self, product: Product) -> LedgerResult<Product> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let duplicate = map
            .values()
            .any(|p| p.org_id == product.org_id && (p.id == product.id || p.sku == product.sku));
        if duplicate {
            return Err(LedgerError::conflict(format!(
                "product {} (sku {}) already exists",
                product.id, product.sku
            )));
        }
        map.insert((product.org_id, product.id), product.clone());
        Ok(product)
    }

    async fn get(&self, org_id: OrgId, product_id: ProductId) -> LedgerResult<Product> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&(org_id, product_id))
            .cloned()
            .ok_or_else(|| product_not_found(product_id))
    }

    async fn list(&self, org_id: OrgId) -> LedgerResult<Vec<Product>> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut products: Vec<Product> = map.values().filter(|p| p.org_id == org_id).cloned().collect();
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(products)
    }

    async fn record_receipt_average(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        average_cost: i64,
        received_qty: i64,
    ) -> LedgerResult<Product> {
        self.mutate(org_id, product_id, |p| {
            p.record_receipt_average(average_cost, received_qty, Utc::now());
            Ok(())
        })
    }

    async fn record_sale(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        sold_qty: i64,
    ) -> LedgerResult<Product> {
        self.mutate(org_id, product_id, |p| {
            p.record_sale(sold_qty, Utc::now());
            Ok(())
        })
    }

    async fn set_cost(&self, org_id: OrgId, product_id: ProductId, cost: i64) -> LedgerResult<Product> {
        self.mutate(org_id, product_id, |p| p.set_cost(cost, Utc::now()))
    }

    async fn switch_costing(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        method: CostingMethod,
        average_cost: Option<i64>,
    ) -> LedgerResult<Product> {
        self.mutate(org_id, product_id, |p| {
            p.switch_costing(method, average_cost, Utc::now());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_products::NewProduct;

    fn product(org_id: OrgId, sku: &str) -> Product {
        Product::create(
            NewProduct {
                org_id,
                sku: sku.to_string(),
                name: "Widget".to_string(),
                price: 200,
                cost: 100,
                costing_method: CostingMethod::Fifo,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_sku_in_org_is_conflict() {
        let catalog = InMemoryProductCatalog::new();
        let org = OrgId::new();
        catalog.insert(product(org, "A")).await.unwrap();
        assert!(catalog.insert(product(org, "A")).await.unwrap_err().is_conflict());
        catalog.insert(product(OrgId::new(), "A")).await.unwrap();
    }

    #[tokio::test]
    async fn updates_bump_version() {
        let catalog = InMemoryProductCatalog::new();
        let org = OrgId::new();
        let p = catalog.insert(product(org, "B")).await.unwrap();

        let p2 = catalog.set_cost(org, p.id, 130).await.unwrap();
        assert_eq!(p2.cost, 130);
        assert_eq!(p2.version, p.version + 1);
        assert!(catalog.set_cost(org, p.id, -1).await.is_err());
        assert_eq!(catalog.get(org, p.id).await.unwrap(), p2);
        assert!(catalog.get(OrgId::new(), p.id).await.unwrap_err().is_not_found());
    }
}
