//! Postgres-backed product catalog. Each update is one statement that bumps `version`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};

use stockflow_core::{DomainError, OrgId, ProductId};
use stockflow_products::{CostingMethod, Product};

use super::ProductCatalog;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresProductCatalog {
    pool: PgPool,
}

impl PostgresProductCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_product(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        product_id: ProductId,
        operation: &str,
    ) -> LedgerResult<Product> {
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or_else(|| LedgerError::not_found(format!("product {product_id}")))?;
        decode(&row, operation)
    }
}

#[async_trait]
impl ProductCatalog for PostgresProductCatalog {
    async fn insert(&self, product: Product) -> LedgerResult<Product> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (
                id, org_id, sku, name, price, cost, costing_method, average_cost,
                total_quantity, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(product.org_id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.cost)
        .bind(product.costing_method.as_str())
        .bind(product.average_cost)
        .bind(product.total_quantity)
        .bind(product.version as i64)
        .bind(product.created_at)
        .bind(product.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        decode(&row, "insert_product")
    }

    async fn get(&self, org_id: OrgId, product_id: ProductId) -> LedgerResult<Product> {
        self.fetch_product(
            sqlx::query("SELECT * FROM products WHERE id = $1 AND org_id = $2")
                .bind(product_id.as_uuid())
                .bind(org_id.as_uuid()),
            product_id,
            "get_product",
        )
        .await
    }

    async fn list(&self, org_id: OrgId) -> LedgerResult<Vec<Product>> {
        let rows = sqlx::query("SELECT * FROM products WHERE org_id = $1 ORDER BY sku")
            .bind(org_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(|r| decode(r, "list_products")).collect()
    }

    async fn record_receipt_average(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        average_cost: i64,
        received_qty: i64,
    ) -> LedgerResult<Product> {
        self.fetch_product(
            sqlx::query(
                r#"
                UPDATE products
                SET average_cost = $3,
                    total_quantity = total_quantity + $4,
                    version = version + 1,
                    updated_at = now()
                WHERE id = $1 AND org_id = $2
                RETURNING *
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(org_id.as_uuid())
            .bind(average_cost)
            .bind(received_qty),
            product_id,
            "record_receipt_average",
        )
        .await
    }

    async fn record_sale(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        sold_qty: i64,
    ) -> LedgerResult<Product> {
        self.fetch_product(
            sqlx::query(
                r#"
                UPDATE products
                SET total_quantity = GREATEST(total_quantity - $3, 0),
                    version = version + 1,
                    updated_at = now()
                WHERE id = $1 AND org_id = $2
                RETURNING *
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(org_id.as_uuid())
            .bind(sold_qty),
            product_id,
            "record_sale",
        )
        .await
    }

    async fn set_cost(&self, org_id: OrgId, product_id: ProductId, cost: i64) -> LedgerResult<Product> {
        if cost < 0 {
            return Err(DomainError::validation("cost must be >= 0").into());
        }
        self.fetch_product(
            sqlx::query(
                r#"
                UPDATE products
                SET cost = $3, version = version + 1, updated_at = now()
                WHERE id = $1 AND org_id = $2
                RETURNING *
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(org_id.as_uuid())
            .bind(cost),
            product_id,
            "set_product_cost",
        )
        .await
    }

    async fn switch_costing(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        method: CostingMethod,
        average_cost: Option<i64>,
    ) -> LedgerResult<Product> {
        self.fetch_product(
            sqlx::query(
                r#"
                UPDATE products
                SET costing_method = $3,
                    average_cost = COALESCE($4, average_cost),
                    version = version + 1,
                    updated_at = now()
                WHERE id = $1 AND org_id = $2
                RETURNING *
                "#,
            )
            .bind(product_id.as_uuid())
            .bind(org_id.as_uuid())
            .bind(method.as_str())
            .bind(average_cost),
            product_id,
            "switch_costing",
        )
        .await
    }
}

// SQLx row types

#[derive(Debug)]
struct ProductRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    sku: String,
    name: String,
    price: i64,
    cost: i64,
    costing_method: String,
    average_cost: i64,
    total_quantity: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProductRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            sku: row.try_get("sku")?,
            name: row.try_get("name")?,
            price: row.try_get("price")?,
            cost: row.try_get("cost")?,
            costing_method: row.try_get("costing_method")?,
            average_cost: row.try_get("average_cost")?,
            total_quantity: row.try_get("total_quantity")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ProductRow> for Product {
    type Error = LedgerError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Product {
            id: ProductId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            sku: row.sku,
            name: row.name,
            price: row.price,
            cost: row.cost,
            costing_method: row.costing_method.parse::<CostingMethod>()?,
            average_cost: row.average_cost,
            total_quantity: row.total_quantity,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<Product> {
    ProductRow::from_row(row)
        .map_err(|e| LedgerError::backend(format!("failed to decode product in {operation}: {e}")))?
        .try_into()
}
