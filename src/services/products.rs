use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::product::{self, Entity as ProductEntity, Grade};
use crate::entities::stock_record;
use crate::errors::ServiceError;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 255, message = "Product name is required"))]
    pub name: String,
    pub sku: Option<String>,
}

/// Product catalog operations, including the graded-variant lookup used by
/// cutting completion. Creating a product also creates its zero stock
/// record, so the ledger never has to handle a missing row.
#[derive(Clone)]
pub struct ProductService {
    db: Arc<DbPool>,
}

impl ProductService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let created = insert_product_in(
            &txn,
            request.name,
            request.sku,
            Grade::Usual,
            None,
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(product_id = %created.id, "Product created");
        Ok(created)
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Lists products with pagination. `page` is 1-based.
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<product::Model>, u64), ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let paginator = ProductEntity::find()
            .order_by_asc(product::Column::Name)
            .paginate(&*self.db, per_page);

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_error)?;
        let products = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        Ok((products, total))
    }

    /// Returns the second-grade variant of a base product, creating it (with
    /// its stock record) on first use. The variant is looked up through the
    /// typed `variant_of_id` relation, never parsed out of SKU text.
    pub(crate) async fn find_or_create_second_grade_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        base: &product::Model,
    ) -> Result<product::Model, ServiceError> {
        if base.grade == Grade::Second {
            return Ok(base.clone());
        }

        let existing = ProductEntity::find()
            .filter(product::Column::VariantOfId.eq(base.id))
            .filter(product::Column::Grade.eq(Grade::Second))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(variant) = existing {
            return Ok(variant);
        }

        let created = insert_product_in(
            conn,
            format!("{} (2nd grade)", base.name),
            base.sku.as_ref().map(|sku| format!("{}-2G", sku)),
            Grade::Second,
            Some(base.id),
        )
        .await?;

        info!(
            base_product_id = %base.id,
            variant_id = %created.id,
            "Second-grade variant created"
        );
        Ok(created)
    }
}

/// Inserts a product together with its zero stock record.
async fn insert_product_in<C: ConnectionTrait>(
    conn: &C,
    name: String,
    sku: Option<String>,
    grade: Grade,
    variant_of_id: Option<Uuid>,
) -> Result<product::Model, ServiceError> {
    let now = Utc::now();
    let product_id = Uuid::new_v4();

    let product_active = product::ActiveModel {
        id: Set(product_id),
        name: Set(name),
        sku: Set(sku),
        grade: Set(grade),
        variant_of_id: Set(variant_of_id),
        created_at: Set(now),
        updated_at: Set(None),
    };
    let created = product_active
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let record = stock_record::ActiveModel {
        product_id: Set(product_id),
        current_stock: Set(0),
        reserved_stock: Set(0),
        created_at: Set(now),
        updated_at: Set(None),
    };
    record.insert(conn).await.map_err(ServiceError::db_error)?;

    Ok(created)
}
