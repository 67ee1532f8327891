//! Integration repository for database operations
//!
//! Every write is a whole-field overwrite of one row. Status writes are
//! compare-and-set against the expected current status, and the refresh lease
//! is taken with a single conditional `UPDATE`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::integration::{self, Entity as Integration};
use crate::models::{ConnectionType, IntegrationStatus};

/// Repository for integration rows
#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Retrieves an integration by its ID without tenant scoping
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<integration::Model>, DbErr> {
        Integration::find_by_id(id).one(&*self.db).await
    }

    /// Finds an integration by its ID within a tenant scope
    pub async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<integration::Model>, DbErr> {
        Integration::find_by_id(id)
            .filter(integration::Column::TenantId.eq(tenant_id))
            .one(&*self.db)
            .await
    }

    /// Lists a tenant's integrations ordered by creation time then ID
    pub async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<integration::Model>, DbErr> {
        Integration::find()
            .filter(integration::Column::TenantId.eq(tenant_id))
            .order_by_asc(integration::Column::CreatedAt)
            .order_by_asc(integration::Column::Id)
            .all(&*self.db)
            .await
    }

    /// Connected OAuth integrations across all tenants (background refresh candidates)
    pub async fn list_connected_oauth(&self) -> Result<Vec<integration::Model>, DbErr> {
        Integration::find()
            .filter(integration::Column::Status.eq(IntegrationStatus::Connected.as_str()))
            .filter(integration::Column::ConnectionType.eq(ConnectionType::OAuth.as_str()))
            .order_by_asc(integration::Column::UpdatedAt)
            .all(&*self.db)
            .await
    }

    /// Number of non-disconnected integrations owned by the tenant
    pub async fn count_active_by_tenant<C>(conn: &C, tenant_id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        Integration::find()
            .filter(integration::Column::TenantId.eq(tenant_id))
            .filter(integration::Column::Status.ne(IntegrationStatus::Disconnected.as_str()))
            .count(conn)
            .await
    }

    /// Inserts a new row on the given connection (pool or transaction)
    pub async fn insert<C>(
        conn: &C,
        model: integration::ActiveModel,
    ) -> Result<integration::Model, DbErr>
    where
        C: ConnectionTrait,
    {
        model.insert(conn).await
    }

    /// Overwrites `settings`; returns false when the row does not exist
    pub async fn update_settings(&self, id: Uuid, settings: JsonValue) -> Result<bool, DbErr> {
        let result = Integration::update_many()
            .col_expr(integration::Column::Settings, Expr::value(settings))
            .col_expr(integration::Column::UpdatedAt, Expr::value(now_tz()))
            .filter(integration::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Moves `from -> to` only if the stored status is still `from`
    pub async fn transition_status(
        &self,
        id: Uuid,
        from: IntegrationStatus,
        to: IntegrationStatus,
    ) -> Result<bool, DbErr> {
        let result = Integration::update_many()
            .col_expr(integration::Column::Status, Expr::value(to.as_str()))
            .col_expr(integration::Column::UpdatedAt, Expr::value(now_tz()))
            .filter(integration::Column::Id.eq(id))
            .filter(integration::Column::Status.eq(from.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Writes `settings` and moves `from -> to` in one statement
    pub async fn transition_with_settings(
        &self,
        id: Uuid,
        from: IntegrationStatus,
        to: IntegrationStatus,
        settings: JsonValue,
    ) -> Result<bool, DbErr> {
        let result = Integration::update_many()
            .col_expr(integration::Column::Settings, Expr::value(settings))
            .col_expr(integration::Column::Status, Expr::value(to.as_str()))
            .col_expr(integration::Column::UpdatedAt, Expr::value(now_tz()))
            .filter(integration::Column::Id.eq(id))
            .filter(integration::Column::Status.eq(from.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Takes the refresh lease if it is free, expired, or already ours.
    pub async fn try_acquire_refresh_lease(
        &self,
        id: Uuid,
        owner: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let now_tz: DateTimeWithTimeZone = now.into();
        let until: DateTimeWithTimeZone = (now + ttl).into();

        let result = Integration::update_many()
            .col_expr(integration::Column::RefreshLeaseOwner, Expr::value(Some(owner)))
            .col_expr(integration::Column::RefreshLeaseUntil, Expr::value(Some(until)))
            .filter(integration::Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(integration::Column::RefreshLeaseUntil.is_null())
                    .add(integration::Column::RefreshLeaseUntil.lt(now_tz))
                    .add(integration::Column::RefreshLeaseOwner.eq(owner)),
            )
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Releases the lease if `owner` still holds it
    pub async fn release_refresh_lease(&self, id: Uuid, owner: Uuid) -> Result<(), DbErr> {
        Integration::update_many()
            .col_expr(
                integration::Column::RefreshLeaseOwner,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                integration::Column::RefreshLeaseUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .filter(integration::Column::Id.eq(id))
            .filter(integration::Column::RefreshLeaseOwner.eq(owner))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

fn now_tz() -> DateTimeWithTimeZone {
    Utc::now().into()
}
