//! # Tenant Repository
//!
//! Lookup and creation of tenants and their plan tier.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use uuid::Uuid;

use crate::models::PlanTier;
use crate::models::tenant::{ActiveModel as TenantActiveModel, Entity as Tenant, Model as TenantModel};

/// Repository for Tenant database operations
#[derive(Debug, Clone)]
pub struct TenantRepository {
    db: Arc<DatabaseConnection>,
}

impl TenantRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create a new tenant on the given plan
    pub async fn create(&self, name: &str, plan_tier: PlanTier) -> Result<TenantModel, DbErr> {
        TenantActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(Some(name.to_string())),
            plan_tier: Set(plan_tier.as_str().to_string()),
            created_at: Set(Utc::now().into()),
        }
        .insert(&*self.db)
        .await
    }

    /// Get tenant by ID
    pub async fn get_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantModel>, DbErr> {
        Self::get_by_id_in(&*self.db, tenant_id).await
    }

    /// Get tenant by ID on the given connection (pool or transaction)
    pub async fn get_by_id_in<C>(conn: &C, tenant_id: Uuid) -> Result<Option<TenantModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        Tenant::find_by_id(tenant_id).one(conn).await
    }
}
