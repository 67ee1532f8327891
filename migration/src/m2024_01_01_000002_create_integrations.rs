//! Migration to create the integrations table.
//!
//! One row per tenant/provider connection. Credentials live in `settings`;
//! the top-level `client_id`, `client_secret` and `oauth_data` columns hold
//! legacy values that are read but never written. The `refresh_lease_*`
//! columns carry the per-integration token refresh lease.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Integrations::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Integrations::ProviderName).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::ConnectionType)
                            .text()
                            .not_null()
                            .default("oauth"),
                    )
                    .col(
                        ColumnDef::new(Integrations::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Integrations::Environment).text().null())
                    .col(ColumnDef::new(Integrations::Settings).json_binary().null())
                    .col(ColumnDef::new(Integrations::ClientId).text().null())
                    .col(ColumnDef::new(Integrations::ClientSecret).text().null())
                    .col(ColumnDef::new(Integrations::OauthData).json_binary().null())
                    .col(ColumnDef::new(Integrations::RefreshLeaseOwner).uuid().null())
                    .col(
                        ColumnDef::new(Integrations::RefreshLeaseUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integrations_tenant_id")
                            .from(Integrations::Table, Integrations::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Limit gate counts and tenant listings
        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_tenant_status")
                    .table(Integrations::Table)
                    .col(Integrations::TenantId)
                    .col(Integrations::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_tenant_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    TenantId,
    ProviderName,
    ConnectionType,
    Status,
    Environment,
    Settings,
    ClientId,
    ClientSecret,
    OauthData,
    RefreshLeaseOwner,
    RefreshLeaseUntil,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
