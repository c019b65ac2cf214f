use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_customers_table::Migration),
            Box::new(m20240601_000002_create_products_table::Migration),
            Box::new(m20240601_000003_create_sales_orders_table::Migration),
            Box::new(m20240601_000004_create_order_items_table::Migration),
            Box::new(m20240601_000005_create_invoices_table::Migration),
            Box::new(m20240601_000006_create_inventory_logs_table::Migration),
            Box::new(m20240601_000007_create_notifications_table::Migration),
            Box::new(m20240601_000008_create_jobs_table::Migration),
            Box::new(m20240601_000009_create_number_sequences_table::Migration),
        ]
    }
}

#[derive(DeriveIden)]
enum Customers {
    Table,
    Id,
    Name,
    Email,
    Phone,
    Company,
    Address,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Products {
    Table,
    Id,
    Sku,
    Name,
    Description,
    Price,
    Cost,
    StockQuantity,
    LowStockThreshold,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SalesOrders {
    Table,
    Id,
    OrderNumber,
    CustomerId,
    UserId,
    Status,
    Subtotal,
    TaxRate,
    TaxAmount,
    Discount,
    Total,
    Notes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OrderItems {
    Table,
    Id,
    OrderId,
    ProductId,
    Position,
    Quantity,
    UnitPrice,
    Discount,
    Total,
}

#[derive(DeriveIden)]
enum Invoices {
    Table,
    Id,
    InvoiceNumber,
    CustomerId,
    OrderId,
    Status,
    Subtotal,
    TaxAmount,
    Discount,
    Total,
    IssueDate,
    DueDate,
    PaidDate,
    Notes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum InventoryLogs {
    Table,
    Id,
    ProductId,
    QuantityChange,
    Reason,
    Reference,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Notifications {
    Table,
    Id,
    Kind,
    Title,
    Message,
    UserId,
    Metadata,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Queue,
    Name,
    Payload,
    Priority,
    State,
    Progress,
    AttemptsMade,
    MaxAttempts,
    BackoffBaseMs,
    RunAt,
    LastError,
    ReturnValue,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    FinishedAt,
}

#[derive(DeriveIden)]
enum NumberSequences {
    Table,
    Name,
    CurrentValue,
}

fn money(col: impl IntoIden) -> ColumnDef {
    ColumnDef::new(col)
        .decimal_len(14, 2)
        .not_null()
        .default(0)
        .to_owned()
}

mod m20240601_000001_create_customers_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_customers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Customers::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Customers::Name).string().not_null())
                        .col(
                            ColumnDef::new(Customers::Email)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Customers::Phone).string().null())
                        .col(ColumnDef::new(Customers::Company).string().null())
                        .col(ColumnDef::new(Customers::Address).string().null())
                        .col(
                            ColumnDef::new(Customers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Customers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000002_create_products_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Products::Sku)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Description).text().null())
                        .col(money(Products::Price))
                        .col(money(Products::Cost))
                        .col(
                            ColumnDef::new(Products::StockQuantity)
                                .integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(Products::StockQuantity).gte(0)),
                        )
                        .col(
                            ColumnDef::new(Products::LowStockThreshold)
                                .integer()
                                .not_null()
                                .default(10),
                        )
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_is_active")
                        .table(Products::Table)
                        .col(Products::IsActive)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000003_create_sales_orders_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_sales_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SalesOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(SalesOrders::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(SalesOrders::UserId).string().not_null())
                        .col(
                            ColumnDef::new(SalesOrders::Status)
                                .string_len(16)
                                .not_null()
                                .default("DRAFT"),
                        )
                        .col(money(SalesOrders::Subtotal))
                        .col(
                            ColumnDef::new(SalesOrders::TaxRate)
                                .decimal_len(7, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(money(SalesOrders::TaxAmount))
                        .col(money(SalesOrders::Discount))
                        .col(money(SalesOrders::Total))
                        .col(ColumnDef::new(SalesOrders::Notes).text().null())
                        .col(
                            ColumnDef::new(SalesOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sales_orders_customer")
                                .from(SalesOrders::Table, SalesOrders::CustomerId)
                                .to(Customers::Table, Customers::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_orders_customer_id")
                        .table(SalesOrders::Table)
                        .col(SalesOrders::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_orders_status")
                        .table(SalesOrders::Table)
                        .col(SalesOrders::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SalesOrders::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000004_create_order_items_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderItems::Position)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OrderItems::Quantity)
                                .integer()
                                .not_null()
                                .check(Expr::col(OrderItems::Quantity).gte(1)),
                        )
                        .col(money(OrderItems::UnitPrice))
                        .col(money(OrderItems::Discount))
                        .col(money(OrderItems::Total))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(SalesOrders::Table, SalesOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_product")
                                .from(OrderItems::Table, OrderItems::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000005_create_invoices_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_invoices_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Invoices::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Invoices::InvoiceNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Invoices::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(Invoices::OrderId).uuid().null())
                        .col(
                            ColumnDef::new(Invoices::Status)
                                .string_len(16)
                                .not_null()
                                .default("DRAFT"),
                        )
                        .col(money(Invoices::Subtotal))
                        .col(money(Invoices::TaxAmount))
                        .col(money(Invoices::Discount))
                        .col(money(Invoices::Total))
                        .col(
                            ColumnDef::new(Invoices::IssueDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::DueDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::PaidDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Invoices::Notes).text().null())
                        .col(
                            ColumnDef::new(Invoices::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Invoices::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_customer")
                                .from(Invoices::Table, Invoices::CustomerId)
                                .to(Customers::Table, Customers::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_order")
                                .from(Invoices::Table, Invoices::OrderId)
                                .to(SalesOrders::Table, SalesOrders::Id)
                                .on_delete(ForeignKeyAction::SetNull),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_status_due_date")
                        .table(Invoices::Table)
                        .col(Invoices::Status)
                        .col(Invoices::DueDate)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_order_id")
                        .table(Invoices::Table)
                        .col(Invoices::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Invoices::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000006_create_inventory_logs_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000006_create_inventory_logs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryLogs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryLogs::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryLogs::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(InventoryLogs::QuantityChange)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryLogs::Reason).string().not_null())
                        .col(ColumnDef::new(InventoryLogs::Reference).string().null())
                        .col(
                            ColumnDef::new(InventoryLogs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_inventory_logs_product")
                                .from(InventoryLogs::Table, InventoryLogs::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_logs_product_id")
                        .table(InventoryLogs::Table)
                        .col(InventoryLogs::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_logs_reference")
                        .table(InventoryLogs::Table)
                        .col(InventoryLogs::Reference)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryLogs::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000007_create_notifications_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000007_create_notifications_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Notifications::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Notifications::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Notifications::Kind).string_len(32).not_null())
                        .col(ColumnDef::new(Notifications::Title).string().not_null())
                        .col(ColumnDef::new(Notifications::Message).text().not_null())
                        .col(ColumnDef::new(Notifications::UserId).string().null())
                        .col(ColumnDef::new(Notifications::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Notifications::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_notifications_user_created")
                        .table(Notifications::Table)
                        .col(Notifications::UserId)
                        .col(Notifications::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Notifications::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000008_create_jobs_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000008_create_jobs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Jobs::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Jobs::Id).string().primary_key().not_null())
                        .col(ColumnDef::new(Jobs::Queue).string().not_null())
                        .col(ColumnDef::new(Jobs::Name).string().not_null())
                        .col(ColumnDef::new(Jobs::Payload).json().not_null())
                        .col(
                            ColumnDef::new(Jobs::Priority)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Jobs::State).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Jobs::Progress)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Jobs::AttemptsMade)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Jobs::MaxAttempts)
                                .integer()
                                .not_null()
                                .default(3),
                        )
                        .col(
                            ColumnDef::new(Jobs::BackoffBaseMs)
                                .big_integer()
                                .not_null()
                                .default(2000),
                        )
                        .col(
                            ColumnDef::new(Jobs::RunAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Jobs::LastError).text().null())
                        .col(ColumnDef::new(Jobs::ReturnValue).json().null())
                        .col(
                            ColumnDef::new(Jobs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Jobs::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Jobs::StartedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Jobs::FinishedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_jobs_claim")
                        .table(Jobs::Table)
                        .col(Jobs::Queue)
                        .col(Jobs::State)
                        .col(Jobs::RunAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Jobs::Table).to_owned())
                .await
        }
    }
}

mod m20240601_000009_create_number_sequences_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000009_create_number_sequences_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(NumberSequences::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(NumberSequences::Name)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(NumberSequences::CurrentValue)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .to_owned(),
                )
                .await?;

            let seed = Query::insert()
                .into_table(NumberSequences::Table)
                .columns([NumberSequences::Name, NumberSequences::CurrentValue])
                .values([
                    "sales_order".into(),
                    0i64.into(),
                ])
                .and_then(|q| {
                    q.values([
                        "invoice".into(),
                        0i64.into(),
                    ])
                })
                .map_err(|e| DbErr::Migration(e.to_string()))?
                .to_owned();

            manager.exec_stmt(seed).await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(NumberSequences::Table).to_owned())
                .await
        }
    }
}
