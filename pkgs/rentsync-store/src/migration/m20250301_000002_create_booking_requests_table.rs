use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum BookingRequests {
    Table,
    Id,
    EquipmentTitle,
    Status,
    StartDate,
    EndDate,
    CreatedAt,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000002_create_booking_requests_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BookingRequests::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BookingRequests::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(BookingRequests::EquipmentTitle)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BookingRequests::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(BookingRequests::StartDate)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BookingRequests::EndDate)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BookingRequests::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BookingRequests::Table).to_owned())
            .await
    }
}
