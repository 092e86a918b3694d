use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum LocalFlags {
    Table,
    Key,
    Value,
    UpdatedAt,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250302_000001_create_local_flags_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LocalFlags::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LocalFlags::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LocalFlags::Value).string().not_null())
                    .col(ColumnDef::new(LocalFlags::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LocalFlags::Table).to_owned())
            .await
    }
}
