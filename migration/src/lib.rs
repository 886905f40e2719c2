//! Database migrations for the integrations service.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_120000_create_connections;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2026_01_10_120000_create_connections::Migration)]
    }
}
