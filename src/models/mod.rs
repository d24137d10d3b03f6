use diesel_migrations::{embed_migrations, EmbeddedMigrations};

mod schema;
pub mod user;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
