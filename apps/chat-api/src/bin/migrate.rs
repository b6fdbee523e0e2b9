//! Applies the embedded schema migrations.
//!
//! Usage:
//!   cargo run -p chat-api --bin chat-migrate
//!   cargo run -p chat-api --bin chat-migrate -- --test
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy). `--test`
//! targets the `<name>_test` database instead.

use std::path::Path;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

fn main() {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let mut database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL env var is required");
    if std::env::args().any(|arg| arg == "--test") {
        database_url = test_database_url(&database_url);
    }

    let mut conn =
        PgConnection::establish(&database_url).expect("failed to connect to database");

    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .expect("failed to run migrations");

    if applied.is_empty() {
        println!("Schema is up to date.");
        return;
    }
    for migration in &applied {
        println!("  applied {migration}");
    }
    println!("{} migration(s) applied.", applied.len());
}

/// `postgres://h/chat?x=y` becomes `postgres://h/chat_test?x=y`.
fn test_database_url(database_url: &str) -> String {
    let (base, query) = match database_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (database_url, None),
    };
    let Some((prefix, db_name)) = base.rsplit_once('/') else {
        return database_url.to_string();
    };
    if db_name.is_empty() || db_name.ends_with("_test") {
        return database_url.to_string();
    }

    let mut url = format!("{prefix}/{db_name}_test");
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::test_database_url;

    #[test]
    fn appends_test_suffix_once() {
        assert_eq!(
            test_database_url("postgres://u:p@localhost/chat"),
            "postgres://u:p@localhost/chat_test"
        );
        assert_eq!(
            test_database_url("postgres://localhost/chat?sslmode=disable"),
            "postgres://localhost/chat_test?sslmode=disable"
        );
        assert_eq!(
            test_database_url("postgres://localhost/chat_test"),
            "postgres://localhost/chat_test"
        );
    }
}
