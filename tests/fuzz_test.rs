//! Black-box fuzzing of input handling.
//!
//! Random, malicious and edge-case inputs go through identifier
//! validation, statement building, shard routing and connection URL
//! parsing. Nothing may panic, and nothing unvalidated may reach SQL text.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use unidb::db::{SqlBuilder, dialect_for, validate_identifier};
use unidb::models::{ConnectionConfig, DatabaseType, PageRequest, Row};
use unidb::shard::{shard_index, shard_key_string};

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate various edge-case strings
fn edge_case_strings() -> Vec<String> {
    vec![
        String::new(),                           // Empty
        " ".to_string(),                         // Single space
        "\n\r\t".to_string(),                    // Whitespace chars
        "\0".to_string(),                        // Null byte
        "üöÄ".repeat(100),                        // Unicode
        "'OR 1=1--".to_string(),                 // SQL injection
        "'; DROP TABLE users--".to_string(),     // SQL injection
        "users; DELETE FROM users".to_string(),  // Stacked statement
        "\"users\"".to_string(),                 // Pre-quoted
        "a.b.c".to_string(),                     // Too many parts
        "1abc".to_string(),                      // Leading digit
        "../../etc/passwd".to_string(),          // Path traversal
        "a".repeat(10000),                       // Very long string
        random_string(100),
        "\u{0000}\u{FFFF}".to_string(), // Special unicode
        "1' UNION SELECT NULL, NULL--".to_string(),
        "{{7*7}}".to_string(), // Template injection
    ]
}

const SQL_TYPES: [DatabaseType; 5] = [
    DatabaseType::PostgreSQL,
    DatabaseType::MySQL,
    DatabaseType::SQLite,
    DatabaseType::SqlServer,
    DatabaseType::Oracle,
];

#[test]
fn fuzz_identifiers_never_reach_sql_unvalidated() {
    for db_type in SQL_TYPES {
        let builder = SqlBuilder::new(dialect_for(db_type).unwrap());
        for name in edge_case_strings() {
            let valid = validate_identifier(&name).is_ok();
            let mut record = Row::new();
            record.insert(name.clone(), json!(1));

            // Table position
            assert_eq!(builder.select_where(&name, "id", &json!(1)).is_ok(), valid);
            // Column position
            assert_eq!(builder.insert("t", &record).is_ok(), valid);
            let request = PageRequest::new(1, 10).filter(name.clone(), "x");
            assert_eq!(builder.count("t", &request).is_ok(), valid, "{name:?}");
        }
    }
}

#[test]
fn fuzz_random_identifiers() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let len = rng.gen_range(0..80);
        let name: String = (0..len)
            .map(|_| char::from(rng.gen_range(0x20u8..0x7f)))
            .collect();
        let expected = !name.is_empty()
            && name.split('.').count() <= 2
            && name.split('.').all(|part| {
                part.chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        assert_eq!(validate_identifier(&name).is_ok(), expected, "{name:?}");
    }
}

#[test]
fn fuzz_search_term_is_always_bound() {
    for db_type in SQL_TYPES {
        let builder = SqlBuilder::new(dialect_for(db_type).unwrap());
        for term in edge_case_strings() {
            let statement = builder
                .search("t", &["name".to_string()], &term, "id", 10)
                .unwrap();
            if !term.trim().is_empty() && term.len() > 3 {
                assert!(!statement.sql.contains(&term), "{term:?} leaked into SQL");
            }
            assert!(!statement.params.is_empty());
        }
    }
}

#[test]
fn fuzz_shard_routing_stays_in_range() {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let key = random_string(rng.gen_range(0..64));
        let count = rng.gen_range(1..64);
        let index = shard_index(&key, count);
        assert!(index < count);
        assert_eq!(shard_index(&key, count), index);
    }
    for key in edge_case_strings() {
        assert!(shard_index(&key, 7) < 7);
        assert!(shard_key_string(&json!(key)).is_ok());
    }
    assert!(shard_key_string(&json!(null)).is_err());
}

#[test]
fn fuzz_connection_urls() {
    let schemes = ["postgres", "mysql", "sqlite", "mssql", "oracle", "mongodb", "nope", ""];
    for scheme in schemes {
        for tail in edge_case_strings() {
            // Must not panic; errors are fine
            let _ = ConnectionConfig::from_url(&format!("{scheme}://{tail}"));
            let _ = ConnectionConfig::from_url(&format!("{scheme}:{tail}"));
        }
    }
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let port: u32 = rng.gen_range(0..200_000);
        let url = format!("postgres://u:p@host:{port}/db");
        let parsed = ConnectionConfig::from_url(&url);
        assert_eq!(parsed.is_ok(), port <= 65_535, "{url}");
    }
}
