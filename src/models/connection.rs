//! Database backends the gateway can front.

use std::fmt;

/// Backend engine, decided by the database URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    /// Pick the backend for a database URL.
    ///
    /// MySQL and MariaDB URLs get a dedicated message since they are the
    /// most common unsupported scheme.
    pub fn from_url(url: &str) -> Result<Self, String> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::PostgreSQL),
            "sqlite" => Ok(Self::SQLite),
            "mysql" | "mariadb" => {
                Err("MySQL is not supported; use a postgres:// or sqlite:// URL".to_string())
            }
            _ => Err(format!("Unsupported database URL scheme: {}", scheme)),
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
        })
    }
}
