use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, params};
use tracing::info;

use crate::dataset::{PROMPT_COLUMN, PromptPair, RESPONSE_COLUMN};

const SQLITE_SCHEME: &str = "sqlite://";

/// Where the staging database lives, parsed from a SQLAlchemy-style URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Memory,
    File(PathBuf),
}

impl DatabaseUrl {
    /// Accepts `sqlite:///relative.db`, `sqlite:////absolute/path.db`, and
    /// `sqlite://` or `sqlite:///:memory:` for an in-memory database.
    pub fn parse(url: &str) -> Result<Self> {
        let Some(rest) = url.strip_prefix(SQLITE_SCHEME) else {
            bail!("unsupported database URL '{url}', only sqlite:// URLs are supported");
        };
        if rest.is_empty() {
            return Ok(Self::Memory);
        }
        // Everything after the third slash is the path, so an absolute path
        // ends up with four slashes in total.
        let Some(path) = rest.strip_prefix('/') else {
            bail!("malformed sqlite URL '{url}', expected sqlite:///<path>");
        };
        match path {
            "" | ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

pub struct StagingDb {
    conn: Connection,
}

impl StagingDb {
    pub fn connect(url: &str) -> Result<Self> {
        info!("Connecting to database: {url}");
        let conn = match DatabaseUrl::parse(url)? {
            DatabaseUrl::Memory => Connection::open_in_memory()?,
            DatabaseUrl::File(path) => Connection::open(&path)
                .with_context(|| format!("unable to open database {}", path.display()))?,
        };
        info!("Database connection successful!");
        Ok(Self { conn })
    }

    /// Replaces `table` with the given pairs, the same way `if_exists="replace"`
    /// would: the old table is dropped, not appended to.
    pub fn replace_table(&mut self, table: &str, pairs: &[PromptPair]) -> Result<usize> {
        let table = quote_identifier(table)?;
        info!("Saving {} rows to table: {table}", pairs.len());

        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (\"{PROMPT_COLUMN}\" TEXT, \"{RESPONSE_COLUMN}\" TEXT);"
        ))?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {table} (\"{PROMPT_COLUMN}\", \"{RESPONSE_COLUMN}\") VALUES (?1, ?2)"
            ))?;
            for pair in pairs {
                insert.execute(params![pair.prompt, pair.response])?;
            }
        }
        tx.commit()?;

        info!("Data saved to table {table} successfully!");
        Ok(pairs.len())
    }

    pub fn query_pairs(&self, table: &str) -> Result<Vec<PromptPair>> {
        let table = quote_identifier(table)?;
        info!("Querying table: {table}");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT \"{PROMPT_COLUMN}\", \"{RESPONSE_COLUMN}\" FROM {table} ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(PromptPair {
                prompt: row.get(0)?,
                response: row.get(1)?,
            })
        })?;
        let pairs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        info!("Retrieved {} rows from the database.", pairs.len());
        Ok(pairs)
    }
}

/// Table names get spliced into SQL, so we only allow plain identifiers and
/// quote them anyways.
fn quote_identifier(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!("'{name}' is not a valid table name"));
    }
    Ok(format!("\"{name}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pairs() -> Vec<PromptPair> {
        vec![
            PromptPair::new("How do I relax?", "Breathe slowly."),
            PromptPair {
                prompt: Some("Unanswered".to_owned()),
                response: None,
            },
            PromptPair::new("What's 2+2?", "4"),
        ]
    }

    #[test]
    fn test_parse_urls() {
        assert_eq!(
            DatabaseUrl::parse("sqlite:///my_database.db").unwrap(),
            DatabaseUrl::File(PathBuf::from("my_database.db"))
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite:////tmp/abs.db").unwrap(),
            DatabaseUrl::File(PathBuf::from("/tmp/abs.db"))
        );
        assert_eq!(DatabaseUrl::parse("sqlite://").unwrap(), DatabaseUrl::Memory);
        assert_eq!(
            DatabaseUrl::parse("sqlite:///:memory:").unwrap(),
            DatabaseUrl::Memory
        );
        assert!(DatabaseUrl::parse("postgresql://localhost/db").is_err());
        assert!(DatabaseUrl::parse("sqlite://host/db").is_err());
    }

    #[test]
    fn test_round_trip_preserves_order_and_nulls() {
        let mut db = StagingDb::connect("sqlite://").unwrap();
        let pairs = sample_pairs();
        assert_eq!(db.replace_table("training_data", &pairs).unwrap(), 3);
        assert_eq!(db.query_pairs("training_data").unwrap(), pairs);
    }

    #[test]
    fn test_replace_drops_previous_rows() {
        let mut db = StagingDb::connect("sqlite://").unwrap();
        db.replace_table("training_data", &sample_pairs()).unwrap();
        let replacement = vec![PromptPair::new("only", "row")];
        db.replace_table("training_data", &replacement).unwrap();
        assert_eq!(db.query_pairs("training_data").unwrap(), replacement);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:///{}", dir.path().join("staging.db").display());
        {
            let mut db = StagingDb::connect(&url).unwrap();
            db.replace_table("training_data", &sample_pairs()).unwrap();
        }
        let db = StagingDb::connect(&url).unwrap();
        assert_eq!(db.query_pairs("training_data").unwrap().len(), 3);
    }

    #[test]
    fn test_bad_table_names_are_rejected() {
        let mut db = StagingDb::connect("sqlite://").unwrap();
        assert!(db.replace_table("x; DROP TABLE y", &sample_pairs()).is_err());
        assert!(db.replace_table("1abc", &sample_pairs()).is_err());
        assert!(db.replace_table("", &sample_pairs()).is_err());
        assert!(db.query_pairs("no\"quotes").is_err());
    }

    #[test]
    fn test_querying_missing_table_is_an_error() {
        let db = StagingDb::connect("sqlite://").unwrap();
        assert!(db.query_pairs("nope").is_err());
    }
}
