//! # Feature: Relational Store
//!
//! Generic helpers over a single SQLite connection. Table and column names are
//! quoted as identifiers and every value is bound as a parameter, so nothing
//! from callers is ever spliced into the SQL text. Multiple conditions are
//! joined with `AND`.

use anyhow::{bail, Result};
use log::{debug, info};
use sqlite::{Connection, State, Statement, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One result row, column name to value
pub type Row = BTreeMap<String, Value>;

#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub async fn new(database_path: &str) -> Result<Self> {
        let connection = sqlite::open(database_path)?;
        let db = Database {
            connection: Arc::new(Mutex::new(connection)),
        };

        db.ensure_base_tables().await?;
        info!("Database initialized at: {database_path}");
        Ok(db)
    }

    /// No tables are required yet; features create what they use
    pub async fn ensure_base_tables(&self) -> Result<()> {
        Ok(())
    }

    /// Run raw SQL without parameters, for schema statements
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(sql)?;
        Ok(())
    }

    /// `SELECT columns FROM table WHERE conditions`; no columns selects `*`
    pub async fn get(
        &self,
        table: &str,
        columns: &[&str],
        conditions: &[(&str, Value)],
    ) -> Result<Vec<Row>> {
        let columns = if columns.is_empty() || columns == ["*"] {
            "*".to_string()
        } else {
            columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ")
        };
        let query = format!(
            "SELECT {} FROM {}{}",
            columns,
            quote_identifier(table),
            where_clause(conditions)
        );
        debug!("{}", query);

        let conn = self.connection.lock().await;
        let mut statement = conn.prepare(&query)?;
        bind_all(&mut statement, 1, conditions)?;
        read_rows(&mut statement)
    }

    /// `UPDATE table SET values WHERE column = value`.
    ///
    /// With `returning`, the named column of the first updated row is read
    /// back through `RETURNING`, so it reflects the new values.
    pub async fn update(
        &self,
        table: &str,
        condition: (&str, Value),
        values: &[(&str, Value)],
        returning: Option<&str>,
    ) -> Result<Option<Value>> {
        if values.is_empty() {
            bail!("Update of {} without any values", table);
        }
        let assignments = values
            .iter()
            .map(|(column, _)| format!("{} = ?", quote_identifier(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let conditions = [condition];
        let returning_clause = returning
            .map(|column| format!(" RETURNING {}", quote_identifier(column)))
            .unwrap_or_default();
        let query = format!(
            "UPDATE {} SET {}{}{}",
            quote_identifier(table),
            assignments,
            where_clause(&conditions),
            returning_clause
        );
        debug!("{}", query);

        let conn = self.connection.lock().await;
        let mut statement = conn.prepare(&query)?;
        bind_all(&mut statement, 1, values)?;
        bind_all(&mut statement, values.len() + 1, &conditions)?;

        let mut returned = None;
        while let State::Row = statement.next()? {
            if returned.is_none() && returning.is_some() {
                returned = Some(statement.read::<Value, _>(0)?);
            }
        }
        Ok(returned)
    }

    pub async fn exists(&self, table: &str, condition: (&str, Value)) -> Result<bool> {
        let conditions = [condition];
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM {}{} LIMIT 1)",
            quote_identifier(table),
            where_clause(&conditions)
        );

        let conn = self.connection.lock().await;
        let mut statement = conn.prepare(&query)?;
        bind_all(&mut statement, 1, &conditions)?;
        if let State::Row = statement.next()? {
            Ok(statement.read::<i64, _>(0)? != 0)
        } else {
            Ok(false)
        }
    }

    /// Delete matching rows, returning how many went away
    pub async fn delete(&self, table: &str, conditions: &[(&str, Value)]) -> Result<usize> {
        if conditions.is_empty() {
            bail!("Refusing to delete from {} without conditions", table);
        }
        let query = format!(
            "DELETE FROM {}{}",
            quote_identifier(table),
            where_clause(conditions)
        );
        debug!("{}", query);

        let conn = self.connection.lock().await;
        {
            let mut statement = conn.prepare(&query)?;
            bind_all(&mut statement, 1, conditions)?;
            while statement.next()? != State::Done {}
        }
        Ok(conn.change_count())
    }

    pub async fn insert(&self, table: &str, values: &[(&str, Value)]) -> Result<()> {
        if values.is_empty() {
            bail!("Insert into {} without any values", table);
        }
        let columns = values
            .iter()
            .map(|(column, _)| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; values.len()].join(", ");
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            columns,
            placeholders
        );
        debug!("{}", query);

        let conn = self.connection.lock().await;
        let mut statement = conn.prepare(&query)?;
        bind_all(&mut statement, 1, values)?;
        while statement.next()? != State::Done {}
        Ok(())
    }
}

/// Quote an SQL identifier, doubling embedded quotes
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn where_clause(conditions: &[(&str, Value)]) -> String {
    if conditions.is_empty() {
        return String::new();
    }
    let parts = conditions
        .iter()
        .map(|(column, _)| format!("{} = ?", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" WHERE {}", parts)
}

fn bind_all(statement: &mut Statement<'_>, first_index: usize, values: &[(&str, Value)]) -> Result<()> {
    for (offset, (_, value)) in values.iter().enumerate() {
        statement.bind((first_index + offset, value))?;
    }
    Ok(())
}

fn read_rows(statement: &mut Statement<'_>) -> Result<Vec<Row>> {
    let names: Vec<String> = statement.column_names().to_vec();
    let mut rows = Vec::new();
    while let State::Row = statement.next()? {
        let mut row = Row::new();
        for (index, name) in names.iter().enumerate() {
            row.insert(name.clone(), statement.read::<Value, _>(index)?);
        }
        rows.push(row);
    }
    Ok(rows)
}
