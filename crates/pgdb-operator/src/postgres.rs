//! Target PostgreSQL server
//!
//! This module builds the DDL the operator issues and runs it against a
//! shared connection pool. Statements are plain text (DDL cannot take bind
//! parameters), so identifiers are checked against the unquoted-identifier
//! grammar and password literals are escaped before interpolation.

use crate::crd::is_valid_identifier;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::fmt;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

/// Default maximum pool size
pub const DEFAULT_POOL_SIZE: usize = 16;

/// One DDL statement issued by the operator
#[derive(Clone, PartialEq, Eq)]
pub enum Statement {
    CreateUser { username: String, password: String },
    CreateDatabase { database: String, owner: String },
    DropDatabase { database: String },
    DropRole { username: String },
}

impl Statement {
    /// Render the SQL text, rejecting identifiers that would need quoting
    pub fn to_sql(&self) -> Result<String> {
        match self {
            Statement::CreateUser { username, password } => Ok(format!(
                "CREATE USER {} WITH PASSWORD '{}'",
                identifier(username)?,
                escape_string_literal(password)
            )),
            Statement::CreateDatabase { database, owner } => Ok(format!(
                "CREATE DATABASE {} OWNER {}",
                identifier(database)?,
                identifier(owner)?
            )),
            Statement::DropDatabase { database } => {
                Ok(format!("DROP DATABASE {}", identifier(database)?))
            }
            Statement::DropRole { username } => Ok(format!("DROP ROLE {}", identifier(username)?)),
        }
    }

    /// What the statement does, for status messages and logs
    pub fn action(&self) -> &'static str {
        match self {
            Statement::CreateUser { .. } => "creating user",
            Statement::CreateDatabase { .. } => "creating database",
            Statement::DropDatabase { .. } => "dropping database",
            Statement::DropRole { .. } => "dropping role",
        }
    }
}

// Never print the password.
impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateUser { username, .. } => f
                .debug_struct("CreateUser")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Statement::CreateDatabase { database, owner } => f
                .debug_struct("CreateDatabase")
                .field("database", database)
                .field("owner", owner)
                .finish(),
            Statement::DropDatabase { database } => f
                .debug_struct("DropDatabase")
                .field("database", database)
                .finish(),
            Statement::DropRole { username } => {
                f.debug_struct("DropRole").field("username", username).finish()
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateUser { username, .. } => {
                write!(f, "CREATE USER {} WITH PASSWORD '***'", username)
            }
            Statement::CreateDatabase { database, owner } => {
                write!(f, "CREATE DATABASE {} OWNER {}", database, owner)
            }
            Statement::DropDatabase { database } => write!(f, "DROP DATABASE {}", database),
            Statement::DropRole { username } => write!(f, "DROP ROLE {}", username),
        }
    }
}

fn identifier(name: &str) -> Result<&str> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(OperatorError::InvalidIdentifier(name.to_string()))
    }
}

/// Double single quotes for a standard-conforming string literal
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Executes operator statements against the target server
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<()>;
}

/// A statement that failed during a best-effort sequence
#[derive(Debug)]
pub struct StatementFailure {
    pub statement: Statement,
    pub error: OperatorError,
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.statement.action(), self.error)
    }
}

/// Outcome of [`execute_best_effort`]
#[derive(Debug, Default)]
pub struct BestEffortReport {
    pub failures: Vec<StatementFailure>,
}

impl BestEffortReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// All failures, joined for a status message
    pub fn message(&self) -> String {
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Error of the first statement that failed
    pub fn into_first_error(self) -> Option<OperatorError> {
        self.failures.into_iter().next().map(|f| f.error)
    }
}

/// Run every statement in order, whether or not an earlier one failed
///
/// There is no transaction around the sequence: a failure in one step
/// neither stops nor undoes the others.
pub async fn execute_best_effort(
    executor: &dyn SqlExecutor,
    statements: Vec<Statement>,
) -> BestEffortReport {
    let mut report = BestEffortReport::default();
    for statement in statements {
        if let Err(error) = executor.execute(&statement).await {
            warn!(statement = %statement, error = %error, "Statement failed");
            report.failures.push(StatementFailure { statement, error });
        }
    }
    report
}

/// [`SqlExecutor`] backed by a deadpool connection pool
#[derive(Clone)]
pub struct PgExecutor {
    pool: Pool,
}

impl PgExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a connection URL
    pub fn connect(url: &str, max_size: usize) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| OperatorError::ConnectionFailed(format!("failed to create pool: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Round-trip to the server; used once at startup
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        let sql = statement.to_sql()?;
        debug!(statement = %statement, "Executing statement");

        let client = self.pool.get().await?;
        // CREATE/DROP DATABASE cannot run inside a transaction block, so use
        // the simple query protocol.
        client.batch_execute(&sql).await?;
        Ok(())
    }
}
