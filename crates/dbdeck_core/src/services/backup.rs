//! Backup and restore through the engines' own command line tools.
//!
//! | engine     | backup                          | restore                     |
//! |------------|---------------------------------|-----------------------------|
//! | MySQL      | `mysqldump ... > file`          | `mysql ... < file`          |
//! | PostgreSQL | `pg_dump ... -f file`           | `psql ... -f file`          |
//! | SQLite     | `sqlite3 <path> .dump > file`   | `sqlite3 <path> < file`     |
//!
//! Passwords travel through the child's environment, never its argv. Every
//! run is bound to a cancellation token; cancelling kills the child. A failed
//! or cancelled backup removes whatever it had written.
//!
//! The tools dial the configured host and port directly, so SSH tunnels are
//! not used for backup or restore.

use crate::config::BackupTools;
use crate::error::{CoreError, CoreResult};
use crate::models::{BackupRecord, ConnectionSpec, EngineKind};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// A fully resolved tool invocation.
struct ToolInvocation {
    program: PathBuf,
    args: Vec<String>,
    /// Environment variable carrying the password, if any.
    password_env: Option<(&'static str, String)>,
    stdout_file: Option<PathBuf>,
    stdin_file: Option<PathBuf>,
}

impl ToolInvocation {
    fn new(program: &Path, args: Vec<String>) -> Self {
        Self { program: program.to_path_buf(), args, password_env: None, stdout_file: None, stdin_file: None }
    }

    fn password(mut self, var: &'static str, password: &str) -> Self {
        if !password.is_empty() {
            self.password_env = Some((var, password.to_string()));
        }
        self
    }

    fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_file = Some(path.to_path_buf());
        self
    }

    fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }

    fn tool_name(&self) -> String {
        self.program.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| {
            self.program.display().to_string()
        })
    }
}

/// Removes a finished job from the running-jobs map.
struct JobGuard<'a> {
    jobs: &'a RwLock<HashMap<String, CancellationToken>>,
    connection_id: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.jobs.write().remove(&self.connection_id);
    }
}

/// Runs dump/restore tools and tracks the running jobs.
pub struct BackupService {
    tools: BackupTools,
    jobs: RwLock<HashMap<String, CancellationToken>>,
}

impl BackupService {
    pub fn new(tools: BackupTools) -> Self {
        Self { tools, jobs: RwLock::new(HashMap::new()) }
    }

    /// Dump a connection's database to `output_path`.
    pub async fn run_backup(
        &self,
        cancel: &CancellationToken,
        spec: &ConnectionSpec,
        output_path: &Path,
    ) -> CoreResult<BackupRecord> {
        let invocation = self.backup_invocation(spec, output_path)?;
        warn_if_tunneled(spec);
        // A rejected job has not written anything; the file may belong to the running one.
        let (_guard, job_token) = self.begin_job(&spec.id, cancel)?;

        let start = Instant::now();
        tracing::info!(
            connection_id = %spec.id,
            engine = %spec.engine,
            output = %output_path.display(),
            "Starting backup"
        );

        if let Err(e) = run_tool(invocation, &job_token).await {
            if tokio::fs::try_exists(output_path).await.unwrap_or(false) {
                if let Err(remove_err) = tokio::fs::remove_file(output_path).await {
                    tracing::warn!(
                        output = %output_path.display(),
                        error = %remove_err,
                        "Failed to remove partial backup file"
                    );
                }
            }
            tracing::warn!(connection_id = %spec.id, error = %e, "Backup failed");
            return Err(e);
        }

        tracing::info!(
            connection_id = %spec.id,
            output = %output_path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Backup completed"
        );
        Ok(BackupRecord { connection_id: spec.id.clone(), output_path: output_path.to_path_buf(), timestamp: Utc::now() })
    }

    /// Load a dump file into a connection's database.
    pub async fn run_restore(&self, cancel: &CancellationToken, spec: &ConnectionSpec, input_path: &Path) -> CoreResult<()> {
        if !tokio::fs::try_exists(input_path).await.unwrap_or(false) {
            return Err(CoreError::invalid_input(format!("backup file {} does not exist", input_path.display())));
        }
        let invocation = self.restore_invocation(spec, input_path)?;
        warn_if_tunneled(spec);
        let (_guard, job_token) = self.begin_job(&spec.id, cancel)?;

        let start = Instant::now();
        tracing::info!(
            connection_id = %spec.id,
            engine = %spec.engine,
            input = %input_path.display(),
            "Starting restore"
        );

        if let Err(e) = run_tool(invocation, &job_token).await {
            tracing::warn!(connection_id = %spec.id, error = %e, "Restore failed");
            return Err(e);
        }

        tracing::info!(
            connection_id = %spec.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Restore completed"
        );
        Ok(())
    }

    /// Cancel the running backup or restore of a connection.
    ///
    /// Returns true if a job was found.
    pub fn cancel(&self, connection_id: &str) -> bool {
        match self.jobs.read().get(connection_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(connection_id = %connection_id, "Backup job cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether a backup or restore is running for the connection.
    pub fn is_running(&self, connection_id: &str) -> bool {
        self.jobs.read().contains_key(connection_id)
    }

    /// Suggested file for a new backup: `<dir>/<id>_<database>_<timestamp>.sql`.
    pub fn default_backup_path(dir: &Path, spec: &ConnectionSpec, now: DateTime<Utc>) -> PathBuf {
        let database = match spec.engine {
            EngineKind::Sqlite => Path::new(spec.database.trim())
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            _ => spec.database.trim().to_string(),
        };
        let database = if database.is_empty() { spec.engine.as_str().to_string() } else { database };
        let file_name = format!(
            "{}_{}_{}.sql",
            sanitize_file_component(&spec.id),
            sanitize_file_component(&database),
            now.format("%Y%m%d_%H%M%S")
        );
        dir.join(file_name)
    }

    fn backup_invocation(&self, spec: &ConnectionSpec, output_path: &Path) -> CoreResult<ToolInvocation> {
        let invocation = match spec.engine {
            EngineKind::MySql => {
                let mut args = network_args(spec, "-P");
                args.extend(["--single-transaction", "--routines", "--triggers", "--events"].map(String::from));
                match spec.database.trim() {
                    "" => args.push("--all-databases".to_string()),
                    db => args.push(db.to_string()),
                }
                ToolInvocation::new(&self.tools.mysqldump, args)
                    .password("MYSQL_PWD", &spec.password)
                    .stdout_to(output_path)
            }
            EngineKind::Postgres => {
                let mut args = network_args(spec, "-p");
                if !spec.database.trim().is_empty() {
                    args.extend(["-d".to_string(), spec.database.trim().to_string()]);
                }
                args.extend(["-f".to_string(), output_path.display().to_string()]);
                ToolInvocation::new(&self.tools.pg_dump, args).password("PGPASSWORD", &spec.password)
            }
            EngineKind::Sqlite => {
                let path = sqlite_path(spec)?;
                ToolInvocation::new(&self.tools.sqlite3, vec![path, ".dump".to_string()]).stdout_to(output_path)
            }
        };
        Ok(invocation)
    }

    fn restore_invocation(&self, spec: &ConnectionSpec, input_path: &Path) -> CoreResult<ToolInvocation> {
        let invocation = match spec.engine {
            // No database argument: a full dump carries its own CREATE DATABASE / USE.
            EngineKind::MySql => ToolInvocation::new(&self.tools.mysql, network_args(spec, "-P"))
                .password("MYSQL_PWD", &spec.password)
                .stdin_from(input_path),
            EngineKind::Postgres => {
                let mut args = network_args(spec, "-p");
                if !spec.database.trim().is_empty() {
                    args.extend(["-d".to_string(), spec.database.trim().to_string()]);
                }
                args.extend(
                    ["-v", "ON_ERROR_STOP=1", "-f"].map(String::from).into_iter().chain([input_path.display().to_string()]),
                );
                ToolInvocation::new(&self.tools.psql, args).password("PGPASSWORD", &spec.password)
            }
            EngineKind::Sqlite => {
                let path = sqlite_path(spec)?;
                ToolInvocation::new(&self.tools.sqlite3, vec![path]).stdin_from(input_path)
            }
        };
        Ok(invocation)
    }

    /// Register a job for the connection, or fail if one is already running.
    fn begin_job(&self, connection_id: &str, cancel: &CancellationToken) -> CoreResult<(JobGuard<'_>, CancellationToken)> {
        let job_token = cancel.child_token();
        let mut jobs = self.jobs.write();
        if jobs.contains_key(connection_id) {
            return Err(CoreError::invalid_input(format!(
                "a backup or restore is already running for connection {connection_id}"
            )));
        }
        jobs.insert(connection_id.to_string(), job_token.clone());
        Ok((JobGuard { jobs: &self.jobs, connection_id: connection_id.to_string() }, job_token))
    }
}

impl Default for BackupService {
    fn default() -> Self {
        Self::new(BackupTools::default())
    }
}

fn network_args(spec: &ConnectionSpec, port_flag: &str) -> Vec<String> {
    vec![
        "-h".to_string(),
        spec.host.trim().to_string(),
        port_flag.to_string(),
        spec.effective_port().to_string(),
        if port_flag == "-P" { "-u" } else { "-U" }.to_string(),
        spec.username.clone(),
    ]
}

fn sqlite_path(spec: &ConnectionSpec) -> CoreResult<String> {
    match spec.database.trim() {
        "" => Err(CoreError::invalid_input("SQLite database path is required")),
        path => Ok(path.to_string()),
    }
}

fn warn_if_tunneled(spec: &ConnectionSpec) {
    if spec.active_tunnel().is_some() {
        tracing::warn!(
            connection_id = %spec.id,
            host = %spec.host,
            "SSH tunnel is not used for backup/restore; connecting to the database host directly"
        );
    }
}

fn sanitize_file_component(value: &str) -> String {
    value.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' }).collect()
}

/// Spawn the tool and wait for it, killing it if the token fires first.
async fn run_tool(invocation: ToolInvocation, cancel: &CancellationToken) -> CoreResult<()> {
    let tool = invocation.tool_name();

    let mut command = Command::new(&invocation.program);
    command.args(&invocation.args).stderr(Stdio::piped()).kill_on_drop(true);
    if let Some((var, value)) = &invocation.password_env {
        command.env(var, value);
    }

    match &invocation.stdin_file {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?.into_std().await;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }
    match &invocation.stdout_file {
        Some(path) => {
            let file = tokio::fs::File::create(path).await?.into_std().await;
            command.stdout(Stdio::from(file));
        }
        None => {
            command.stdout(Stdio::null());
        }
    }

    let child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CoreError::tool_not_found(invocation.program.display().to_string()),
        _ => CoreError::backup(format!("failed to start {tool}: {e}")),
    })?;
    tracing::debug!(tool = %tool, pid = child.id(), "Tool started");

    tokio::select! {
        output = child.wait_with_output() => {
            let output = output?;
            if output.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("{tool} exited with {}", output.status)
            } else {
                format!("{tool} exited with {}: {stderr}", output.status)
            };
            Err(CoreError::backup(message))
        }
        _ = cancel.cancelled() => {
            tracing::info!(tool = %tool, "Tool cancelled");
            Err(CoreError::Cancelled)
        }
    }
}
