//! Local command console on stdin. One command per line.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use dbs_core::{
    PeerCore, ReclaimAction, TriggerBackupAction, TriggerDeleteAction, TriggerRestoreAction,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub const USAGE: &str =
    "commands: BACKUP <path> <degree> | RESTORE <path> | DELETE <path> | RECLAIM <bytes> | STATE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Backup { path: PathBuf, degree: u8 },
    Restore(PathBuf),
    Delete(PathBuf),
    /// New storage limit in bytes; 0 gives up every stored chunk.
    Reclaim(u64),
    State,
}

/// Parse one console line. The verb is case-insensitive; paths may contain spaces.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };
    match verb.to_ascii_uppercase().as_str() {
        "BACKUP" => {
            let (path, degree) = rest.rsplit_once(char::is_whitespace)?;
            let path = path.trim();
            if path.is_empty() {
                return None;
            }
            Some(Command::Backup {
                path: path.into(),
                degree: degree.parse().ok()?,
            })
        }
        "RESTORE" if !rest.is_empty() => Some(Command::Restore(rest.into())),
        "DELETE" if !rest.is_empty() => Some(Command::Delete(rest.into())),
        "RECLAIM" => rest.parse().ok().map(Command::Reclaim),
        "STATE" if rest.is_empty() => Some(Command::State),
        _ => None,
    }
}

/// Start the command. Backup and restore run in the background; the returned line is printed.
pub fn run(core: &Arc<PeerCore>, cmd: Command) -> String {
    match cmd {
        Command::Backup { path, degree } => {
            match TriggerBackupAction::new(core.clone(), &path, degree) {
                Ok(action) => {
                    let line = format!(
                        "backing up {} as {} ({} chunks)",
                        path.display(),
                        action.file_id(),
                        action.chunk_count()
                    );
                    core.executor.execute(action);
                    line
                }
                Err(e) => format!("backup failed: {e}"),
            }
        }
        Command::Restore(path) => match TriggerRestoreAction::new(core.clone(), &path) {
            Ok(action) => {
                core.executor.spawn(async move {
                    if let Ok(out) = action.execute().await {
                        println!("restored to {}", out.display());
                    }
                });
                format!("restoring {}", path.display())
            }
            Err(e) => format!("restore failed: {e}"),
        },
        Command::Delete(path) => match TriggerDeleteAction::new(core.clone(), &path) {
            Ok(action) => {
                let id = action.file_id();
                action.delete();
                format!("delete sent for {id}")
            }
            Err(e) => format!("delete failed: {e}"),
        },
        Command::Reclaim(max_bytes) => {
            let evicted = ReclaimAction::new(core.clone(), max_bytes).reclaim();
            format!("limit set to {max_bytes} bytes, {} chunks removed", evicted.len())
        }
        Command::State => state_report(core),
    }
}

/// Files this peer backed up and chunks it stores for others.
pub fn state_report(core: &PeerCore) -> String {
    let mut out = String::new();
    let mut files = core.backed_up.files();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let _ = writeln!(out, "backed up files: {}", files.len());
    for f in &files {
        let _ = writeln!(
            out,
            "  {} id={} chunks={} degree={}",
            f.path.display(),
            f.file_id,
            f.chunk_count,
            f.replication_degree
        );
    }
    let records = core.stored_chunks.records();
    let _ = writeln!(out, "stored chunks: {}", records.len());
    for (id, n, r) in &records {
        let _ = writeln!(
            out,
            "  {id} #{n} size={} degree={}/{}",
            r.size,
            r.perceived_degree(),
            r.desired_degree
        );
    }
    match core.store.used_bytes() {
        Ok(used) => match core.storage_limit() {
            Some(limit) => {
                let _ = write!(out, "storage: {used} / {limit} bytes");
            }
            None => {
                let _ = write!(out, "storage: {used} bytes (unlimited)");
            }
        },
        Err(e) => {
            let _ = write!(out, "storage: unknown ({e})");
        }
    }
    out
}

/// Read commands from stdin until EOF.
pub async fn run_console(core: Arc<PeerCore>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse(&line) {
            Some(cmd) => {
                info!(command = ?cmd, "console");
                println!("{}", run(&core, cmd));
            }
            None => {
                warn!(line = %line, "unknown command");
                println!("{USAGE}");
            }
        }
    }
    Ok(())
}
