use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fsmonitor_daemon::{QueryReply, TRIVIAL_MARKER};
use tempfile::NamedTempFile;
use tracing::debug;

use super::CommandBase;

pub async fn query(base: &CommandBase, token: Option<&str>) -> Result<i32> {
    let reply = base.client().query(token).await?;
    print!("{}", render(&reply));
    Ok(0)
}

/// Queries with the token kept in the metadata directory and replaces it
/// with the one the daemon hands back.
pub async fn query_index(base: &CommandBase) -> Result<i32> {
    let token_file = base.paths.token_file();
    let token = read_token(&token_file)?;
    debug!("last token: {:?}", token);

    let reply = base.client().query(token.as_deref()).await?;
    write_token(&token_file, &reply.token)?;
    print!("{}", render(&reply));
    Ok(0)
}

pub async fn flush(base: &CommandBase) -> Result<i32> {
    base.client().flush().await?;
    Ok(0)
}

fn render(reply: &QueryReply) -> String {
    let mut out = format!("{}\n", reply.token);
    match &reply.paths {
        None => {
            out.push_str(TRIVIAL_MARKER);
            out.push('\n');
        }
        Some(paths) => {
            for path in paths {
                out.push_str(path);
                out.push('\n');
            }
        }
    }
    out
}

/// A missing or empty file means there is no token yet.
fn read_token(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("unable to read token file {path}")),
    }
}

/// Readers see either the old token or the new one, never a partial write.
fn write_token(path: &Utf8Path, token: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("token file {path} has no parent directory"))?;
    let mut file = NamedTempFile::new_in(dir)?;
    writeln!(file, "{token}")?;
    file.persist(path)
        .with_context(|| format!("unable to write token file {path}"))?;
    Ok(())
}
