//! `tunwarden connect` - establish a tunnel and follow it to readiness

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use tw_core::ipc::{Intent, ObserverFrame, StatusMessage};
use tw_core::types::{Credentials, TargetSpec};

use crate::ipc::EngineClient;
use crate::output::{describe_status, print_info, print_success};

/// Connect to a country's best host or a specific host, and block until
/// the tunnel is up (exit 0) or the attempt fails (exit 1).
pub async fn connect_command(
    address: &str,
    target: &str,
    username: Option<String>,
    password: Option<String>,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let target = TargetSpec::parse(target)?;
    let credentials = resolve_credentials(username, password, password_file.as_deref())?;

    let mut client = EngineClient::connect(address).await?;
    // the first frame is always the resync; consume it so everything
    // after is a reaction to our intent
    let _resync = client.next_frame().await?;

    client.send(&Intent::connect(target, credentials)).await?;

    loop {
        match client.next_frame().await? {
            ObserverFrame::Rejection(rejection) => {
                bail!("connect refused: {}", rejection.rejected)
            }
            ObserverFrame::Status(StatusMessage::Connected { host, address }) => {
                print_success(&format!("connected to {host} ({address})"));
                return Ok(());
            }
            ObserverFrame::Status(StatusMessage::Error { message }) => {
                bail!("connect failed: {message}")
            }
            ObserverFrame::Status(status @ StatusMessage::Connecting { .. }) => {
                print_info(&describe_status(&status));
            }
            // teardown chatter from another observer's session
            ObserverFrame::Status(_) => {}
        }
    }
}

/// Resolve the credential flags into an optional credential pair.
///
/// An inline password of `-` reads the password from stdin, which keeps
/// it out of shell history and process listings.
fn resolve_credentials(
    username: Option<String>,
    password: Option<String>,
    password_file: Option<&Path>,
) -> Result<Option<Credentials>> {
    let Some(username) = username else {
        if password.is_some() || password_file.is_some() {
            bail!("--username is required when a password is supplied");
        }
        return Ok(None);
    };

    let password = match (password, password_file) {
        (Some(_), Some(_)) => bail!("--password and --password-file are mutually exclusive"),
        (Some(p), None) if p == "-" => read_password_stdin()?,
        (Some(p), None) => p,
        (None, Some(path)) => read_password_file(path)?,
        (None, None) => bail!("supply a password with --password or --password-file"),
    };
    Ok(Some(Credentials::new(username, password)))
}

fn read_password_file(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read password file {}", path.display()))?;
    let password = contents.lines().next().unwrap_or("").to_string();
    if password.is_empty() {
        bail!("password file {} is empty", path.display());
    }
    Ok(password)
}

fn read_password_stdin() -> Result<String> {
    use std::io::BufRead;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given on stdin");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_flags_means_no_credentials() {
        let creds = resolve_credentials(None, None, None).unwrap();
        assert!(creds.is_none());
    }

    #[test]
    fn inline_password_is_used_as_given() {
        let creds = resolve_credentials(Some("alice".into()), Some("hunter2".into()), None)
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn password_file_uses_first_line_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hunter2").unwrap();
        writeln!(file, "trailing junk").unwrap();

        let creds = resolve_credentials(Some("alice".into()), None, Some(file.path()))
            .unwrap()
            .unwrap();
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn empty_password_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err =
            resolve_credentials(Some("alice".into()), None, Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn password_without_username_is_rejected() {
        let err = resolve_credentials(None, Some("hunter2".into()), None).unwrap_err();
        assert!(err.to_string().contains("--username"));
    }

    #[test]
    fn two_password_sources_are_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = resolve_credentials(
            Some("alice".into()),
            Some("hunter2".into()),
            Some(file.path()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }
}
