//! Mail delivery through an external script.
//!
//! The script is called as `script <subject> <body> <mime-type> <receiver>`.
//! Its exit status is logged; only failures to start it are reported back.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::db::Db;

pub const DEFAULT_MAIL_SCRIPT: &str = "/usr/local/bin/p4d-mail.sh";

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_HTML: &str = "text/html";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("no mail script configured")]
    MissingScript,
    #[error("mail script {0} not found")]
    ScriptNotFound(String),
    #[error("no receiver configured")]
    MissingReceiver,
    #[error("failed to run mail script: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("mail configuration unavailable: {0}")]
    Config(String),
}

/// Run `script` for one mail.
pub async fn run_mail_script(
    script: &str,
    receiver: &str,
    subject: &str,
    body: &str,
    mime: &str,
) -> Result<(), MailError> {
    if script.trim().is_empty() {
        return Err(MailError::MissingScript);
    }
    if !Path::new(script).exists() {
        return Err(MailError::ScriptNotFound(script.to_string()));
    }
    if receiver.trim().is_empty() {
        return Err(MailError::MissingReceiver);
    }

    let status = Command::new(script)
        .arg(subject)
        .arg(body)
        .arg(mime)
        .arg(receiver)
        .stdin(Stdio::null())
        .status()
        .await?;

    if status.success() {
        info!(receiver, subject, "mail sent");
    } else {
        warn!(receiver, subject, %status, "mail script returned failure");
    }
    Ok(())
}

/// Send a mail using the `mailScript` config item.
pub async fn send_mail(db: &Db, receiver: &str, subject: &str, body: &str, mime: &str) -> Result<(), MailError> {
    let script = db
        .get_config_item("mailScript", DEFAULT_MAIL_SCRIPT)
        .await
        .map_err(|e| MailError::Config(format!("{e:#}")))?;
    run_mail_script(&script, receiver, subject, body, mime).await
}

// ===========================================================================
// Tests
// ===========================================================================
