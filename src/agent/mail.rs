//! Job mail notifications
//!
//! One-shot delivery through the configured external mailer. Runs the
//! mailer as a child process and never holds a domain lock; the reap task
//! is detached so a slow mailer cannot stall anything.

use std::path::PathBuf;
use tracing::{debug, warn};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailReason {
    Begin,
    End,
    Fail,
    Requeue,
}

impl MailReason {
    fn subject(&self, job_id: u32, job_name: &str) -> String {
        let what = match self {
            MailReason::Begin => "Began",
            MailReason::End => "Ended",
            MailReason::Fail => "Failed",
            MailReason::Requeue => "Requeued",
        };
        format!("Job {job_id} ({job_name}) {what}")
    }
}

/// External mailer front-end.
#[derive(Debug, Clone)]
pub struct Mailer {
    mail_prog: PathBuf,
}

impl Mailer {
    pub fn new(mail_prog: PathBuf) -> Self {
        Mailer { mail_prog }
    }

    /// Fire a notification for a job. Failures are logged, never surfaced;
    /// mail is best-effort.
    pub fn notify(&self, job_id: u32, job_name: &str, user: &str, reason: MailReason) {
        let subject = reason.subject(job_id, job_name);
        debug!(job_id, user, %subject, "sending mail notification");

        let mut cmd = tokio::process::Command::new(&self.mail_prog);
        cmd.arg("-s").arg(&subject).arg(user);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        match cmd.spawn() {
            Ok(mut child) => {
                // Reap in the background so no zombie outlives us.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => warn!(job_id, error = %e, "mail program failed to start"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_names_the_event() {
        assert_eq!(
            MailReason::End.subject(42, "build"),
            "Job 42 (build) Ended"
        );
        assert_eq!(
            MailReason::Requeue.subject(7, "sim"),
            "Job 7 (sim) Requeued"
        );
    }
}
