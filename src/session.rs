use anyhow::{Context, Result};
use log::{info, warn};
use std::process::Command;

use crate::config::SessionConfig;
use crate::presence::Intent;

/// Side-effect sink for the decisions made by the presence engine
///
/// Calls are fire-and-forget: failures are logged by the implementation and never
/// reported back to the engine.
pub trait SessionController {
    fn lock(&mut self);
    fn unlock(&mut self);
    fn notify(&mut self, message: &str);
}

impl<S: SessionController + ?Sized> SessionController for &mut S {
    fn lock(&mut self) {
        (**self).lock()
    }

    fn unlock(&mut self) {
        (**self).unlock()
    }

    fn notify(&mut self, message: &str) {
        (**self).notify(message)
    }
}

/// Hand an intent to the session controller
pub fn dispatch<S: SessionController + ?Sized>(session: &mut S, intent: Intent) {
    match intent {
        Intent::Lock => session.lock(),
        Intent::Unlock => session.unlock(),
    }
}

/// Runs desktop commands for lock, unlock and notifications
pub struct CommandSession {
    lock_command: Vec<String>,
    unlock_command: Vec<String>,
    notify_command: Vec<String>,
}

impl CommandSession {
    pub fn new(config: &SessionConfig) -> Self {
        CommandSession {
            lock_command: config.lock_command.clone(),
            unlock_command: config.unlock_command.clone(),
            notify_command: config.notify_command.clone(),
        }
    }
}

impl SessionController for CommandSession {
    fn lock(&mut self) {
        if let Err(e) = run_command(&self.lock_command, None) {
            warn!("Failed to lock screen: {:#}", e);
        }
        self.notify("AuraLock locked the screen.");
        info!("Screen locked.");
    }

    fn unlock(&mut self) {
        if let Err(e) = run_command(&self.unlock_command, None) {
            warn!("Failed to unlock screen: {:#}", e);
        }
        self.notify("AuraLock unlocked the screen.");
        info!("Screen unlocked.");
    }

    fn notify(&mut self, message: &str) {
        if let Err(e) = run_command(&self.notify_command, Some(message)) {
            warn!("Failed to send notification: {:#}", e);
        }
    }
}

fn run_command(argv: &[String], extra_arg: Option<&str>) -> Result<()> {
    let (program, args) = argv.split_first().context("Command is empty")?;

    let mut command = Command::new(program);
    command.args(args);
    if let Some(arg) = extra_arg {
        command.arg(arg);
    }

    let output = command
        .output()
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} failed: {}", program, stderr.trim());
    }

    Ok(())
}

/// Action recorded by [`DryRunSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Lock,
    Unlock,
    Notify(String),
}

/// Logs and records actions without touching the desktop session
#[derive(Debug, Default)]
pub struct DryRunSession {
    actions: Vec<SessionAction>,
}

impl DryRunSession {
    pub fn new() -> Self {
        DryRunSession::default()
    }

    pub fn actions(&self) -> &[SessionAction] {
        &self.actions
    }
}

impl SessionController for DryRunSession {
    fn lock(&mut self) {
        info!("[dry-run] Screen locked.");
        self.actions.push(SessionAction::Lock);
    }

    fn unlock(&mut self) {
        info!("[dry-run] Screen unlocked.");
        self.actions.push(SessionAction::Unlock);
    }

    fn notify(&mut self, message: &str) {
        info!("[dry-run] Notification: {}", message);
        self.actions.push(SessionAction::Notify(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_maps_intents() {
        let mut session = DryRunSession::new();
        dispatch(&mut session, Intent::Lock);
        dispatch(&mut session, Intent::Unlock);
        assert_eq!(session.actions(), &[SessionAction::Lock, SessionAction::Unlock]);
    }

    #[test]
    fn test_borrowed_session_records_into_owner() {
        let mut session = DryRunSession::new();
        {
            let mut borrowed = &mut session;
            dispatch(&mut borrowed, Intent::Unlock);
            borrowed.notify("hello");
        }
        assert_eq!(
            session.actions(),
            &[SessionAction::Unlock, SessionAction::Notify("hello".to_string())]
        );
    }

    #[test]
    fn test_run_command_reports_failure() {
        assert!(run_command(&[], None).is_err());
        assert!(run_command(&["false".to_string()], None).is_err());
        assert!(run_command(&["/nonexistent/auralock-lock".to_string()], None).is_err());
    }

    #[test]
    fn test_run_command_appends_argument() {
        let argv = vec!["test".to_string(), "-n".to_string()];
        assert!(run_command(&argv, Some("message")).is_ok());
        assert!(run_command(&argv, Some("")).is_err());
    }

    #[test]
    fn test_command_session_survives_failing_commands() {
        let config = SessionConfig {
            lock_command: vec!["false".to_string()],
            unlock_command: vec!["/nonexistent/auralock-unlock".to_string()],
            notify_command: vec!["true".to_string()],
        };
        let mut session = CommandSession::new(&config);
        session.lock();
        session.unlock();
        session.notify("still running");
    }
}
