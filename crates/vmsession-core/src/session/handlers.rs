//! Session actions.
//!
//! Each action reports `doing`/`done` against the bound progress tree and
//! returns `ActionError` on failure. Failures are not left to the worker:
//! the wrapper built by [`action`] hands them to `error_occurred`, which
//! reroutes the session through the Error state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use super::heal::HealTracker;
use crate::domain::{HvStatus, SessionId, SessionState};
use crate::fsm::{lock, ActionContext, ActionError};
use crate::ports::{exec_with_retry, parse_key_values, Clock, DownloadProvider, HypervisorControl};
use crate::progress::{FiniteTask, ProgressTask, VariableTask};

/// Last error a session went through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFault {
    pub message: String,
    pub code: i32,
    pub at: DateTime<Utc>,
}

/// Everything the actions need; owned jointly by the session and the
/// actions registered in its graph.
pub(crate) struct SessionCore {
    pub id: SessionId,
    pub config: SessionConfig,
    pub hypervisor: Arc<dyn HypervisorControl>,
    pub downloads: Arc<dyn DownloadProvider>,
    pub clock: Arc<dyn Clock>,
    pub runtime: tokio::runtime::Handle,
    pub heal: Mutex<HealTracker>,
    pub last_error: Mutex<Option<SessionFault>>,
    pub boot_medium: Mutex<Option<PathBuf>>,
}

/// Keep the code of a failure but replace its message.
fn describe(err: ActionError, message: &str) -> ActionError {
    match err {
        ActionError::Failed { code, .. } => ActionError::failed(message, code),
        other => other,
    }
}

/// Cache entry of `url`: a short URL digest plus the last path segment.
pub(crate) fn media_path(cache_dir: &Path, url: &str) -> PathBuf {
    let digest = hex::encode(&Sha256::digest(url.as_bytes())[..8]);
    let name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("boot-medium");
    cache_dir.join(format!("{digest}-{name}"))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut raw = dest.as_os_str().to_owned();
    raw.push(".part");
    PathBuf::from(raw)
}

/// Build the node action for `state`.
pub(crate) fn action(
    core: &Arc<SessionCore>,
    state: SessionState,
) -> impl Fn(&ActionContext) -> Result<(), ActionError> + Send + Sync + 'static + use<> {
    let core = Arc::clone(core);
    move |ctx: &ActionContext| {
        let result = match state {
            SessionState::Initialize => core.initialize(ctx),
            SessionState::UpdateSession => core.update_session(ctx),
            SessionState::HandleError => core.handle_error(ctx),
            SessionState::CureError => core.cure_error(ctx),
            SessionState::CreateVm => core.create_vm(ctx),
            SessionState::ConfigureVm => core.configure_vm(ctx),
            SessionState::DownloadMedia => core.download_media(ctx),
            SessionState::PrepareBootMedium => core.prepare_boot_medium(ctx),
            SessionState::ReleaseBootMedium => core.release_boot_medium(ctx),
            SessionState::DestroyVm => core.destroy_vm(ctx),
            SessionState::PowerOffVm => core.simple(ctx, &["controlvm", "poweroff"], "Powering VM off", "VM powered off"),
            SessionState::DiscardState => core.simple(ctx, &["discardstate"], "Discarding saved VM state", "Saved VM state discarded"),
            SessionState::Fatal => core.fatal(ctx),
            SessionState::StartVm => core.simple(ctx, &["startvm"], "Starting VM", "VM started"),
            SessionState::SaveState => core.simple(ctx, &["controlvm", "savestate"], "Saving VM state", "VM state saved"),
            SessionState::PauseVm => core.simple(ctx, &["controlvm", "pause"], "Pausing the VM", "VM paused"),
            SessionState::ResumeVm => core.simple(ctx, &["controlvm", "resume"], "Resuming VM", "VM resumed"),
            _ => Ok(()),
        };
        match result {
            Err(ActionError::Failed { message, code }) => {
                core.error_occurred(ctx, &message, code);
                Ok(())
            }
            other => other,
        }
    }
}

impl SessionCore {
    fn exec(&self, ctx: &ActionContext, args: &[&str]) -> Result<Vec<String>, ActionError> {
        exec_with_retry(self.hypervisor.as_ref(), args, &self.config.exec_retry, ctx)
    }

    /// Fail the current run, skew through Error and decide whether the
    /// session is still worth healing.
    pub fn error_occurred(&self, ctx: &ActionContext, message: &str, code: i32) {
        let now = self.clock.now();
        warn!(session = %self.id, state = ctx.state(), code, error = message, "session error");
        *lock(&self.last_error) = Some(SessionFault {
            message: message.to_string(),
            code,
            at: now,
        });

        ctx.fail(message, code);
        ctx.skew(SessionState::Error.id());

        let give_up = lock(&self.heal).record(
            now,
            self.config.heal_threshold(),
            self.config.heal_tries,
        );
        if give_up {
            warn!(session = %self.id, "too many errors; won't try to heal them again");
            ctx.goto(SessionState::Fatal.id());
        }
    }

    fn initialize(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Initializing session");
        ctx.checkpoint()?;
        info!(session = %self.id, vm = %self.config.name, "session initialized");
        ctx.done("Session initialized");
        Ok(())
    }

    fn update_session(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Loading session information");
        let real = match self.hypervisor.exec(&["showvminfo", &self.config.name]) {
            Err(HvStatus::NotFound) => Some(SessionState::Destroyed),
            Err(status) => return Err(status.into()),
            Ok(lines) => {
                let info = parse_key_values(&lines, ':');
                match info.get("State").map(String::as_str) {
                    Some(s) if s.contains("running") => Some(SessionState::Running),
                    Some(s) if s.contains("paused") => Some(SessionState::Paused),
                    Some(s) if s.contains("saved") => Some(SessionState::Saved),
                    Some(s) if s.contains("aborted") || s.contains("powered off") => {
                        Some(SessionState::PoweredOff)
                    }
                    Some(s) => {
                        warn!(session = %self.id, state = s, "unknown VM state");
                        None
                    }
                    None => {
                        warn!(session = %self.id, "missing VM state information");
                        None
                    }
                }
            }
        };

        ctx.done("Session updated");
        if let Some(real) = real {
            debug!(session = %self.id, ?real, "hypervisor reports");
            ctx.skew(real.id());
        }
        Ok(())
    }

    fn handle_error(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Handling error");
        ctx.done("Error handled");
        Ok(())
    }

    fn cure_error(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Curing error");
        ctx.done("Error cured");
        Ok(())
    }

    fn create_vm(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Creating Virtual Machine");
        let lines = match self.exec(ctx, &["createvm", &self.config.name]) {
            Ok(lines) => lines,
            Err(ActionError::Failed { code, .. }) if code == HvStatus::AlreadyExists.code() => {
                debug!(session = %self.id, "VM already registered; reusing it");
                ctx.done("Virtual Machine reused");
                return Ok(());
            }
            Err(err) => return Err(describe(err, "Unable to create a new virtual machine")),
        };

        let info = parse_key_values(&lines, ':');
        let Some(uuid) = info.get("UUID") else {
            return Err(ActionError::failed(
                "Unable to detect the ID of the newly allocated VM",
                HvStatus::ExternalError.code(),
            ));
        };
        debug!(session = %self.id, %uuid, "VM created");
        ctx.done("Virtual Machine created");
        Ok(())
    }

    fn configure_vm(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Configuring Virtual Machine");
        let memory = self.config.memory_mb.to_string();
        let cpus = self.config.cpus.to_string();
        let args = [
            "modifyvm",
            self.config.name.as_str(),
            "--memory",
            memory.as_str(),
            "--cpus",
            cpus.as_str(),
        ];
        self.exec(ctx, &args)
            .map_err(|e| describe(e, "Unable to modify the Virtual Machine"))?;
        ctx.done("Virtual Machine configured");
        Ok(())
    }

    fn download_media(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let task: Option<FiniteTask> = ctx.begin("Downloading required media");

        let Some(url) = self.config.boot_media_url() else {
            return Err(ActionError::failed(
                "Missing disk and/or ISO URL",
                HvStatus::NotValidated.code(),
            ));
        };
        let dest = media_path(&self.config.cache_dir, url);

        if dest.exists() && self.verify(&dest) {
            debug!(session = %self.id, dest = %dest.display(), "boot medium already cached");
        } else {
            if dest.exists() {
                warn!(session = %self.id, dest = %dest.display(), "cached boot medium is corrupted; downloading again");
                if let Err(e) = std::fs::remove_file(&dest) {
                    warn!(session = %self.id, error = %e, "cannot remove corrupted boot medium");
                }
            }
            let sink: Option<VariableTask> = task.as_ref().map(|task| {
                task.set_max(1);
                task.begin("Downloading boot medium")
            });
            ctx.checkpoint()?;
            self.fetch(ctx, url, &dest, sink)?;

            if !self.verify(&dest) {
                if let Err(e) = std::fs::remove_file(&dest) {
                    warn!(session = %self.id, error = %e, "cannot remove corrupted boot medium");
                }
                return Err(ActionError::failed(
                    "Downloaded boot medium does not match its checksum",
                    HvStatus::NotValidated.code(),
                ));
            }
        }

        *lock(&self.boot_medium) = Some(dest);
        if let Some(task) = task {
            task.complete("Required media downloaded");
        }
        Ok(())
    }

    /// Download `url` next to `dest` and move it into place once complete.
    fn fetch(
        &self,
        ctx: &ActionContext,
        url: &str,
        dest: &Path,
        sink: Option<VariableTask>,
    ) -> Result<(), ActionError> {
        let part = partial_path(dest);
        let cancel = ctx.cancel_token();
        let result = self
            .runtime
            .block_on(async {
                tokio::select! {
                    result = self.downloads.download_file(url, &part, sink) => result.map_err(|status| {
                        ActionError::failed("Unable to download the boot medium", status.code())
                    }),
                    _ = cancel.cancelled() => Err(ActionError::Interrupted),
                }
            })
            .and_then(|()| {
                std::fs::rename(&part, dest).map_err(|e| {
                    warn!(session = %self.id, error = %e, "cannot move the boot medium into the cache");
                    ActionError::failed("Unable to store the boot medium", HvStatus::IoError.code())
                })
            });

        if result.is_err() && part.exists() {
            if let Err(e) = std::fs::remove_file(&part) {
                warn!(session = %self.id, error = %e, part = %part.display(), "cannot remove partial download");
            }
        }
        result
    }

    /// Whether `path` matches the configured checksum (always, when none is set).
    fn verify(&self, path: &Path) -> bool {
        let Some(expected) = self.config.media_sha256.as_deref() else {
            return true;
        };
        match std::fs::read(path) {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes)).eq_ignore_ascii_case(expected.trim()),
            Err(e) => {
                warn!(session = %self.id, error = %e, "cannot read boot medium");
                false
            }
        }
    }

    fn prepare_boot_medium(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Preparing boot medium");
        let Some(medium) = lock(&self.boot_medium).clone() else {
            return Err(ActionError::failed(
                "No boot medium was downloaded",
                HvStatus::NotFound.code(),
            ));
        };
        let medium = medium.display().to_string();
        self.exec(ctx, &["storageattach", &self.config.name, &medium])
            .map_err(|e| describe(e, "Unable to attach the boot medium"))?;
        ctx.done("Boot medium prepared");
        Ok(())
    }

    fn release_boot_medium(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Releasing boot medium");
        self.exec(ctx, &["storagedetach", &self.config.name])
            .map_err(|e| describe(e, "Unable to release the boot medium"))?;
        ctx.done("Boot medium released");
        Ok(())
    }

    fn destroy_vm(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Destroying VM");
        match self.exec(ctx, &["unregistervm", &self.config.name]) {
            Ok(_) => {}
            Err(ActionError::Failed { code, .. }) if code == HvStatus::NotFound.code() => {
                debug!(session = %self.id, "VM already gone");
            }
            Err(err) => return Err(describe(err, "Unable to destroy the VM")),
        }
        *lock(&self.boot_medium) = None;
        ctx.done("VM destroyed");
        Ok(())
    }

    fn fatal(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.doing("Session unable to continue. Cleaning-up");
        ctx.done("Session cleaned-up");
        Ok(())
    }

    /// `<verb> <vm name> <rest..>` with the given progress messages.
    fn simple(
        &self,
        ctx: &ActionContext,
        command: &[&str],
        doing: &str,
        done: &str,
    ) -> Result<(), ActionError> {
        ctx.doing(doing);
        let mut args = Vec::with_capacity(command.len() + 1);
        args.push(command[0]);
        args.push(self.config.name.as_str());
        args.extend_from_slice(&command[1..]);
        self.exec(ctx, &args)
            .map_err(|e| describe(e, &format!("{doing} failed")))?;
        ctx.done(done);
        Ok(())
    }
}
