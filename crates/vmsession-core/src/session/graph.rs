//! VM lifecycle graph.
//!
//! ```text
//! Entry ─► Initialize ─► UpdateSession ─► Destroyed ─► CreateVm ─► ConfigureVm ─► PoweredOff
//! PoweredOff ─► DownloadMedia ─► PrepareBootMedium ─► StartVm ─► Running
//! PoweredOff ─► ReleaseBootMedium ─► DestroyVm ─► Destroyed
//! Running ─► PauseVm ─► Paused ─► ResumeVm ─► Running
//! Running ─► SaveState ─► Saved ─► StartVm | DiscardState ─► PoweredOff
//! Running | Paused ─► PowerOffVm ─► PoweredOff
//! Error ─► HandleError ─► CureError ─► UpdateSession
//!                      └► Fatal
//! ```
//!
//! `UpdateSession` skews to whatever state the hypervisor reports, so its
//! single outgoing link only matters when the VM does not exist yet.

use std::sync::Arc;

use super::handlers::{self, SessionCore};
use crate::domain::SessionState::{self, *};
use crate::fsm::{BuildError, Fsm, FsmBuilder, StateId};

pub(crate) const LIFECYCLE: &[(SessionState, &[SessionState])] = &[
    (Entry, &[Initialize]),
    (Initialize, &[UpdateSession]),
    (UpdateSession, &[Destroyed]),
    (Error, &[HandleError]),
    (HandleError, &[CureError, Fatal]),
    (CureError, &[UpdateSession]),
    (Fatal, &[]),
    (Destroyed, &[CreateVm]),
    (CreateVm, &[ConfigureVm]),
    (ConfigureVm, &[PoweredOff]),
    (PoweredOff, &[DownloadMedia, ReleaseBootMedium]),
    (DownloadMedia, &[PrepareBootMedium]),
    (PrepareBootMedium, &[StartVm]),
    (StartVm, &[Running]),
    (ReleaseBootMedium, &[DestroyVm]),
    (DestroyVm, &[Destroyed]),
    (Running, &[PauseVm, SaveState, PowerOffVm]),
    (PowerOffVm, &[PoweredOff]),
    (SaveState, &[Saved]),
    (Saved, &[StartVm, DiscardState]),
    (DiscardState, &[PoweredOff]),
    (PauseVm, &[Paused]),
    (Paused, &[ResumeVm, PowerOffVm]),
    (ResumeVm, &[Running]),
];

pub(crate) fn build(core: &Arc<SessionCore>, name: String) -> Result<Fsm, BuildError> {
    let mut builder = FsmBuilder::new().name(name);
    for (state, links) in LIFECYCLE {
        let links: Vec<StateId> = links.iter().map(|s| s.id()).collect();
        builder = if state.is_marker() {
            builder.state(state.id(), &links)
        } else {
            builder.action(state.id(), handlers::action(core, *state), &links)
        };
    }
    builder.build(Entry.id())
}
