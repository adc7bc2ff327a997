//! Device Bring-Up
//!
//! Engines that run after the tree is placed, each iterating the session's
//! current list in order. A failed step on one device marks that device
//! invalid and moves on; it never fails the engine.

pub mod ata_features;
pub mod sas;
pub mod sata;
pub mod smp;
pub mod spinhold;

use crate::discovery::context::{Advisory, Context};
use crate::topology::target::{CommandSet, Listing, Target, TargetHandle};

pub use ata_features::ConfigureAta;
pub use sas::InitSas;
pub use sata::InitSata;
pub use smp::InitSmp;
pub use spinhold::SpinHold;

/// Current-list targets matching `filter`, in list order
pub(crate) fn current_targets(cx: &Context<'_>, filter: impl Fn(&Target) -> bool) -> Vec<TargetHandle> {
    cx.registry
        .listed(cx.port(), Listing::Current)
        .into_iter()
        .filter(|&h| cx.registry.get(h).map(&filter).unwrap_or(false))
        .collect()
}

/// Give up on a device for the rest of the session
pub(crate) fn invalidate(cx: &mut Context<'_>, handle: TargetHandle, reason: impl Into<String>) {
    let Some(target) = cx.registry.get_mut(handle) else {
        return;
    };
    target.command_set = CommandSet::Invalid;
    let address = target.address;
    cx.advise(Advisory::DeviceInvalid {
        address,
        reason: reason.into(),
    });
}

/// Parent phy the target hangs off
pub(crate) fn parent_phy(cx: &Context<'_>, handle: TargetHandle) -> Option<(TargetHandle, u8)> {
    let target = cx.registry.get(handle)?;
    let parent = target.parent?;
    let phy = cx
        .registry
        .get(parent)?
        .expander
        .as_ref()?
        .phys_attached_to(target.address)
        .next()?;
    Some((parent, phy))
}
