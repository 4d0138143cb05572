//! An avatar rig rendered in the browser. Effects are forwarded as UI events
//! and the browser reports finished one-shot clips back with `clip_finished`.

use darwin_core::UiEvent;
use darwin_core::animation::{AnimationEffect, AvatarRig, Clip};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::debug;

pub struct RemoteRig {
    clips: HashSet<Clip>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl RemoteRig {
    /// `clips` lists what the browser's model provides; `None` means all.
    pub fn new(clips: Option<Vec<Clip>>, ui: mpsc::UnboundedSender<UiEvent>) -> Self {
        let clips = match clips {
            Some(clips) => clips.into_iter().collect(),
            None => Clip::ALL.into_iter().collect(),
        };
        Self { clips, ui }
    }
}

impl AvatarRig for RemoteRig {
    fn has_clip(&self, clip: Clip) -> bool {
        self.clips.contains(&clip)
    }

    fn apply(&mut self, effect: &AnimationEffect) {
        if self.ui.send(UiEvent::Animation(effect.clone())).is_err() {
            debug!("UI receiver dropped; animation effect not delivered");
        }
    }
}
