//! Avatar Animation State Machine
//!
//! The avatar loops one of three stable clips (`idle`, `lay`, `eat`). Moving
//! between `idle` and `lay` goes through a one-shot transitional clip that
//! blocks further transitions until the renderer reports it finished, while
//! the avatar settles up or down by a fixed distance.
//!
//! State changes are computed by the pure [`transition`] function; the
//! [`AnimationStateMachine`] driver applies the resulting effects to an
//! injected [`AvatarRig`].

use crate::action::ActionTag;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Every clip the avatar rig is expected to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clip {
    Idle,
    Lay,
    Eat,
    IdleToLay,
    LayToIdle,
}

impl Clip {
    pub const ALL: [Clip; 5] = [
        Clip::Idle,
        Clip::Lay,
        Clip::Eat,
        Clip::IdleToLay,
        Clip::LayToIdle,
    ];

    /// One-shot clips that bridge two stable states.
    pub fn is_transitional(self) -> bool {
        matches!(self, Clip::IdleToLay | Clip::LayToIdle)
    }

    /// The looping clip a transitional clip hands over to when it finishes.
    pub fn settles_into(self) -> Option<Clip> {
        match self {
            Clip::IdleToLay => Some(Clip::Lay),
            Clip::LayToIdle => Some(Clip::Idle),
            _ => None,
        }
    }

    /// The stable clip that represents an action.
    pub fn for_action(action: ActionTag) -> Clip {
        match action {
            ActionTag::Idle => Clip::Idle,
            ActionTag::Lay => Clip::Lay,
            ActionTag::Eat => Clip::Eat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Playback {
    Loop,
    Once,
}

/// Instructions for the rig, produced by [`transition`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnimationEffect {
    /// Fade `from` out and `to` in over `blend_ms`, restarting `to`.
    CrossFade {
        from: Option<Clip>,
        to: Clip,
        playback: Playback,
        blend_ms: u64,
    },
    /// Move the avatar to a new vertical position.
    Reposition { vertical_position: f32 },
}

/// Fixed constants of the animation behaviour.
#[derive(Debug, Clone)]
pub struct AnimationTuning {
    pub blend: Duration,
    /// How far the avatar sinks when lying down.
    pub settle_distance: f32,
    /// Fraction of the remaining distance covered each frame.
    pub smoothing: f32,
    pub epsilon: f32,
    pub rest_position: f32,
}

impl Default for AnimationTuning {
    fn default() -> Self {
        Self {
            blend: Duration::from_secs(1),
            settle_distance: 0.25,
            smoothing: 0.05,
            epsilon: 0.001,
            rest_position: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationState {
    pub current: Clip,
    /// The latest request received while a transitional clip was playing.
    pub next: Option<ActionTag>,
    pub transitioning: bool,
    pub target_vertical_offset: Option<f32>,
    pub vertical_position: f32,
}

impl AnimationState {
    pub fn new(tuning: &AnimationTuning) -> Self {
        Self {
            current: Clip::Idle,
            next: None,
            transitioning: false,
            target_vertical_offset: None,
            vertical_position: tuning.rest_position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnimationEvent {
    Request(ActionTag),
    ClipFinished(Clip),
    /// One rendered frame.
    Frame,
}

#[derive(Debug)]
pub struct Transition {
    pub state: AnimationState,
    pub effects: Vec<AnimationEffect>,
}

impl Transition {
    fn unchanged(state: AnimationState) -> Self {
        Self {
            state,
            effects: vec![],
        }
    }

    fn with_effect(mut self, effect: AnimationEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Pure transition function.
///
/// `available` reports whether the rig can play a clip; requests that need a
/// missing clip leave the state as it was.
pub fn transition(
    state: &AnimationState,
    event: AnimationEvent,
    available: &dyn Fn(Clip) -> bool,
    tuning: &AnimationTuning,
) -> Transition {
    match event {
        AnimationEvent::Request(action) if state.transitioning => {
            debug!(%action, current = ?state.current, "Queued animation request behind transition");
            let mut queued = state.clone();
            queued.next = Some(action);
            Transition::unchanged(queued)
        }
        AnimationEvent::Request(action) => resolve(state, action, available, tuning),
        AnimationEvent::ClipFinished(clip) => finish(state, clip, tuning),
        AnimationEvent::Frame => {
            let after_request = match state.next {
                Some(action) if !state.transitioning => resolve(state, action, available, tuning),
                _ => Transition::unchanged(state.clone()),
            };
            smooth_vertical(after_request, tuning)
        }
    }
}

fn resolve(
    state: &AnimationState,
    action: ActionTag,
    available: &dyn Fn(Clip) -> bool,
    tuning: &AnimationTuning,
) -> Transition {
    let mut next = state.clone();
    next.next = None;

    match (action, state.current) {
        (ActionTag::Lay, Clip::Idle) => {
            begin_transition(next, Clip::IdleToLay, -tuning.settle_distance, available, tuning)
        }
        (ActionTag::Idle, Clip::Lay) => {
            begin_transition(next, Clip::LayToIdle, tuning.settle_distance, available, tuning)
        }
        (action, _) => cross_fade_to(next, Clip::for_action(action), available, tuning),
    }
}

fn begin_transition(
    mut state: AnimationState,
    bridge: Clip,
    vertical_delta: f32,
    available: &dyn Fn(Clip) -> bool,
    tuning: &AnimationTuning,
) -> Transition {
    let Some(target) = bridge.settles_into() else {
        return Transition::unchanged(state);
    };
    if !available(bridge) || !available(target) {
        warn!(clip = ?bridge, "Transitional clip unavailable; ignoring request");
        return Transition::unchanged(state);
    }

    let from = state.current;
    state.current = bridge;
    state.transitioning = true;
    state.target_vertical_offset = Some(state.vertical_position + vertical_delta);

    Transition::unchanged(state).with_effect(AnimationEffect::CrossFade {
        from: Some(from),
        to: bridge,
        playback: Playback::Once,
        blend_ms: blend_ms(tuning),
    })
}

fn cross_fade_to(
    mut state: AnimationState,
    target: Clip,
    available: &dyn Fn(Clip) -> bool,
    tuning: &AnimationTuning,
) -> Transition {
    if state.current == target {
        return Transition::unchanged(state);
    }
    if !available(target) {
        warn!(clip = ?target, "Clip unavailable; ignoring request");
        return Transition::unchanged(state);
    }

    let from = state.current;
    state.current = target;

    Transition::unchanged(state).with_effect(AnimationEffect::CrossFade {
        from: Some(from),
        to: target,
        playback: Playback::Loop,
        blend_ms: blend_ms(tuning),
    })
}

fn finish(state: &AnimationState, clip: Clip, tuning: &AnimationTuning) -> Transition {
    let mut next = state.clone();
    let settled = match clip.settles_into() {
        Some(settled) if state.transitioning && state.current == clip => settled,
        _ => {
            debug!(?clip, current = ?state.current, "Ignoring stale clip finish");
            return Transition::unchanged(next);
        }
    };

    next.current = settled;
    next.transitioning = false;

    Transition::unchanged(next).with_effect(AnimationEffect::CrossFade {
        from: Some(clip),
        to: settled,
        playback: Playback::Loop,
        blend_ms: blend_ms(tuning),
    })
}

/// Moves the avatar one frame closer to its target, snapping once close enough.
fn smooth_vertical(mut t: Transition, tuning: &AnimationTuning) -> Transition {
    let Some(target) = t.state.target_vertical_offset else {
        return t;
    };

    let diff = target - t.state.vertical_position;
    if diff.abs() > tuning.epsilon {
        t.state.vertical_position += diff * tuning.smoothing;
    } else {
        t.state.vertical_position = target;
        t.state.target_vertical_offset = None;
    }

    let vertical_position = t.state.vertical_position;
    t.with_effect(AnimationEffect::Reposition { vertical_position })
}

fn blend_ms(tuning: &AnimationTuning) -> u64 {
    tuning.blend.as_millis().try_into().unwrap_or(u64::MAX)
}

/// The renderer side of the avatar, injected into the state machine.
pub trait AvatarRig: Send {
    /// Whether the loaded model carries `clip`.
    fn has_clip(&self, clip: Clip) -> bool;

    fn apply(&mut self, effect: &AnimationEffect);

    /// Advances local playback by `delta`, returning the one-shot clips that
    /// finished. Rigs that report completion out-of-band return nothing.
    fn advance(&mut self, _delta: Duration) -> Vec<Clip> {
        Vec::new()
    }
}

/// Drives an [`AvatarRig`] through [`transition`].
pub struct AnimationStateMachine {
    state: AnimationState,
    rig: Box<dyn AvatarRig>,
    tuning: AnimationTuning,
}

impl AnimationStateMachine {
    pub fn new(rig: Box<dyn AvatarRig>, tuning: AnimationTuning) -> Self {
        Self {
            state: AnimationState::new(&tuning),
            rig,
            tuning,
        }
    }

    pub fn state(&self) -> &AnimationState {
        &self.state
    }

    pub fn request_state(&mut self, action: ActionTag) {
        self.dispatch(AnimationEvent::Request(action));
    }

    /// Handles the renderer's finish signal for a one-shot clip.
    pub fn clip_finished(&mut self, clip: Clip) {
        self.dispatch(AnimationEvent::ClipFinished(clip));
    }

    /// Runs one frame: collects finished clips from the rig, applies any
    /// queued request and steps the vertical position.
    pub fn update(&mut self, delta: Duration) {
        for clip in self.rig.advance(delta) {
            self.clip_finished(clip);
        }
        self.dispatch(AnimationEvent::Frame);
    }

    fn dispatch(&mut self, event: AnimationEvent) {
        let rig = &self.rig;
        let t = transition(&self.state, event, &|clip| rig.has_clip(clip), &self.tuning);
        if t.state.current != self.state.current {
            debug!(from = ?self.state.current, to = ?t.state.current, "Animation state changed");
        }
        self.state = t.state;
        for effect in &t.effects {
            self.rig.apply(effect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    fn all_clips(_: Clip) -> bool {
        true
    }

    fn tuning() -> AnimationTuning {
        AnimationTuning::default()
    }

    fn idle_state() -> AnimationState {
        AnimationState::new(&tuning())
    }

    /// Records applied effects and plays one-shot clips for a fixed duration.
    struct FakeRig {
        clips: HashSet<Clip>,
        applied: Arc<Mutex<Vec<AnimationEffect>>>,
        one_shot: Option<(Clip, Duration)>,
        one_shot_length: Duration,
    }

    impl FakeRig {
        fn new(clips: &[Clip]) -> (Self, Arc<Mutex<Vec<AnimationEffect>>>) {
            let applied = Arc::new(Mutex::new(Vec::new()));
            let rig = Self {
                clips: clips.iter().copied().collect(),
                applied: applied.clone(),
                one_shot: None,
                one_shot_length: Duration::from_millis(500),
            };
            (rig, applied)
        }
    }

    impl AvatarRig for FakeRig {
        fn has_clip(&self, clip: Clip) -> bool {
            self.clips.contains(&clip)
        }

        fn apply(&mut self, effect: &AnimationEffect) {
            if let AnimationEffect::CrossFade {
                to,
                playback: Playback::Once,
                ..
            } = effect
            {
                self.one_shot = Some((*to, self.one_shot_length));
            }
            self.applied.lock().unwrap().push(effect.clone());
        }

        fn advance(&mut self, delta: Duration) -> Vec<Clip> {
            match self.one_shot.take() {
                Some((clip, remaining)) if remaining <= delta => vec![clip],
                Some((clip, remaining)) => {
                    self.one_shot = Some((clip, remaining - delta));
                    vec![]
                }
                None => vec![],
            }
        }
    }

    #[test]
    fn test_initial_state() {
        let state = idle_state();
        assert_eq!(state.current, Clip::Idle);
        assert!(!state.transitioning);
        assert_eq!(state.next, None);
        assert_eq!(state.target_vertical_offset, None);
        assert_relative_eq!(state.vertical_position, 0.25);
    }

    #[test]
    fn test_lay_from_idle_enters_transition() {
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &all_clips,
            &tuning(),
        );

        assert_eq!(t.state.current, Clip::IdleToLay);
        assert!(t.state.transitioning);
        assert_relative_eq!(t.state.target_vertical_offset.unwrap(), 0.0);
        assert_eq!(
            t.effects,
            vec![AnimationEffect::CrossFade {
                from: Some(Clip::Idle),
                to: Clip::IdleToLay,
                playback: Playback::Once,
                blend_ms: 1000,
            }]
        );
    }

    #[test]
    fn test_requests_during_transition_are_held() {
        let tuning = tuning();
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &all_clips,
            &tuning,
        );
        let t = transition(&t.state, AnimationEvent::Request(ActionTag::Eat), &all_clips, &tuning);

        assert_eq!(t.state.current, Clip::IdleToLay);
        assert!(t.state.transitioning);
        assert_eq!(t.state.next, Some(ActionTag::Eat));
        assert!(t.effects.is_empty());

        // A frame during the transition moves the avatar but does not switch clips.
        let t = transition(&t.state, AnimationEvent::Frame, &all_clips, &tuning);
        assert_eq!(t.state.current, Clip::IdleToLay);
        assert!(matches!(t.effects.as_slice(), [AnimationEffect::Reposition { .. }]));
    }

    #[test]
    fn test_finish_settles_into_looping_lay() {
        let tuning = tuning();
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &all_clips,
            &tuning,
        );
        let t = transition(&t.state, AnimationEvent::Request(ActionTag::Eat), &all_clips, &tuning);
        let t = transition(
            &t.state,
            AnimationEvent::ClipFinished(Clip::IdleToLay),
            &all_clips,
            &tuning,
        );

        assert_eq!(t.state.current, Clip::Lay);
        assert!(!t.state.transitioning);
        assert_eq!(
            t.effects,
            vec![AnimationEffect::CrossFade {
                from: Some(Clip::IdleToLay),
                to: Clip::Lay,
                playback: Playback::Loop,
                blend_ms: 1000,
            }]
        );

        // The held request is applied on the next frame.
        let t = transition(&t.state, AnimationEvent::Frame, &all_clips, &tuning);
        assert_eq!(t.state.current, Clip::Eat);
        assert_eq!(t.state.next, None);
    }

    #[test]
    fn test_idle_from_lay_mirrors_transition() {
        let mut state = idle_state();
        state.current = Clip::Lay;
        state.vertical_position = 0.0;

        let t = transition(&state, AnimationEvent::Request(ActionTag::Idle), &all_clips, &tuning());
        assert_eq!(t.state.current, Clip::LayToIdle);
        assert!(t.state.transitioning);
        assert_relative_eq!(t.state.target_vertical_offset.unwrap(), 0.25);

        let t = transition(
            &t.state,
            AnimationEvent::ClipFinished(Clip::LayToIdle),
            &all_clips,
            &tuning(),
        );
        assert_eq!(t.state.current, Clip::Idle);
        assert!(!t.state.transitioning);
    }

    #[test]
    fn test_eat_cross_fades_directly() {
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Eat),
            &all_clips,
            &tuning(),
        );
        assert_eq!(t.state.current, Clip::Eat);
        assert!(!t.state.transitioning);
        assert_eq!(t.state.target_vertical_offset, None);
        assert_eq!(
            t.effects,
            vec![AnimationEffect::CrossFade {
                from: Some(Clip::Idle),
                to: Clip::Eat,
                playback: Playback::Loop,
                blend_ms: 1000,
            }]
        );

        let again = transition(
            &t.state,
            AnimationEvent::Request(ActionTag::Eat),
            &all_clips,
            &tuning(),
        );
        assert_eq!(again.state.current, Clip::Eat);
        assert!(again.effects.is_empty());
    }

    #[test]
    fn test_lay_from_eat_skips_transitional_clip() {
        let mut state = idle_state();
        state.current = Clip::Eat;

        let t = transition(&state, AnimationEvent::Request(ActionTag::Lay), &all_clips, &tuning());
        assert_eq!(t.state.current, Clip::Lay);
        assert!(!t.state.transitioning);
        assert_eq!(t.state.target_vertical_offset, None);

        let t = transition(&state, AnimationEvent::Request(ActionTag::Idle), &all_clips, &tuning());
        assert_eq!(t.state.current, Clip::Idle);
        assert_eq!(t.state.target_vertical_offset, None);
    }

    #[test]
    fn test_same_state_request_is_inert() {
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Idle),
            &all_clips,
            &tuning(),
        );
        assert_eq!(t.state, idle_state());
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_missing_clips_are_a_no_op() {
        let no_bridge = |clip: Clip| clip != Clip::IdleToLay;
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &no_bridge,
            &tuning(),
        );
        assert_eq!(t.state, idle_state());
        assert!(t.effects.is_empty());

        let no_eat = |clip: Clip| clip != Clip::Eat;
        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Eat),
            &no_eat,
            &tuning(),
        );
        assert_eq!(t.state, idle_state());
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_stale_finish_is_ignored() {
        let t = transition(
            &idle_state(),
            AnimationEvent::ClipFinished(Clip::LayToIdle),
            &all_clips,
            &tuning(),
        );
        assert_eq!(t.state, idle_state());

        let t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &all_clips,
            &tuning(),
        );
        let t = transition(
            &t.state,
            AnimationEvent::ClipFinished(Clip::LayToIdle),
            &all_clips,
            &tuning(),
        );
        assert_eq!(t.state.current, Clip::IdleToLay);
        assert!(t.state.transitioning);
    }

    #[test]
    fn test_vertical_offset_converges_and_snaps() {
        let tuning = tuning();
        let mut t = transition(
            &idle_state(),
            AnimationEvent::Request(ActionTag::Lay),
            &all_clips,
            &tuning,
        );

        let first = transition(&t.state, AnimationEvent::Frame, &all_clips, &tuning);
        assert_relative_eq!(first.state.vertical_position, 0.25 - 0.25 * 0.05);

        let mut frames = 0;
        while t.state.target_vertical_offset.is_some() {
            t = transition(&t.state, AnimationEvent::Frame, &all_clips, &tuning);
            frames += 1;
            assert!(frames < 500, "offset never converged");
        }
        assert_eq!(t.state.vertical_position, 0.0);
        assert_eq!(
            t.effects.last(),
            Some(&AnimationEffect::Reposition { vertical_position: 0.0 })
        );
    }

    #[test]
    fn test_machine_drives_rig_through_full_cycle() {
        let (rig, applied) = FakeRig::new(&Clip::ALL);
        let mut machine = AnimationStateMachine::new(Box::new(rig), tuning());
        let frame = Duration::from_millis(100);

        machine.request_state(ActionTag::Lay);
        assert_eq!(machine.state().current, Clip::IdleToLay);

        machine.request_state(ActionTag::Eat);
        assert_eq!(machine.state().current, Clip::IdleToLay);

        for _ in 0..4 {
            machine.update(frame);
        }
        assert_eq!(machine.state().current, Clip::IdleToLay);

        // The fifth frame finishes the bridge, then the held request applies.
        machine.update(frame);
        assert_eq!(machine.state().current, Clip::Eat);
        assert!(!machine.state().transitioning);

        let cross_fades: Vec<Clip> = applied
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                AnimationEffect::CrossFade { to, .. } => Some(*to),
                AnimationEffect::Reposition { .. } => None,
            })
            .collect();
        assert_eq!(cross_fades, vec![Clip::IdleToLay, Clip::Lay, Clip::Eat]);
    }

    #[test]
    fn test_machine_without_clips_stays_put() {
        let (rig, applied) = FakeRig::new(&[]);
        let mut machine = AnimationStateMachine::new(Box::new(rig), tuning());

        machine.request_state(ActionTag::Lay);
        machine.request_state(ActionTag::Eat);
        machine.update(Duration::from_millis(16));

        assert_eq!(machine.state(), &idle_state());
        assert!(applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clip_serde_names() {
        assert_eq!(serde_json::to_string(&Clip::IdleToLay).unwrap(), "\"idle_to_lay\"");
        let clip: Clip = serde_json::from_str("\"lay_to_idle\"").unwrap();
        assert_eq!(clip, Clip::LayToIdle);
    }
}
