//! The logical outputs behind a Bloc9: plain switches and dimmable lights.
//!
//! Outputs own their `(state, brightness)` pair and an observer list, decode
//! their half of matched pair-state frames, and synthesize outbound command
//! frames through the shared [`FrameSink`]. The MQTT layer talks to outputs
//! exclusively; it never writes frames itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::can::FrameSink;
use crate::easing::{EasingKind, DEFAULT_EASING};
use crate::protocol::{self, PairLevel};
use crate::transition::{self, RunningTransition};

/// What observers receive. `brightness == 0` iff `on == false`, regardless
/// of how the wire encodes full-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub on: bool,
    pub brightness: u8,
}

/// Identity of one output within the installation.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub device_id: u8,
    pub switch_nr: u8,
    pub entity_id: String,
    pub display_name: String,
}

impl OutputInfo {
    /// One-indexed UI label ("s1".."s6") for the zero-indexed slot.
    pub fn slot_label(&self) -> String {
        format!("s{}", self.switch_nr + 1)
    }
}

/// Observer registry. Callbacks live as long as the process; a panicking
/// subscriber is logged and must not poison the router.
struct Observers {
    list: Mutex<Vec<Box<dyn Fn(Snapshot) + Send + Sync>>>,
}

impl Observers {
    fn new() -> Observers {
        Observers {
            list: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, cb: Box<dyn Fn(Snapshot) + Send + Sync>) {
        self.list.lock().unwrap().push(cb);
    }

    fn notify(&self, entity_id: &str, snapshot: Snapshot) {
        let list = self.list.lock().unwrap();
        for cb in list.iter() {
            if catch_unwind(AssertUnwindSafe(|| cb(snapshot))).is_err() {
                error!("observer of {entity_id} panicked; continuing");
            }
        }
    }
}

/// A plain on/off channel. State is never applied optimistically: a `set`
/// sends the command frame and the stored bit changes only when a matched
/// pair-state frame confirms it.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

struct SwitchInner {
    info: OutputInfo,
    sink: Arc<dyn FrameSink>,
    on: Mutex<bool>,
    observers: Observers,
}

impl Switch {
    pub fn new(info: OutputInfo, sink: Arc<dyn FrameSink>) -> Switch {
        Switch {
            inner: Arc::new(SwitchInner {
                info,
                sink,
                on: Mutex::new(false),
                observers: Observers::new(),
            }),
        }
    }

    pub fn info(&self) -> &OutputInfo {
        &self.inner.info
    }

    pub fn snapshot(&self) -> Snapshot {
        let on = *self.inner.on.lock().unwrap();
        Snapshot {
            on,
            brightness: if on { 255 } else { 0 },
        }
    }

    pub fn subscribe<F>(&self, cb: F)
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        self.inner.observers.add(Box::new(cb));
    }

    /// Send the command frame. The stored state is left untouched until the
    /// hardware confirms the change on the bus.
    pub async fn set(&self, on: bool) {
        let info = &self.inner.info;
        let frame = protocol::command_frame(
            info.device_id,
            info.switch_nr,
            on,
            if on { 255 } else { 0 },
        );
        if let Err(e) = self.inner.sink.send_frame(&frame).await {
            warn!("{}: command send failed: {e}", info.entity_id);
        }
    }

    /// Router path: apply a decoded pair-state half.
    pub(crate) fn process_level(&self, level: PairLevel) {
        let changed = {
            let mut on = self.inner.on.lock().unwrap();
            if *on != level.on {
                *on = level.on;
                true
            } else {
                false
            }
        };
        if changed {
            debug!("{} -> {}", self.inner.info.entity_id, if level.on { "ON" } else { "OFF" });
            self.inner.observers.notify(&self.inner.info.entity_id, self.snapshot());
        }
    }

    /// Seed the stored bit from persisted state. No frame, no notification.
    pub(crate) fn seed(&self, on: bool) {
        *self.inner.on.lock().unwrap() = on;
    }
}

/// Parsed Home-Assistant-style composite command. Precedence when applied:
/// flash > transition > brightness > state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightCommand {
    pub on: Option<bool>,
    pub brightness: Option<u8>,
    pub transition: Option<Duration>,
    pub effect: Option<EasingKind>,
    pub flash: Option<Duration>,
}

struct LightLevel {
    on: bool,
    brightness: u8,
    default_easing: EasingKind,
}

/// A dimmable channel. Owns at most one live transition; every mutating
/// call cancels the predecessor before imposing its own state.
#[derive(Clone)]
pub struct DimmableLight {
    inner: Arc<LightInner>,
}

pub(crate) struct LightInner {
    info: OutputInfo,
    sink: Arc<dyn FrameSink>,
    level: Mutex<LightLevel>,
    transition: Mutex<Option<RunningTransition>>,
    // Serializes the mutating entry points so cancel/join/send sequences
    // from two MQTT commands cannot interleave.
    gate: tokio::sync::Mutex<()>,
    observers: Observers,
}

impl LightInner {
    pub(crate) fn current(&self) -> PairLevel {
        let level = self.level.lock().unwrap();
        PairLevel {
            on: level.on,
            brightness: level.brightness,
        }
    }

    /// Synthesize and send the command frame for `(on, brightness)`.
    /// Send failures are logged and swallowed; the next tick or the next
    /// user command re-emits.
    pub(crate) async fn send_level(&self, on: bool, brightness: u8) {
        let frame =
            protocol::command_frame(self.info.device_id, self.info.switch_nr, on, brightness);
        if let Err(e) = self.sink.send_frame(&frame).await {
            warn!("{}: command send failed: {e}", self.info.entity_id);
        }
    }

    /// Store without notifying. Used by transition ticks so observers do not
    /// see every interpolation step.
    pub(crate) fn store_silent(&self, level: PairLevel) {
        let mut cur = self.level.lock().unwrap();
        cur.on = level.on;
        cur.brightness = level.brightness;
    }

    pub(crate) fn store_and_notify(&self, level: PairLevel) {
        self.store_silent(level);
        self.observers.notify(
            &self.info.entity_id,
            Snapshot {
                on: level.on,
                brightness: level.brightness,
            },
        );
    }

    fn cancel_transition(&self) {
        if let Some(t) = self.transition.lock().unwrap().as_ref() {
            t.cancel();
        }
    }

    async fn join_transition(&self) {
        let running = self.transition.lock().unwrap().take();
        if let Some(t) = running {
            t.join().await;
        }
    }
}

impl DimmableLight {
    pub fn new(info: OutputInfo, sink: Arc<dyn FrameSink>) -> DimmableLight {
        DimmableLight {
            inner: Arc::new(LightInner {
                info,
                sink,
                level: Mutex::new(LightLevel {
                    on: false,
                    brightness: 0,
                    default_easing: DEFAULT_EASING,
                }),
                transition: Mutex::new(None),
                gate: tokio::sync::Mutex::new(()),
                observers: Observers::new(),
            }),
        }
    }

    pub fn info(&self) -> &OutputInfo {
        &self.inner.info
    }

    pub fn snapshot(&self) -> Snapshot {
        let level = self.inner.current();
        Snapshot {
            on: level.on,
            brightness: level.brightness,
        }
    }

    pub fn default_easing(&self) -> EasingKind {
        self.inner.level.lock().unwrap().default_easing
    }

    /// Home Assistant's "effect" semantics: remember this easing for
    /// subsequent fades. Stores only; sends nothing.
    pub fn set_default_easing(&self, easing: EasingKind) {
        self.inner.level.lock().unwrap().default_easing = easing;
    }

    pub fn subscribe<F>(&self, cb: F)
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        self.inner.observers.add(Box::new(cb));
    }

    /// Write `(state, brightness)` through the command-synthesis rule and
    /// notify observers. An OFF issued here reaches the bus before the
    /// predecessor transition is joined, so a runaway fade stops climbing
    /// immediately.
    pub async fn set_brightness(&self, brightness: u8) {
        let _g = self.inner.gate.lock().await;
        self.inner.cancel_transition();
        let on = brightness > 0;
        self.inner.send_level(on, brightness).await;
        self.inner.join_transition().await;
        self.inner
            .store_and_notify(protocol::normalize_level(on, brightness));
    }

    /// Plain on/off. ON with no brightness restores full brightness when the
    /// light is dark, otherwise re-asserts the current level.
    pub async fn turn(&self, on: bool) {
        if on {
            let cur = self.inner.current();
            let target = if cur.on && cur.brightness > 0 {
                cur.brightness
            } else {
                255
            };
            self.set_brightness(target).await;
        } else {
            self.set_brightness(0).await;
        }
    }

    /// Start a timed fade towards `target`. Returns immediately once the
    /// transition task is running; a fade to the current brightness is a
    /// no-op.
    pub async fn fade_to(&self, target: u8, duration: Duration, easing: Option<EasingKind>) {
        let _g = self.inner.gate.lock().await;
        self.inner.cancel_transition();
        self.inner.join_transition().await;

        let cur = self.inner.current();
        if cur.brightness == target {
            return;
        }
        let easing = easing.unwrap_or_else(|| {
            EasingKind::auto_select(cur.brightness, target, self.default_easing())
        });
        debug!(
            "{}: fade {} -> {} over {:?} ({})",
            self.inner.info.entity_id,
            cur.brightness,
            target,
            duration,
            easing.name()
        );
        let running = transition::spawn_fade(
            self.inner.clone(),
            cur.brightness,
            target,
            duration,
            easing,
        );
        *self.inner.transition.lock().unwrap() = Some(running);
    }

    /// Cancel and join any in-flight fade or flash without imposing new
    /// state. Used on shutdown so no frame is emitted after the system
    /// stops.
    pub async fn cancel(&self) {
        let _g = self.inner.gate.lock().await;
        self.inner.cancel_transition();
        self.inner.join_transition().await;
    }

    /// Simple flash: full brightness, hold, restore the prior snapshot.
    pub async fn flash(&self, duration: Duration) {
        let _g = self.inner.gate.lock().await;
        self.inner.cancel_transition();
        self.inner.join_transition().await;

        let restore = self.inner.current();
        let running = transition::spawn_flash(self.inner.clone(), restore, duration);
        *self.inner.transition.lock().unwrap() = Some(running);
    }

    /// Apply a composite command with the documented precedence. A command
    /// carrying only `state: ON` plus an effect stores the easing and sends
    /// nothing.
    pub async fn apply(&self, cmd: &LightCommand) {
        if let Some(easing) = cmd.effect {
            self.set_default_easing(easing);
        }
        if let Some(duration) = cmd.flash {
            self.flash(duration).await;
            return;
        }

        let target = if let Some(b) = cmd.brightness {
            b
        } else {
            match cmd.on {
                Some(true) => {
                    if cmd.effect.is_some() {
                        // Easing-only command: nothing to drive.
                        return;
                    }
                    let cur = self.inner.current();
                    if cur.on && cur.brightness > 0 {
                        cur.brightness
                    } else {
                        255
                    }
                }
                Some(false) => 0,
                None => return,
            }
        };

        if let Some(duration) = cmd.transition {
            self.fade_to(target, duration, cmd.effect).await;
        } else {
            self.set_brightness(target).await;
        }
    }

    /// Router path: apply a decoded pair-state half. Observers fire only
    /// when the stored pair actually changes, so echoes of our own commands
    /// (already stored on send) stay quiet.
    pub(crate) fn process_level(&self, level: PairLevel) {
        let changed = {
            let mut cur = self.inner.level.lock().unwrap();
            if cur.on != level.on || cur.brightness != level.brightness {
                cur.on = level.on;
                cur.brightness = level.brightness;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(
                "{} -> on={} brightness={}",
                self.inner.info.entity_id, level.on, level.brightness
            );
            self.inner.observers.notify(
                &self.inner.info.entity_id,
                Snapshot {
                    on: level.on,
                    brightness: level.brightness,
                },
            );
        }
    }

    /// Seed from persisted state. No frame, no notification.
    pub(crate) fn seed(&self, on: bool, brightness: u8) {
        let mut cur = self.inner.level.lock().unwrap();
        cur.on = on;
        cur.brightness = if on && brightness == 0 { 255 } else { brightness };
        if !on {
            cur.brightness = 0;
        }
    }
}

/// The discriminated output variant a device slot holds.
#[derive(Clone)]
pub enum Output {
    Switch(Switch),
    Light(DimmableLight),
}

impl Output {
    pub fn info(&self) -> &OutputInfo {
        match self {
            Output::Switch(s) => s.info(),
            Output::Light(l) => l.info(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.info().entity_id
    }

    pub fn snapshot(&self) -> Snapshot {
        match self {
            Output::Switch(s) => s.snapshot(),
            Output::Light(l) => l.snapshot(),
        }
    }

    pub fn is_light(&self) -> bool {
        matches!(self, Output::Light(_))
    }

    /// Cancel any transition still running on this output. Switches have
    /// none; lights cancel and join theirs.
    pub async fn cancel_transition(&self) {
        if let Output::Light(light) = self {
            light.cancel().await;
        }
    }

    pub fn subscribe<F>(&self, cb: F)
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        match self {
            Output::Switch(s) => s.subscribe(cb),
            Output::Light(l) => l.subscribe(cb),
        }
    }

    pub(crate) fn process_level(&self, level: PairLevel) {
        match self {
            Output::Switch(s) => s.process_level(level),
            Output::Light(l) => l.process_level(level),
        }
    }

    pub(crate) fn seed(&self, on: bool, brightness: Option<u8>) {
        match self {
            Output::Switch(s) => s.seed(on),
            Output::Light(l) => l.seed(on, brightness.unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::can::testing::RecordingSink;

    fn light_info() -> OutputInfo {
        OutputInfo {
            device_id: 8,
            switch_nr: 4,
            entity_id: "aft_cabin".to_string(),
            display_name: "Aft cabin".to_string(),
        }
    }

    fn collect(light: &DimmableLight) -> Arc<StdMutex<Vec<Snapshot>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        light.subscribe(move |s| sink.lock().unwrap().push(s));
        seen
    }

    #[tokio::test]
    async fn set_brightness_emits_single_command_frame() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());

        light.set_brightness(0).await;
        light.set_brightness(150).await;
        light.set_brightness(254).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 3);
        for f in &frames {
            assert_eq!(f.arb_id, 0x0236_06C0);
        }
        assert_eq!(frames[0].data, vec![4, 0x00, 0, 0]);
        assert_eq!(frames[1].data, vec![4, 0x11, 0, 150]);
        assert_eq!(frames[2].data, vec![4, 0x01, 0, 0]);
    }

    #[tokio::test]
    async fn exposed_state_keeps_brightness_zero_iff_off() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());
        let seen = collect(&light);

        light.set_brightness(254).await;
        light.set_brightness(1).await; // below dimming threshold -> off

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Snapshot { on: true, brightness: 255 });
        assert_eq!(seen[1], Snapshot { on: false, brightness: 0 });
        for s in seen.iter() {
            assert_eq!(s.brightness == 0, !s.on);
        }
    }

    #[tokio::test]
    async fn echoed_state_after_command_is_quiet() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());
        let seen = collect(&light);

        light.set_brightness(150).await;
        // The device mirrors the command into its next pair-state frame.
        light.process_level(PairLevel { on: true, brightness: 150 });

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_change_notifies_once() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());
        let seen = collect(&light);

        light.process_level(PairLevel { on: true, brightness: 107 });
        light.process_level(PairLevel { on: true, brightness: 107 });

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Snapshot { on: true, brightness: 107 }]
        );
    }

    #[tokio::test]
    async fn switch_is_not_optimistic() {
        let sink = RecordingSink::new();
        let sw = Switch::new(light_info(), sink.clone());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let tap = seen.clone();
        sw.subscribe(move |s| tap.lock().unwrap().push(s));

        sw.set(true).await;
        assert_eq!(sink.frames().len(), 1);
        assert!(!sw.snapshot().on, "state must wait for bus confirmation");
        assert!(seen.lock().unwrap().is_empty());

        sw.process_level(PairLevel { on: true, brightness: 255 });
        assert!(sw.snapshot().on);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_poison_the_rest() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());
        light.subscribe(|_| panic!("bad subscriber"));
        let seen = collect(&light);

        light.process_level(PairLevel { on: true, brightness: 20 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_is_swallowed() {
        let sink = RecordingSink::new();
        sink.fail_sends.store(true, std::sync::atomic::Ordering::Relaxed);
        let light = DimmableLight::new(light_info(), sink.clone());
        let seen = collect(&light);

        // The bus is lossy by design: the command is logged and dropped,
        // the intended state still lands and the next command re-emits.
        light.set_brightness(150).await;
        assert!(sink.frames().is_empty());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Snapshot { on: true, brightness: 150 }]
        );
    }

    #[tokio::test]
    async fn effect_only_command_stores_easing_and_sends_nothing() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());

        light
            .apply(&LightCommand {
                on: Some(true),
                effect: Some(EasingKind::EaseInCubic),
                ..LightCommand::default()
            })
            .await;

        assert!(sink.frames().is_empty());
        assert_eq!(light.default_easing(), EasingKind::EaseInCubic);
    }

    #[tokio::test]
    async fn on_without_brightness_restores_full() {
        let sink = RecordingSink::new();
        let light = DimmableLight::new(light_info(), sink.clone());

        light
            .apply(&LightCommand {
                on: Some(true),
                ..LightCommand::default()
            })
            .await;

        assert_eq!(sink.frames().last().unwrap().data, vec![4, 0x01, 0, 0]);
        assert_eq!(light.snapshot(), Snapshot { on: true, brightness: 255 });
    }
}
