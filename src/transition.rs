//! Time-driven brightness interpolation. One tokio task per active run,
//! cancelled through a shared flag that the tick loop observes within one
//! cadence. Intermediate levels are written silently; observers get exactly
//! one notification, at natural completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::easing::EasingKind;
use crate::output::LightInner;
use crate::protocol::{self, PairLevel};

/// 10 Hz: comfortably inside the bus budget even with six lights fading.
pub const TICK: Duration = Duration::from_millis(100);

/// Handle to a live fade or flash. Dropping the handle does not stop the
/// task; callers cancel and then join.
pub(crate) struct RunningTransition {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RunningTransition {
    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn join(self) {
        let _ = self.task.await;
    }
}

/// Interpolate from `from` to `target` over `duration` with `easing`.
pub(crate) fn spawn_fade(
    light: Arc<LightInner>,
    from: u8,
    target: u8,
    duration: Duration,
    easing: EasingKind,
) -> RunningTransition {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();

    let task = tokio::spawn(async move {
        let start = Instant::now();
        let span = f64::from(target) - f64::from(from);
        loop {
            tokio::time::sleep(TICK).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let t = if duration.is_zero() {
                1.0
            } else {
                (start.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0)
            };
            let eased = easing.apply(t);
            let level = (f64::from(from) + span * eased).round().clamp(0.0, 255.0) as u8;

            // The synthesis rule flips to OFF / FULL ON at the extremes on
            // its own; the loop just feeds it levels.
            light.send_level(level > 0, level).await;

            if t >= 1.0 {
                light.store_and_notify(protocol::normalize_level(target > 0, target));
                return;
            }
            if !flag.load(Ordering::SeqCst) {
                light.store_silent(protocol::normalize_level(level > 0, level));
            }
        }
    });

    RunningTransition { cancel, task }
}

/// Full brightness for `duration`, then restore `restore`. A cancelled flash
/// puts the snapshot back in memory but sends nothing; the superseding
/// command owns the bus from that point.
pub(crate) fn spawn_flash(
    light: Arc<LightInner>,
    restore: PairLevel,
    duration: Duration,
) -> RunningTransition {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();

    let task = tokio::spawn(async move {
        light.send_level(true, 255).await;
        light.store_silent(PairLevel {
            on: true,
            brightness: 255,
        });

        let start = Instant::now();
        loop {
            tokio::time::sleep(TICK).await;
            if flag.load(Ordering::SeqCst) {
                light.store_silent(restore);
                return;
            }
            if start.elapsed() >= duration {
                break;
            }
        }

        light.send_level(restore.on, restore.brightness).await;
        light.store_and_notify(restore);
    });

    RunningTransition { cancel, task }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::can::testing::RecordingSink;
    use crate::output::{DimmableLight, OutputInfo, Snapshot};

    fn test_light(sink: Arc<RecordingSink>) -> DimmableLight {
        DimmableLight::new(
            OutputInfo {
                device_id: 8,
                switch_nr: 4,
                entity_id: "saloon".to_string(),
                display_name: "Saloon".to_string(),
            },
            sink,
        )
    }

    fn observe(light: &DimmableLight) -> Arc<Mutex<Vec<Snapshot>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tap = seen.clone();
        light.subscribe(move |s| tap.lock().unwrap().push(s));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn fade_reaches_target_with_one_notification() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());
        let seen = observe(&light);

        light.fade_to(255, Duration::from_secs(1), Some(EasingKind::Linear)).await;
        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert_eq!(light.snapshot(), Snapshot { on: true, brightness: 255 });
        // Final frame drives hardware full-on.
        assert_eq!(sink.frames().last().unwrap().data, vec![4, 0x01, 0, 0]);
        // Silent ramp, exactly one completion notification.
        assert_eq!(seen.lock().unwrap().as_slice(), &[Snapshot { on: true, brightness: 255 }]);
        // Roughly one frame per tick.
        let count = sink.frames().len();
        assert!((8..=12).contains(&count), "expected ~10 frames, got {count}");
    }

    #[tokio::test(start_paused = true)]
    async fn fade_to_current_brightness_is_a_no_op() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());

        light.fade_to(0, Duration::from_secs(2), None).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sink.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn off_cancels_fade_and_silences_it_within_a_tick() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());
        let seen = observe(&light);

        light.fade_to(255, Duration::from_secs(5), Some(EasingKind::Linear)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        light.set_brightness(0).await;
        let frames_at_cancel = sink.frames();
        assert_eq!(
            frames_at_cancel.last().unwrap().data,
            vec![4, 0x00, 0, 0],
            "OFF must be on the bus once set_brightness returns"
        );

        // No further frames from the dead fade.
        let count = frames_at_cancel.len();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.frames().len(), count);
        assert_eq!(light.snapshot(), Snapshot { on: false, brightness: 0 });
        assert_eq!(seen.lock().unwrap().last(), Some(&Snapshot { on: false, brightness: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn new_fade_replaces_running_fade() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());

        light.fade_to(255, Duration::from_secs(10), Some(EasingKind::Linear)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        light.fade_to(40, Duration::from_millis(300), Some(EasingKind::Linear)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(light.snapshot(), Snapshot { on: true, brightness: 40 });
    }

    #[tokio::test(start_paused = true)]
    async fn flash_restores_snapshot_after_hold() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());
        light.set_brightness(107).await;
        let seen = observe(&light);
        sink.clear();

        light.flash(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(2300)).await;

        let frames = sink.frames();
        assert_eq!(frames.first().unwrap().data, vec![4, 0x01, 0, 0]);
        assert_eq!(frames.last().unwrap().data, vec![4, 0x11, 0, 107]);
        assert_eq!(light.snapshot(), Snapshot { on: true, brightness: 107 });
        assert_eq!(seen.lock().unwrap().as_slice(), &[Snapshot { on: true, brightness: 107 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_flash_sends_no_restore_frame() {
        let sink = RecordingSink::new();
        let light = test_light(sink.clone());
        light.set_brightness(107).await;
        sink.clear();

        light.flash(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        light.set_brightness(0).await;

        let count = sink.frames().len();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.frames().len(), count, "no restore frame after cancel");
        assert_eq!(light.snapshot(), Snapshot { on: false, brightness: 0 });
    }
}
