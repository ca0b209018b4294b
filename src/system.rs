//! Owns the devices and the bus: runs the dispatch loop, keeps the dirty
//! marker fed by output observers, and persists state periodically and on
//! shutdown.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::can::CanBus;
use crate::device::{Bloc9, RouteOutcome};
use crate::error::BridgeError;
use crate::protocol::BusFrame;
use crate::state::{self, StateMap};

pub struct System {
    devices: Vec<Arc<Bloc9>>,
    state_path: PathBuf,
    save_interval: Duration,
    started: AtomicBool,
    stopping: AtomicBool,
    stop: Notify,
    dirty: Arc<AtomicBool>,
    bus: Mutex<Option<Arc<CanBus>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    unknown_ids: Mutex<HashSet<u32>>,
    malformed_ids: Mutex<HashSet<u32>>,
    unknown_frames: AtomicU64,
}

impl System {
    /// Build the system around already-constructed devices. Every output is
    /// subscribed here so any confirmed state change marks the state file
    /// dirty.
    pub fn new(devices: Vec<Bloc9>, state_path: PathBuf, save_interval: Duration) -> Arc<System> {
        let dirty = Arc::new(AtomicBool::new(false));
        let devices: Vec<Arc<Bloc9>> = devices.into_iter().map(Arc::new).collect();

        for device in &devices {
            for (_, output) in device.outputs() {
                let marker = dirty.clone();
                output.subscribe(move |_| marker.store(true, Ordering::Relaxed));
            }
            let id = device.device_id();
            device.on_heartbeat(move |_| debug!("bloc9 {id} heartbeat"));
        }

        Arc::new(System {
            devices,
            state_path,
            save_interval,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
            dirty,
            bus: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            unknown_ids: Mutex::new(HashSet::new()),
            malformed_ids: Mutex::new(HashSet::new()),
            unknown_frames: AtomicU64::new(0),
        })
    }

    pub fn devices(&self) -> &[Arc<Bloc9>] {
        &self.devices
    }

    pub fn unknown_frame_count(&self) -> u64 {
        self.unknown_frames.load(Ordering::Relaxed)
    }

    /// Route one inbound frame. Patterns carry the full 32-bit id including
    /// the device byte, so at most one device can claim a frame.
    pub fn dispatch(&self, frame: &BusFrame) {
        for device in &self.devices {
            let outcome = device.route(frame);
            match outcome {
                RouteOutcome::NotMatched => continue,
                RouteOutcome::Updated | RouteOutcome::Heartbeat => return,
                RouteOutcome::EchoDropped => {
                    debug!("dropped command echo {:#010x}", frame.arb_id);
                    return;
                }
                RouteOutcome::Malformed => {
                    if self.malformed_ids.lock().unwrap().insert(frame.arb_id) {
                        warn!(
                            "{}",
                            BridgeError::BusFrameMalformed {
                                arb_id: frame.arb_id,
                                reason: "pair-state payload shorter than 8 bytes",
                            }
                        );
                    }
                    return;
                }
            }
        }

        self.unknown_frames.fetch_add(1, Ordering::Relaxed);
        if self.unknown_ids.lock().unwrap().insert(frame.arb_id) {
            info!("ignoring {}", BridgeError::UnknownArbitrationId(frame.arb_id));
        }
    }

    /// Seed outputs from disk, then spawn the dispatch loop and the
    /// periodic persistence task.
    pub async fn start(self: &Arc<Self>, bus: Arc<CanBus>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.bus.lock().unwrap() = Some(bus.clone());

        if let Some(saved) = state::load(&self.state_path) {
            for device in &self.devices {
                if let Some(map) = saved.get(&device.state_key()) {
                    device.import_state(map);
                }
            }
            info!("restored state from {}", self.state_path.display());
        }

        let sys = self.clone();
        let reader = tokio::spawn(async move {
            let dispatcher = sys.clone();
            bus.run(move |frame| dispatcher.dispatch(&frame)).await;
        });

        let sys = self.clone();
        let saver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sys.stop.notified() => return,
                    _ = tokio::time::sleep(sys.save_interval) => {
                        if sys.dirty.swap(false, Ordering::Relaxed) {
                            if let Err(e) = sys.save_now() {
                                warn!("{e}");
                                sys.dirty.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(reader);
        tasks.push(saver);
        info!("system started with {} device(s)", self.devices.len());
    }

    /// Stop the loops, write a final state file and log the bus counters.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        let bus = self.bus.lock().unwrap().clone();
        if let Some(bus) = &bus {
            bus.shutdown();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        // Live fades/flashes would keep writing to the bus after the
        // dispatch loop is gone; cancel them before the final save.
        for device in &self.devices {
            device.cancel_transitions().await;
        }

        if let Err(e) = self.save_now() {
            warn!("final state save failed: {e}");
        }

        if let Some(bus) = &bus {
            let c = bus.counters();
            info!(
                "bus {}: rx={} tx={} tx_failed={} unknown={}",
                bus.interface(),
                c.received,
                c.sent,
                c.send_failures,
                self.unknown_frame_count()
            );
        }
    }

    fn collect_state(&self) -> StateMap {
        self.devices
            .iter()
            .map(|d| (d.state_key(), d.export_state()))
            .collect()
    }

    fn save_now(&self) -> Result<(), BridgeError> {
        state::save(&self.state_path, &self.collect_state())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::can::testing::RecordingSink;
    use crate::easing::EasingKind;
    use crate::output::{DimmableLight, Output, OutputInfo, Snapshot};

    fn one_light_device(device_id: u8, sink: Arc<RecordingSink>) -> Bloc9 {
        let mut slots: [Option<Output>; 6] = Default::default();
        slots[0] = Some(Output::Light(DimmableLight::new(
            OutputInfo {
                device_id,
                switch_nr: 0,
                entity_id: format!("light_{device_id}"),
                display_name: format!("Light {device_id}"),
            },
            sink,
        )));
        Bloc9::new(device_id, slots).unwrap()
    }

    fn test_system(devices: Vec<Bloc9>) -> Arc<System> {
        let path = std::env::temp_dir().join("scheiber2mqtt-system-test.json");
        System::new(devices, path, Duration::from_secs(30))
    }

    #[test]
    fn unknown_frames_are_counted_once_per_id() {
        let sink = RecordingSink::new();
        let system = test_system(vec![one_light_device(1, sink)]);

        let stray = BusFrame::new(0x1234_5678, &[0; 8]);
        system.dispatch(&stray);
        system.dispatch(&stray);
        system.dispatch(&BusFrame::new(0x1234_5679, &[0; 8]));

        assert_eq!(system.unknown_frame_count(), 3);
        assert_eq!(system.unknown_ids.lock().unwrap().len(), 2);
    }

    #[test]
    fn pair_frame_for_other_device_is_unknown() {
        let sink = RecordingSink::new();
        let system = test_system(vec![one_light_device(1, sink)]);

        // Device 10's S1/S2 pair; only device 1 is configured.
        system.dispatch(&BusFrame::new(0x0216_06D0, &[0xFF; 8]));
        assert_eq!(system.unknown_frame_count(), 1);
    }

    #[test]
    fn confirmed_change_marks_state_dirty() {
        let sink = RecordingSink::new();
        let system = test_system(vec![one_light_device(2, sink)]);
        assert!(!system.dirty.load(Ordering::Relaxed));

        system.dispatch(&BusFrame::new(
            0x0216_0690,
            &[0x40, 0x00, 0x11, 0x01, 0x00, 0x00, 0x00, 0x00],
        ));
        assert!(system.dirty.load(Ordering::Relaxed));
    }

    #[test]
    fn heartbeat_does_not_mark_dirty() {
        let sink = RecordingSink::new();
        let system = test_system(vec![one_light_device(2, sink)]);
        system.dispatch(&BusFrame::new(0x0000_0690, &[0; 8]));
        assert!(!system.dirty.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_inflight_transitions() {
        let sink = RecordingSink::new();
        let path = std::env::temp_dir().join("scheiber2mqtt-stop-test.json");
        let system = System::new(
            vec![one_light_device(2, sink.clone())],
            path.clone(),
            Duration::from_secs(30),
        );
        let light = match system.devices()[0].output(0).unwrap() {
            Output::Light(l) => l.clone(),
            Output::Switch(_) => unreachable!(),
        };

        light
            .fade_to(255, Duration::from_secs(5), Some(EasingKind::Linear))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sink.frames().is_empty());

        system.stop().await;
        let frames_at_stop = sink.frames().len();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            sink.frames().len(),
            frames_at_stop,
            "fade kept writing to the bus after stop"
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn observers_of_other_devices_stay_silent() {
        let sink = RecordingSink::new();
        let system = test_system(vec![
            one_light_device(1, sink.clone()),
            one_light_device(10, sink),
        ]);
        let seen = Arc::new(StdMutex::new(Vec::<Snapshot>::new()));
        let tap = seen.clone();
        system.devices()[0].output(0).unwrap().subscribe(move |s| {
            tap.lock().unwrap().push(s);
        });

        system.dispatch(&BusFrame::new(
            0x0216_06D0,
            &[0x30, 0x00, 0x11, 0x01, 0x00, 0x00, 0x00, 0x00],
        ));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            system.devices()[1].output(0).unwrap().snapshot(),
            Snapshot { on: true, brightness: 48 }
        );
    }
}
