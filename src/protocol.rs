//! Bloc9 wire protocol: arbitration-id layout, pair-state decoding and
//! command synthesis.
//!
//! Every relevant extended id carries the DIP-configured device id in its low
//! byte as `(id << 3) | 0x80`. State for the six outputs travels in three
//! "pair" frames of two outputs each; commands go out on a single id and are
//! echoed back by the device.

/// Reported brightness at or below this value is treated as "off" unless the
/// state bit says otherwise.
pub const DIMMING_THRESHOLD: u8 = 2;

/// Brightness at or above this value is driven as hardware full-on
/// (no PWM), which the device reports as brightness 0 with the state bit set.
pub const FULL_ON_THRESHOLD: u8 = 253;

/// Heartbeat / low-priority status. Payload carries nothing we use; the id
/// alone refreshes the device online marker.
pub const HEARTBEAT_BASE: u32 = 0x0000_0600;

/// Pair-state frames: (S1,S2), (S3,S4), (S5,S6).
pub const PAIR_BASES: [u32; 3] = [0x0216_0600, 0x0218_0600, 0x021A_0600];

/// Command frames as sent by us and echoed by the device.
pub const COMMAND_BASE: u32 = 0x0236_0600;

/// A raw frame on the Scheiber bus. All ids used here are 29-bit extended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub arb_id: u32,
    pub data: Vec<u8>,
}

impl BusFrame {
    pub fn new(arb_id: u32, data: &[u8]) -> BusFrame {
        debug_assert!(data.len() <= 8);
        BusFrame {
            arb_id,
            data: data.to_vec(),
        }
    }
}

/// Low byte of every arbitration id belonging to device `device_id`.
pub fn device_byte(device_id: u8) -> u32 {
    (u32::from(device_id) << 3) | 0x80
}

pub fn heartbeat_pattern(device_id: u8) -> u32 {
    HEARTBEAT_BASE | device_byte(device_id)
}

/// Pattern of the pair-state frame carrying slots `2*pair` and `2*pair + 1`.
pub fn pair_pattern(pair: usize, device_id: u8) -> u32 {
    PAIR_BASES[pair] | device_byte(device_id)
}

pub fn command_pattern(device_id: u8) -> u32 {
    COMMAND_BASE | device_byte(device_id)
}

/// Which half of an 8-byte pair payload a slot occupies. Even slots
/// (S1/S3/S5) are in bytes 0..4, odd slots (S2/S4/S6) in bytes 4..8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Low,
    High,
}

impl Half {
    pub fn for_slot(slot: usize) -> Half {
        if slot % 2 == 0 {
            Half::Low
        } else {
            Half::High
        }
    }
}

/// Decoded state of one output as carried by its pair-frame half, with the
/// device quirks already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairLevel {
    pub on: bool,
    pub brightness: u8,
}

/// Extract one half of a pair-state payload. The payload must be 8 bytes;
/// shorter frames are rejected by the router before this is reached.
///
/// Byte 2 of each half is a PWM mode indicator (0x11 while actively dimming)
/// and is deliberately ignored.
pub fn decode_half(data: &[u8], half: Half) -> PairLevel {
    let (bright_idx, state_idx) = match half {
        Half::Low => (0, 3),
        Half::High => (4, 7),
    };
    let reported_state = data[state_idx] & 0x01 == 0x01;
    let reported_bright = data[bright_idx];

    let on = reported_state || reported_bright > DIMMING_THRESHOLD;
    // Full-brightness quirk: hardware-ON with no PWM reports brightness 0
    // and must surface as 255.
    let brightness = if on && reported_bright == 0 {
        255
    } else if on {
        reported_bright
    } else {
        0
    };
    PairLevel { on, brightness }
}

/// Drive mode byte of a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriveMode {
    Off = 0x00,
    FullOn = 0x01,
    Dimming = 0x11,
}

/// Pick the drive mode for a requested `(on, brightness)` target.
pub fn drive_mode(on: bool, brightness: u8) -> DriveMode {
    if !on || brightness <= DIMMING_THRESHOLD {
        DriveMode::Off
    } else if brightness >= FULL_ON_THRESHOLD {
        DriveMode::FullOn
    } else {
        DriveMode::Dimming
    }
}

/// Build the 4-byte command payload `[switch_nr, mode, 0x00, brightness]`.
pub fn encode_command(switch_nr: u8, on: bool, brightness: u8) -> [u8; 4] {
    let mode = drive_mode(on, brightness);
    let wire_bright = match mode {
        DriveMode::Dimming => brightness,
        // OFF and FULL ON both carry brightness 0 on the wire.
        DriveMode::Off | DriveMode::FullOn => 0,
    };
    [switch_nr, mode as u8, 0x00, wire_bright]
}

/// The complete outbound command frame for one output of one device.
pub fn command_frame(device_id: u8, switch_nr: u8, on: bool, brightness: u8) -> BusFrame {
    BusFrame::new(
        command_pattern(device_id),
        &encode_command(switch_nr, on, brightness),
    )
}

/// What an output stores after issuing a command for `(on, brightness)`:
/// the value the hardware will report back, so the echoed pair frame does
/// not produce a second observer notification.
pub fn normalize_level(on: bool, brightness: u8) -> PairLevel {
    match drive_mode(on, brightness) {
        DriveMode::Off => PairLevel {
            on: false,
            brightness: 0,
        },
        DriveMode::FullOn => PairLevel {
            on: true,
            brightness: 255,
        },
        DriveMode::Dimming => PairLevel { on: true, brightness },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_byte_layout() {
        assert_eq!(device_byte(1), 0x88);
        assert_eq!(device_byte(7), 0xB8);
        assert_eq!(device_byte(8), 0xC0);
        assert_eq!(device_byte(10), 0xD0);
    }

    #[test]
    fn patterns_include_device_byte() {
        assert_eq!(pair_pattern(1, 10), 0x0218_06D0);
        assert_eq!(pair_pattern(2, 8), 0x021A_06C0);
        assert_eq!(pair_pattern(0, 7), 0x0216_06B8);
        assert_eq!(heartbeat_pattern(3), 0x0000_0698);
        assert_eq!(command_pattern(8), 0x0236_06C0);
    }

    #[test]
    fn decode_dimming_state() {
        // S1 = {ON, 5} (state bit set), S2 = {ON, 107}.
        let data = [0x05, 0x00, 0x11, 0x01, 0x6B, 0x00, 0x11, 0x01];
        assert_eq!(
            decode_half(&data, Half::Low),
            PairLevel { on: true, brightness: 5 }
        );
        assert_eq!(
            decode_half(&data, Half::High),
            PairLevel { on: true, brightness: 107 }
        );
    }

    #[test]
    fn decode_full_brightness_quirk() {
        // Hardware full-on: state bit 1, brightness byte 0 -> 255.
        let data = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            decode_half(&data, Half::Low),
            PairLevel { on: false, brightness: 0 }
        );
        assert_eq!(
            decode_half(&data, Half::High),
            PairLevel { on: true, brightness: 255 }
        );
    }

    #[test]
    fn decode_brightness_above_threshold_forces_on() {
        let data = [0x0E, 0x00, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            decode_half(&data, Half::Low),
            PairLevel { on: true, brightness: 14 }
        );
    }

    #[test]
    fn command_synthesis_boundaries() {
        assert_eq!(encode_command(4, true, 0), [4, 0x00, 0, 0]);
        assert_eq!(encode_command(4, true, 2), [4, 0x00, 0, 0]);
        assert_eq!(encode_command(4, true, 3), [4, 0x11, 0, 3]);
        assert_eq!(encode_command(4, true, 150), [4, 0x11, 0, 150]);
        assert_eq!(encode_command(4, true, 252), [4, 0x11, 0, 252]);
        assert_eq!(encode_command(4, true, 254), [4, 0x01, 0, 0]);
        assert_eq!(encode_command(4, false, 200), [4, 0x00, 0, 0]);
    }

    #[test]
    fn command_frame_targets_device() {
        let frame = command_frame(8, 4, true, 150);
        assert_eq!(frame.arb_id, 0x0236_06C0);
        assert_eq!(frame.arb_id & 0xFF, device_byte(8));
        assert_eq!(frame.data, vec![4, 0x11, 0, 150]);
    }

    // Encoding a command and decoding the state the device reports back
    // yields the same (on, brightness), modulo the full-brightness quirk.
    #[test]
    fn command_state_round_trip() {
        for bright in [0u8, 1, 2, 3, 64, 150, 252, 253, 255] {
            let cmd = encode_command(0, true, bright);
            // The device mirrors a command into its next pair-state frame:
            // brightness byte as driven, state bit set iff not off.
            let driven_on = cmd[1] != DriveMode::Off as u8;
            let echo = [cmd[3], 0x00, cmd[1], u8::from(driven_on), 0, 0, 0, 0];
            let level = decode_half(&echo, Half::Low);
            assert_eq!(level, normalize_level(true, bright), "bright={bright}");
        }
    }
}
