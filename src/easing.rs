use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI};

use lazy_static::lazy_static;

/// Easing curves for brightness transitions. Each maps [0,1] -> [0,1] with
/// f(0)=0 and f(1)=1; the names double as the Home Assistant effect list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EasingKind {
    Linear,
    EaseInSine,
    EaseOutSine,
    EaseInOutSine,
    EaseInQuad,
    EaseOutQuad,
    EaseInOutQuad,
    EaseInCubic,
    EaseOutCubic,
    EaseInOutCubic,
    EaseInQuart,
    EaseOutQuart,
    EaseInOutQuart,
}

pub const DEFAULT_EASING: EasingKind = EasingKind::EaseInOutSine;

impl EasingKind {
    pub const ALL: [EasingKind; 13] = [
        EasingKind::Linear,
        EasingKind::EaseInSine,
        EasingKind::EaseOutSine,
        EasingKind::EaseInOutSine,
        EasingKind::EaseInQuad,
        EasingKind::EaseOutQuad,
        EasingKind::EaseInOutQuad,
        EasingKind::EaseInCubic,
        EasingKind::EaseOutCubic,
        EasingKind::EaseInOutCubic,
        EasingKind::EaseInQuart,
        EasingKind::EaseOutQuart,
        EasingKind::EaseInOutQuart,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EasingKind::Linear => "linear",
            EasingKind::EaseInSine => "ease_in_sine",
            EasingKind::EaseOutSine => "ease_out_sine",
            EasingKind::EaseInOutSine => "ease_in_out_sine",
            EasingKind::EaseInQuad => "ease_in_quad",
            EasingKind::EaseOutQuad => "ease_out_quad",
            EasingKind::EaseInOutQuad => "ease_in_out_quad",
            EasingKind::EaseInCubic => "ease_in_cubic",
            EasingKind::EaseOutCubic => "ease_out_cubic",
            EasingKind::EaseInOutCubic => "ease_in_out_cubic",
            EasingKind::EaseInQuart => "ease_in_quart",
            EasingKind::EaseOutQuart => "ease_out_quart",
            EasingKind::EaseInOutQuart => "ease_in_out_quart",
        }
    }

    pub fn from_name(name: &str) -> Option<EasingKind> {
        EASING_BY_NAME.get(name).copied()
    }

    /// Evaluate the curve. Input is clamped to [0,1] so callers can feed a
    /// raw elapsed/duration ratio.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            EasingKind::Linear => t,
            EasingKind::EaseInSine => 1.0 - (t * FRAC_PI_2).cos(),
            EasingKind::EaseOutSine => (t * FRAC_PI_2).sin(),
            EasingKind::EaseInOutSine => -((PI * t).cos() - 1.0) / 2.0,
            EasingKind::EaseInQuad => t * t,
            EasingKind::EaseOutQuad => 1.0 - (1.0 - t) * (1.0 - t),
            EasingKind::EaseInOutQuad => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
            EasingKind::EaseInCubic => t.powi(3),
            EasingKind::EaseOutCubic => 1.0 - (1.0 - t).powi(3),
            EasingKind::EaseInOutCubic => {
                if t < 0.5 {
                    4.0 * t.powi(3)
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
            EasingKind::EaseInQuart => t.powi(4),
            EasingKind::EaseOutQuart => 1.0 - (1.0 - t).powi(4),
            EasingKind::EaseInOutQuart => {
                if t < 0.5 {
                    8.0 * t.powi(4)
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(4) / 2.0
                }
            }
        }
    }

    /// Pick a curve when the caller did not name one: fading up from dark
    /// gets a soft landing, fading down to dark a soft take-off, anything
    /// else the light's stored default.
    pub fn auto_select(from: u8, target: u8, stored_default: EasingKind) -> EasingKind {
        if from == 0 && target > 0 {
            EasingKind::EaseOutCubic
        } else if target == 0 && from > 0 {
            EasingKind::EaseInCubic
        } else {
            stored_default
        }
    }
}

lazy_static! {
    static ref EASING_BY_NAME: HashMap<&'static str, EasingKind> = {
        let mut m = HashMap::new();
        for kind in EasingKind::ALL {
            m.insert(kind.name(), kind);
        }
        m
    };
}

/// The effect list advertised in every light discovery document.
pub fn effect_names() -> Vec<&'static str> {
    EasingKind::ALL.iter().map(|k| k.name()).collect()
}
