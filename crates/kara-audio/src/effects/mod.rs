//! Effect descriptors and their processors.
//!
//! [`EffectSpec`] is the closed set of effects a controller can splice
//! between its source and sink. Every payload is validated when the value is
//! constructed, so an `EffectSpec` that exists can always be instantiated.

pub mod delay;
pub mod distortion;
mod dsp;
pub mod equalizer;
pub mod reverb;

pub use delay::DelayProcessor;
pub use distortion::{DistortionProcessor, DistortionSettings};
pub use equalizer::EqualizerProcessor;
pub use reverb::{ReverbProcessor, ReverbSettings};

use kara_node::Processor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest delay a [`DelayTime`] accepts, in seconds.
pub const MAX_DELAY_SECONDS: f32 = 2.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EffectError {
    #[error("Delay time {0}s is outside (0, {MAX_DELAY_SECONDS}]")]
    InvalidDelayTime(f32),

    #[error("Unknown effect: {0}")]
    UnknownEffect(String),

    #[error("Unknown {kind} preset: {name}")]
    UnknownPreset { kind: &'static str, name: String },
}

/// Delay time in seconds, 0 < t ≤ 2.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct DelayTime(f32);

impl DelayTime {
    pub fn new(seconds: f32) -> Result<Self, EffectError> {
        if seconds.is_finite() && seconds > 0.0 && seconds <= MAX_DELAY_SECONDS {
            Ok(Self(seconds))
        } else {
            Err(EffectError::InvalidDelayTime(seconds))
        }
    }

    pub const fn seconds(self) -> f32 {
        self.0
    }
}

impl Default for DelayTime {
    fn default() -> Self {
        Self(1.0)
    }
}

impl TryFrom<f32> for DelayTime {
    type Error = EffectError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DelayTime> for f32 {
    fn from(value: DelayTime) -> Self {
        value.0
    }
}

/// Declares a closed preset enum with kebab-case names.
macro_rules! presets {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = EffectError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|p| p.name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| EffectError::UnknownPreset {
                        kind: $kind,
                        name: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

presets!(
    /// Factory distortion voicings.
    DistortionPreset, "distortion" {
        DrumsBitBrush => "drums-bit-brush",
        DrumsLoFi => "drums-lo-fi",
        MultiBrokenSpeaker => "multi-broken-speaker",
        MultiDecimated => "multi-decimated",
        MultiDistortedCubed => "multi-distorted-cubed",
        SpeechAlienChatter => "speech-alien-chatter",
        SpeechGoldenPi => "speech-golden-pi",
        SpeechRadioTower => "speech-radio-tower",
        SpeechWaves => "speech-waves",
    }
);

presets!(
    /// Factory reverb spaces.
    ReverbPreset, "reverb" {
        SmallRoom => "small-room",
        MediumRoom => "medium-room",
        LargeRoom => "large-room",
        MediumHall => "medium-hall",
        LargeHall => "large-hall",
        Plate => "plate",
        MediumChamber => "medium-chamber",
        LargeChamber => "large-chamber",
        Cathedral => "cathedral",
    }
);

/// The effect segment spliced between a controller's source and sink.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSpec {
    #[default]
    None,
    Delay(DelayTime),
    Distortion(Option<DistortionPreset>),
    Equalizer,
    Reverb(Option<ReverbPreset>),
}

impl EffectSpec {
    /// The selectable set offered by the front end.
    pub fn catalog() -> [Self; 5] {
        [
            Self::None,
            Self::Delay(DelayTime::default()),
            Self::Distortion(Some(DistortionPreset::SpeechGoldenPi)),
            Self::Equalizer,
            Self::Reverb(Some(ReverbPreset::Cathedral)),
        ]
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Delay(_) => "delay",
            Self::Distortion(_) => "distortion",
            Self::Equalizer => "equalizer",
            Self::Reverb(_) => "reverb",
        }
    }

    /// Build the processor for this effect with its preset applied.
    /// `None` yields no processor.
    pub fn instantiate(&self) -> Option<Box<dyn Processor>> {
        match *self {
            Self::None => None,
            Self::Delay(time) => Some(Box::new(DelayProcessor::new(time))),
            Self::Distortion(preset) => Some(Box::new(DistortionProcessor::new(preset))),
            Self::Equalizer => Some(Box::new(EqualizerProcessor::default())),
            Self::Reverb(preset) => Some(Box::new(ReverbProcessor::new(preset))),
        }
    }
}

impl fmt::Display for EffectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delay(time) => write!(f, "delay:{}", time.seconds()),
            Self::Distortion(Some(p)) => write!(f, "distortion:{p}"),
            Self::Reverb(Some(p)) => write!(f, "reverb:{p}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Parses `name[:argument]`, e.g. `none`, `delay:0.5`, `reverb:cathedral`, `eq`.
impl FromStr for EffectSpec {
    type Err = EffectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };

        match name.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "delay" => match arg {
                Some(secs) => {
                    let seconds = secs
                        .parse::<f32>()
                        .map_err(|_| EffectError::UnknownEffect(s.to_string()))?;
                    Ok(Self::Delay(DelayTime::new(seconds)?))
                }
                None => Ok(Self::Delay(DelayTime::default())),
            },
            "distortion" => Ok(Self::Distortion(arg.map(str::parse).transpose()?)),
            "eq" | "equalizer" => Ok(Self::Equalizer),
            "reverb" => Ok(Self::Reverb(arg.map(str::parse).transpose()?)),
            _ => Err(EffectError::UnknownEffect(s.to_string())),
        }
    }
}
