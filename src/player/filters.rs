// ABOUTME: Audio filter configuration sent with the filters op
// ABOUTME: Every filter is optional; unset filters are omitted from the payload

use crate::protocol::messages::EqualizerBand;
use serde::{Deserialize, Serialize};

/// Active filter set of a player
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    /// Volume multiplier, 1.0 is unchanged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// Equalizer bands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    /// Vocal elimination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    /// Speed, pitch and rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    /// Volume oscillation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    /// Pitch oscillation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    /// Stereo panning rotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    /// Distortion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    /// Channel mixing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    /// Low-pass smoothing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
}

impl Filters {
    /// Whether no filter is set
    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }
}

/// Karaoke filter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    /// Effect level
    pub level: f32,
    /// Mono level
    pub mono_level: f32,
    /// Filter band in Hz
    pub filter_band: f32,
    /// Filter width
    pub filter_width: f32,
}

/// Timescale filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    /// Playback speed
    pub speed: f32,
    /// Pitch
    pub pitch: f32,
    /// Rate
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

/// Tremolo or vibrato
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    /// Frequency in Hz
    pub frequency: f32,
    /// Depth, 0 to 1
    pub depth: f32,
}

/// Rotation filter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    /// Rotation frequency in Hz
    pub rotation_hz: f32,
}

/// Distortion filter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    /// Sine offset
    pub sin_offset: f32,
    /// Sine scale
    pub sin_scale: f32,
    /// Cosine offset
    pub cos_offset: f32,
    /// Cosine scale
    pub cos_scale: f32,
    /// Tangent offset
    pub tan_offset: f32,
    /// Tangent scale
    pub tan_scale: f32,
    /// Offset
    pub offset: f32,
    /// Scale
    pub scale: f32,
}

/// Channel mix filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    /// Left into left
    pub left_to_left: f32,
    /// Left into right
    pub left_to_right: f32,
    /// Right into left
    pub right_to_left: f32,
    /// Right into right
    pub right_to_right: f32,
}

impl Default for ChannelMix {
    fn default() -> Self {
        Self {
            left_to_left: 1.0,
            left_to_right: 0.0,
            right_to_left: 0.0,
            right_to_right: 1.0,
        }
    }
}

/// Low-pass filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    /// Smoothing factor
    pub smoothing: f32,
}
