//! Device output formats: sample types, channel layouts, ambisonic modes.

/// Maximum auxiliary sends per source.
pub const MAX_SENDS: usize = 6;
/// Default auxiliary sends when nothing is requested or configured.
pub const DEFAULT_SENDS: usize = 2;

/// Lowest sample rate a device will negotiate.
pub const MIN_OUTPUT_RATE: u32 = 8000;
pub const DEFAULT_OUTPUT_RATE: u32 = 44100;
pub const DEFAULT_UPDATE_SIZE: u32 = 1024;
pub const DEFAULT_NUM_UPDATES: u32 = 3;

/// Highest supported ambisonic order.
pub const MAX_AMBI_ORDER: u32 = 3;

/// Frames per internal mix chunk; larger backend periods mix in chunks of
/// this many frames.
pub const BUFFER_SIZE: usize = 1024;

pub const SPEED_OF_SOUND: f32 = 343.3;
pub const DEFAULT_METERS_PER_UNIT: f32 = 1.0;
pub const LOWPASS_FREQ_REF: f32 = 5000.0;
pub const HIGHPASS_FREQ_REF: f32 = 250.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Playback,
    Capture,
    Loopback,
}

/// Sample type produced at the device's real output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl SampleType {
    pub fn bytes(self) -> usize {
        match self {
            SampleType::I8 | SampleType::U8 => 1,
            SampleType::I16 | SampleType::U16 => 2,
            SampleType::I32 | SampleType::U32 | SampleType::F32 => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, SampleType::F32)
    }

    pub fn label(self) -> &'static str {
        match self {
            SampleType::I8 => "Signed Byte",
            SampleType::U8 => "Unsigned Byte",
            SampleType::I16 => "Signed Short",
            SampleType::U16 => "Unsigned Short",
            SampleType::I32 => "Signed Int",
            SampleType::U32 => "Unsigned Int",
            SampleType::F32 => "Float",
        }
    }

    pub fn token(self) -> i32 {
        match self {
            SampleType::I8 => crate::attrs::TYPE_I8,
            SampleType::U8 => crate::attrs::TYPE_U8,
            SampleType::I16 => crate::attrs::TYPE_I16,
            SampleType::U16 => crate::attrs::TYPE_U16,
            SampleType::I32 => crate::attrs::TYPE_I32,
            SampleType::U32 => crate::attrs::TYPE_U32,
            SampleType::F32 => crate::attrs::TYPE_F32,
        }
    }

    pub fn from_token(token: i32) -> Option<SampleType> {
        match token {
            crate::attrs::TYPE_I8 => Some(SampleType::I8),
            crate::attrs::TYPE_U8 => Some(SampleType::U8),
            crate::attrs::TYPE_I16 => Some(SampleType::I16),
            crate::attrs::TYPE_U16 => Some(SampleType::U16),
            crate::attrs::TYPE_I32 => Some(SampleType::I32),
            crate::attrs::TYPE_U32 => Some(SampleType::U32),
            crate::attrs::TYPE_F32 => Some(SampleType::F32),
            _ => None,
        }
    }

    pub fn from_config_name(name: &str) -> Option<SampleType> {
        match name {
            "int8" => Some(SampleType::I8),
            "uint8" => Some(SampleType::U8),
            "int16" => Some(SampleType::I16),
            "uint16" => Some(SampleType::U16),
            "int32" => Some(SampleType::I32),
            "uint32" => Some(SampleType::U32),
            "float32" => Some(SampleType::F32),
            _ => None,
        }
    }
}

/// Speaker arrangement produced at the device's real output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Quad,
    X51,
    X51Rear,
    X61,
    X71,
    /// Full-sphere ambisonics; the channel count derives from the order.
    Ambi3D,
}

impl ChannelLayout {
    pub fn count(self, ambi_order: u32) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Quad => 4,
            ChannelLayout::X51 | ChannelLayout::X51Rear => 6,
            ChannelLayout::X61 => 7,
            ChannelLayout::X71 => 8,
            ChannelLayout::Ambi3D => ((ambi_order + 1) * (ambi_order + 1)) as usize,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelLayout::Mono => "Mono",
            ChannelLayout::Stereo => "Stereo",
            ChannelLayout::Quad => "Quadraphonic",
            ChannelLayout::X51 => "5.1 Surround",
            ChannelLayout::X51Rear => "5.1 Surround (Rear)",
            ChannelLayout::X61 => "6.1 Surround",
            ChannelLayout::X71 => "7.1 Surround",
            ChannelLayout::Ambi3D => "Ambisonic 3D",
        }
    }

    pub fn token(self) -> i32 {
        match self {
            ChannelLayout::Mono => crate::attrs::CHANNELS_MONO,
            ChannelLayout::Stereo => crate::attrs::CHANNELS_STEREO,
            ChannelLayout::Quad => crate::attrs::CHANNELS_QUAD,
            ChannelLayout::X51 | ChannelLayout::X51Rear => crate::attrs::CHANNELS_5POINT1,
            ChannelLayout::X61 => crate::attrs::CHANNELS_6POINT1,
            ChannelLayout::X71 => crate::attrs::CHANNELS_7POINT1,
            ChannelLayout::Ambi3D => crate::attrs::CHANNELS_BFORMAT3D,
        }
    }

    pub fn from_token(token: i32) -> Option<ChannelLayout> {
        match token {
            crate::attrs::CHANNELS_MONO => Some(ChannelLayout::Mono),
            crate::attrs::CHANNELS_STEREO => Some(ChannelLayout::Stereo),
            crate::attrs::CHANNELS_QUAD => Some(ChannelLayout::Quad),
            crate::attrs::CHANNELS_5POINT1 => Some(ChannelLayout::X51),
            crate::attrs::CHANNELS_6POINT1 => Some(ChannelLayout::X61),
            crate::attrs::CHANNELS_7POINT1 => Some(ChannelLayout::X71),
            crate::attrs::CHANNELS_BFORMAT3D => Some(ChannelLayout::Ambi3D),
            _ => None,
        }
    }

    /// Config-file `channels` names; ambisonic entries carry their order.
    pub fn from_config_name(name: &str) -> Option<(ChannelLayout, u32)> {
        match name {
            "mono" => Some((ChannelLayout::Mono, 0)),
            "stereo" => Some((ChannelLayout::Stereo, 0)),
            "quad" => Some((ChannelLayout::Quad, 0)),
            "surround51" => Some((ChannelLayout::X51, 0)),
            "surround51rear" => Some((ChannelLayout::X51Rear, 0)),
            "surround61" => Some((ChannelLayout::X61, 0)),
            "surround71" => Some((ChannelLayout::X71, 0)),
            "ambi1" => Some((ChannelLayout::Ambi3D, 1)),
            "ambi2" => Some((ChannelLayout::Ambi3D, 2)),
            "ambi3" => Some((ChannelLayout::Ambi3D, 3)),
            _ => None,
        }
    }
}

/// Ambisonic channel ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiLayout {
    Acn,
    FuMa,
}

impl AmbiLayout {
    pub fn token(self) -> i32 {
        match self {
            AmbiLayout::Acn => crate::attrs::AMBI_ACN,
            AmbiLayout::FuMa => crate::attrs::AMBI_FUMA,
        }
    }

    pub fn from_token(token: i32) -> Option<AmbiLayout> {
        match token {
            crate::attrs::AMBI_ACN => Some(AmbiLayout::Acn),
            crate::attrs::AMBI_FUMA => Some(AmbiLayout::FuMa),
            _ => None,
        }
    }
}

/// Ambisonic normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiScaling {
    N3D,
    SN3D,
    FuMa,
}

impl AmbiScaling {
    pub fn token(self) -> i32 {
        match self {
            AmbiScaling::N3D => crate::attrs::AMBI_N3D,
            AmbiScaling::SN3D => crate::attrs::AMBI_SN3D,
            AmbiScaling::FuMa => crate::attrs::AMBI_FUMA,
        }
    }

    pub fn from_token(token: i32) -> Option<AmbiScaling> {
        match token {
            crate::attrs::AMBI_N3D => Some(AmbiScaling::N3D),
            crate::attrs::AMBI_SN3D => Some(AmbiScaling::SN3D),
            crate::attrs::AMBI_FUMA => Some(AmbiScaling::FuMa),
            _ => None,
        }
    }
}

/// Which of the format fields were explicit application/config requests.
/// A request the backend cannot honour is cleared (and logged) rather than
/// failing the reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub channels: bool,
    pub sample_type: bool,
    pub frequency: bool,
}

/// The negotiated output format of a device. Immutable while the device is
/// running; rewritten only between backend stop and start.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFormat {
    pub frequency: u32,
    pub channels: ChannelLayout,
    pub sample_type: SampleType,
    pub ambi_order: u32,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
    /// Frames per mix tick.
    pub update_size: u32,
    /// Ring depth, in updates.
    pub num_updates: u32,
    pub requests: RequestFlags,
}

impl Default for DeviceFormat {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_OUTPUT_RATE,
            channels: ChannelLayout::Stereo,
            sample_type: SampleType::F32,
            ambi_order: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::SN3D,
            update_size: DEFAULT_UPDATE_SIZE,
            num_updates: DEFAULT_NUM_UPDATES,
            requests: RequestFlags::default(),
        }
    }
}

impl DeviceFormat {
    pub fn channel_count(&self) -> usize {
        self.channels.count(self.ambi_order)
    }

    pub fn frame_bytes(&self) -> usize {
        self.channel_count() * self.sample_type.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambisonic_channel_counts() {
        assert_eq!(ChannelLayout::Ambi3D.count(1), 4);
        assert_eq!(ChannelLayout::Ambi3D.count(2), 9);
        assert_eq!(ChannelLayout::Ambi3D.count(3), 16);
    }

    #[test]
    fn token_round_trips() {
        for layout in [
            ChannelLayout::Mono,
            ChannelLayout::Stereo,
            ChannelLayout::Quad,
            ChannelLayout::X51,
            ChannelLayout::X61,
            ChannelLayout::X71,
            ChannelLayout::Ambi3D,
        ] {
            assert_eq!(ChannelLayout::from_token(layout.token()), Some(layout));
        }
        assert_eq!(SampleType::from_token(SampleType::F32.token()), Some(SampleType::F32));
    }

    #[test]
    fn frame_bytes_follow_format() {
        let fmt = DeviceFormat {
            channels: ChannelLayout::X51,
            sample_type: SampleType::I16,
            ..DeviceFormat::default()
        };
        assert_eq!(fmt.frame_bytes(), 12);
    }
}
