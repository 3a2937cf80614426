//! Attribute tokens and zero-terminated attribute lists.
//!
//! Contexts are created and devices reset with a flat `i32` array of
//! `(token, value)` pairs terminated by a zero token; `ALL_ATTRIBUTES`
//! queries produce the same layout.

/// Boolean / tri-state values used in attribute lists.
pub const FALSE: i32 = 0;
pub const TRUE: i32 = 1;
pub const DONT_CARE: i32 = 2;

// Tunable attributes, accepted by `create_context` / `reset`.
pub const ATTR_FREQUENCY: i32 = 0x1001;
pub const ATTR_REFRESH: i32 = 0x1002;
pub const ATTR_SYNC: i32 = 0x1003;
pub const ATTR_MONO_SOURCES: i32 = 0x1004;
pub const ATTR_STEREO_SOURCES: i32 = 0x1005;
pub const ATTR_MAX_AUXILIARY_SENDS: i32 = 0x1006;
pub const ATTR_FORMAT_CHANNELS: i32 = 0x1007;
pub const ATTR_FORMAT_TYPE: i32 = 0x1008;
pub const ATTR_AMBISONIC_LAYOUT: i32 = 0x1009;
pub const ATTR_AMBISONIC_SCALING: i32 = 0x100A;
pub const ATTR_AMBISONIC_ORDER: i32 = 0x100B;
pub const ATTR_HRTF: i32 = 0x100C;
pub const ATTR_HRTF_ID: i32 = 0x100D;
pub const ATTR_OUTPUT_LIMITER: i32 = 0x100E;

// Query-only parameters.
pub const ATTR_MAJOR_VERSION: i32 = 0x1100;
pub const ATTR_MINOR_VERSION: i32 = 0x1101;
pub const ATTR_ATTRIBUTES_SIZE: i32 = 0x1102;
pub const ATTR_ALL_ATTRIBUTES: i32 = 0x1103;
pub const ATTR_CAPTURE_SAMPLES: i32 = 0x1104;
pub const ATTR_CONNECTED: i32 = 0x1105;
pub const ATTR_HRTF_STATUS: i32 = 0x1106;
pub const ATTR_NUM_HRTF_SPECIFIERS: i32 = 0x1107;
pub const ATTR_MAX_AMBISONIC_ORDER: i32 = 0x1108;
pub const ATTR_DEVICE_CLOCK: i32 = 0x1109;
pub const ATTR_DEVICE_LATENCY: i32 = 0x110A;

// Channel-layout tokens.
pub const CHANNELS_MONO: i32 = 0x1500;
pub const CHANNELS_STEREO: i32 = 0x1501;
pub const CHANNELS_QUAD: i32 = 0x1502;
pub const CHANNELS_5POINT1: i32 = 0x1503;
pub const CHANNELS_6POINT1: i32 = 0x1504;
pub const CHANNELS_7POINT1: i32 = 0x1505;
pub const CHANNELS_BFORMAT3D: i32 = 0x1506;

// Sample-type tokens.
pub const TYPE_I8: i32 = 0x1600;
pub const TYPE_U8: i32 = 0x1601;
pub const TYPE_I16: i32 = 0x1602;
pub const TYPE_U16: i32 = 0x1603;
pub const TYPE_I32: i32 = 0x1604;
pub const TYPE_U32: i32 = 0x1605;
pub const TYPE_F32: i32 = 0x1606;

// Ambisonic layout/scaling tokens.
pub const AMBI_ACN: i32 = 0x1700;
pub const AMBI_FUMA: i32 = 0x1701;
pub const AMBI_N3D: i32 = 0x1702;
pub const AMBI_SN3D: i32 = 0x1703;

// HRTF status values.
pub const HRTF_DISABLED: i32 = 0;
pub const HRTF_ENABLED: i32 = 1;
pub const HRTF_DENIED: i32 = 2;
pub const HRTF_REQUIRED: i32 = 3;
pub const HRTF_UNSUPPORTED_FORMAT: i32 = 4;

/// Iterates the `(token, value)` pairs of a zero-terminated attribute list.
/// Iteration stops at the zero token or at a trailing unpaired token.
pub fn pairs(list: &[i32]) -> AttrPairs<'_> {
    AttrPairs { list, index: 0 }
}

pub struct AttrPairs<'a> {
    list: &'a [i32],
    index: usize,
}

impl<'a> Iterator for AttrPairs<'a> {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<(i32, i32)> {
        let token = *self.list.get(self.index)?;
        if token == 0 {
            return None;
        }
        let value = *self.list.get(self.index + 1)?;
        self.index += 2;
        Some((token, value))
    }
}

/// True when the list carries at least one attribute pair.
pub fn has_attributes(list: Option<&[i32]>) -> bool {
    matches!(list, Some(l) if l.first().is_some_and(|&t| t != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_stop_at_terminator() {
        let list = [ATTR_FREQUENCY, 48000, ATTR_MAX_AUXILIARY_SENDS, 2, 0];
        let got: Vec<_> = pairs(&list).collect();
        assert_eq!(
            got,
            vec![(ATTR_FREQUENCY, 48000), (ATTR_MAX_AUXILIARY_SENDS, 2)]
        );
    }

    #[test]
    fn empty_and_unterminated_lists() {
        assert_eq!(pairs(&[]).count(), 0);
        assert_eq!(pairs(&[0]).count(), 0);
        // A trailing token with no value is dropped.
        assert_eq!(pairs(&[ATTR_FREQUENCY]).count(), 0);
        assert!(!has_attributes(None));
        assert!(!has_attributes(Some(&[0])));
        assert!(has_attributes(Some(&[ATTR_FREQUENCY, 44100, 0])));
    }
}
