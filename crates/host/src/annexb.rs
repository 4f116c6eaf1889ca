//! Annex B elementary-stream maintenance.
//!
//! NAL unit extraction and keyframe/parameter-set classification for H.264
//! and HEVC. The video pipeline must hand the client keyframes a decoder can
//! initialize from cold (SPS+PPS, plus VPS for HEVC) and must keep parameter
//! sets off non-keyframes.

use aircatch_protocol::VideoCodec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalClass {
    Vps,
    Sps,
    Pps,
    Keyframe,
    Other,
}

fn classify(codec: VideoCodec, nal_header: u8) -> NalClass {
    match codec {
        VideoCodec::H264 => match nal_header & 0x1F {
            5 => NalClass::Keyframe,
            7 => NalClass::Sps,
            8 => NalClass::Pps,
            _ => NalClass::Other,
        },
        // HEVC: type lives in bits 1..6 of the first header byte.
        _ => match (nal_header >> 1) & 0x3F {
            16..=21 => NalClass::Keyframe, // BLA/IDR/CRA
            32 => NalClass::Vps,
            33 => NalClass::Sps,
            34 => NalClass::Pps,
            _ => NalClass::Other,
        },
    }
}

/// Byte ranges of NAL unit payloads (start code excluded), in stream order.
/// Accepts both 3- and 4-byte start codes.
fn nal_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            } else if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
        }
        i += 1;
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let end = if idx + 1 < starts.len() {
            let next = starts[idx + 1];
            if next >= 4 && data[next - 4..next] == START_CODE {
                next - 4
            } else {
                next - 3
            }
        } else {
            data.len()
        };
        ranges.push((start, end));
    }
    ranges
}

/// Whether the access unit contains a keyframe slice.
pub fn contains_keyframe(data: &[u8], codec: VideoCodec) -> bool {
    nal_ranges(data)
        .iter()
        .any(|&(start, _)| classify(codec, data[start]) == NalClass::Keyframe)
}

/// Parameter sets needed to initialize a decoder from scratch, kept with
/// their start codes so they can be prepended verbatim.
#[derive(Debug, Default, Clone)]
pub struct ParameterSetCache {
    sets: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct SetScan {
    vps: bool,
    sps: bool,
    pps: bool,
    bytes: Vec<u8>,
}

impl SetScan {
    fn complete(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.sps && self.pps,
            _ => self.vps && self.sps && self.pps,
        }
    }
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached sets. Called after an encoder compression error; the
    /// next keyframe with in-band sets re-seeds the cache.
    pub fn invalidate(&mut self) {
        self.sets = None;
    }

    pub fn is_seeded(&self) -> bool {
        self.sets.is_some()
    }

    /// Normalize an access unit for delivery.
    ///
    /// Keyframes: a complete in-band parameter set re-seeds the cache and
    /// passes through; an incomplete or absent one is replaced by the cached
    /// sets. `None` when neither source can produce a decodable keyframe;
    /// the caller drops the frame without assigning a frame id.
    ///
    /// Non-keyframes: parameter sets are stripped.
    pub fn prepare(&mut self, data: &[u8], codec: VideoCodec) -> Option<Vec<u8>> {
        let ranges = nal_ranges(data);
        if ranges.is_empty() {
            return None;
        }

        let mut scan = SetScan::default();
        let mut keyframe = false;
        for &(start, end) in &ranges {
            let class = classify(codec, data[start]);
            if class == NalClass::Keyframe {
                keyframe = true;
                continue;
            }
            // Only sets ahead of the slice form a usable decoder-init prefix.
            if keyframe {
                continue;
            }
            match class {
                NalClass::Vps => scan.vps = true,
                NalClass::Sps => scan.sps = true,
                NalClass::Pps => scan.pps = true,
                NalClass::Keyframe | NalClass::Other => continue,
            }
            scan.bytes.extend_from_slice(&START_CODE);
            scan.bytes.extend_from_slice(&data[start..end]);
        }

        let has_sets = scan.vps || scan.sps || scan.pps;
        if keyframe {
            if scan.complete(codec) {
                self.sets = Some(scan.bytes);
                return Some(data.to_vec());
            }
            let cached = self.sets.as_ref()?;
            let mut out = Vec::with_capacity(cached.len() + data.len());
            out.extend_from_slice(cached);
            append_without_parameter_sets(&mut out, data, &ranges, codec);
            Some(out)
        } else if has_sets {
            let mut out = Vec::with_capacity(data.len());
            append_without_parameter_sets(&mut out, data, &ranges, codec);
            if out.is_empty() { None } else { Some(out) }
        } else {
            Some(data.to_vec())
        }
    }
}

fn append_without_parameter_sets(
    out: &mut Vec<u8>,
    data: &[u8],
    ranges: &[(usize, usize)],
    codec: VideoCodec,
) {
    for &(start, end) in ranges {
        match classify(codec, data[start]) {
            NalClass::Vps | NalClass::Sps | NalClass::Pps => continue,
            _ => {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(&data[start..end]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.push(header);
        out.extend_from_slice(body);
        out
    }

    // H.264 headers: 0x67 SPS, 0x68 PPS, 0x65 IDR, 0x61 non-IDR slice.
    fn h264_keyframe() -> Vec<u8> {
        let mut au = nal(0x67, &[0x4D, 0x40, 0x28]);
        au.extend(nal(0x68, &[0xEE, 0x3C]));
        au.extend(nal(0x65, &[0x88, 0x80, 0x40]));
        au
    }

    // HEVC headers (type << 1): 0x40 VPS, 0x42 SPS, 0x44 PPS,
    // 0x26 IDR_W_RADL, 0x02 trailing picture.
    fn hevc_keyframe() -> Vec<u8> {
        let mut au = nal(0x40, &[0x01]);
        au.extend(nal(0x42, &[0x02]));
        au.extend(nal(0x44, &[0x03]));
        au.extend(nal(0x26, &[0xAA, 0xBB]));
        au
    }

    #[test]
    fn h264_idr_detected_with_4byte_start_code() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x65, 0xAB, 0xCD];
        assert!(contains_keyframe(&data, VideoCodec::H264));
    }

    #[test]
    fn h264_idr_detected_with_3byte_start_code() {
        let data = [0x00, 0x00, 0x01, 0x65, 0xAB, 0xCD];
        assert!(contains_keyframe(&data, VideoCodec::H264));
    }

    #[test]
    fn h264_non_idr_slice_is_not_a_keyframe() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x61, 0xAB, 0xCD];
        assert!(!contains_keyframe(&data, VideoCodec::H264));
    }

    #[test]
    fn hevc_idr_and_cra_detected() {
        // IDR_W_RADL (19): header 0x26; CRA (21): header 0x2A
        assert!(contains_keyframe(&nal(0x26, &[0]), VideoCodec::HevcMain));
        assert!(contains_keyframe(&nal(0x2A, &[0]), VideoCodec::HevcMain));
        // Trailing picture (1): header 0x02
        assert!(!contains_keyframe(&nal(0x02, &[0]), VideoCodec::HevcMain));
    }

    #[test]
    fn empty_and_garbage_data_have_no_keyframe() {
        assert!(!contains_keyframe(&[], VideoCodec::H264));
        assert!(!contains_keyframe(&[0xFF, 0xFE, 0xFD], VideoCodec::H264));
    }

    #[test]
    fn complete_keyframe_passes_through_and_seeds_cache() {
        let mut cache = ParameterSetCache::new();
        let au = h264_keyframe();
        let out = cache.prepare(&au, VideoCodec::H264).unwrap();
        assert_eq!(out, au);
        assert!(cache.is_seeded());
    }

    #[test]
    fn bare_keyframe_gets_cached_sets_prepended() {
        let mut cache = ParameterSetCache::new();
        cache.prepare(&h264_keyframe(), VideoCodec::H264).unwrap();

        let bare_idr = nal(0x65, &[0x99, 0x98]);
        let out = cache.prepare(&bare_idr, VideoCodec::H264).unwrap();
        // SPS then PPS then the IDR slice
        assert_eq!(out[4], 0x67);
        let ranges = nal_ranges(&out);
        assert_eq!(ranges.len(), 3);
        assert_eq!(out[ranges[1].0], 0x68);
        assert_eq!(out[ranges[2].0], 0x65);
        assert_eq!(&out[ranges[2].0 + 1..ranges[2].1], &[0x99, 0x98]);
    }

    #[test]
    fn bare_keyframe_without_cache_cannot_be_built() {
        let mut cache = ParameterSetCache::new();
        let bare_idr = nal(0x65, &[0x99]);
        assert!(cache.prepare(&bare_idr, VideoCodec::H264).is_none());
    }

    #[test]
    fn invalidate_forces_reseed() {
        let mut cache = ParameterSetCache::new();
        cache.prepare(&h264_keyframe(), VideoCodec::H264).unwrap();
        cache.invalidate();
        assert!(!cache.is_seeded());
        let bare_idr = nal(0x65, &[0x99]);
        assert!(cache.prepare(&bare_idr, VideoCodec::H264).is_none());
        // Next in-band keyframe re-seeds
        cache.prepare(&h264_keyframe(), VideoCodec::H264).unwrap();
        assert!(cache.prepare(&bare_idr, VideoCodec::H264).is_some());
    }

    #[test]
    fn parameter_sets_are_stripped_from_non_keyframes() {
        let mut cache = ParameterSetCache::new();
        let mut au = nal(0x67, &[0x4D]);
        au.extend(nal(0x61, &[0x12, 0x34]));
        let out = cache.prepare(&au, VideoCodec::H264).unwrap();
        let ranges = nal_ranges(&out);
        assert_eq!(ranges.len(), 1);
        assert_eq!(out[ranges[0].0], 0x61);
    }

    #[test]
    fn plain_non_keyframe_passes_through() {
        let mut cache = ParameterSetCache::new();
        let au = nal(0x61, &[0x12, 0x34]);
        assert_eq!(cache.prepare(&au, VideoCodec::H264).unwrap(), au);
    }

    #[test]
    fn hevc_keyframe_needs_vps_too() {
        let mut cache = ParameterSetCache::new();
        // SPS + PPS + IDR but no VPS: incomplete for HEVC, no cache yet
        let mut au = nal(0x42, &[0x02]);
        au.extend(nal(0x44, &[0x03]));
        au.extend(nal(0x26, &[0xAA]));
        assert!(cache.prepare(&au, VideoCodec::HevcMain).is_none());

        cache.prepare(&hevc_keyframe(), VideoCodec::HevcMain).unwrap();
        assert!(cache.is_seeded());

        // The incomplete keyframe can now be repaired from the cache, with
        // its partial in-band sets replaced wholesale.
        let out = cache.prepare(&au, VideoCodec::HevcMain).unwrap();
        let ranges = nal_ranges(&out);
        assert_eq!(ranges.len(), 4);
        assert_eq!(out[ranges[0].0], 0x40);
        assert_eq!(out[ranges[3].0], 0x26);
    }
}
