//! Minimal Annex-B inspection, enough to tell keyframes from delta frames.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// NAL unit types in stream order. Both 3- and 4-byte start codes are accepted.
pub fn scan_nal_types(data: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            types.push(data[i + 3] & 0x1f);
            i += 3;
        } else {
            i += 1;
        }
    }
    types
}

pub fn contains_idr(data: &[u8]) -> bool {
    scan_nal_types(data).contains(&NAL_IDR)
}

/// An IDR slice preceded by its parameter sets decodes without prior frames.
pub fn is_standalone_keyframe(data: &[u8]) -> bool {
    let types = scan_nal_types(data);
    let Some(idr_at) = types.iter().position(|&t| t == NAL_IDR) else {
        return false;
    };
    let before = &types[..idr_at];
    before.contains(&NAL_SPS) && before.contains(&NAL_PPS)
}
