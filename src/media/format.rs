//! Encoder format table

/// Start-of-image marker emitted by JPEG encoders
pub const JPEG_SOI: &[u8] = &[0xFF, 0xD8];

/// Annex B start code preceding each H.264 access unit
pub const H264_START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Formats whose encoder output carries in-band frame boundaries
pub const SPLIT_FRAME_FORMATS: &[&str] = &["mjpeg", "h264"];

/// Marker that begins a new frame in `format`'s continuous output
///
/// Returns `None` for marker-less formats (raw pixel formats, for example).
pub fn boundary_marker(format: &str) -> Option<&'static [u8]> {
    match format {
        "mjpeg" => Some(JPEG_SOI),
        "h264" => Some(H264_START_CODE),
        _ => None,
    }
}

/// Whether `format` is split into frames by marker
pub fn is_split_format(format: &str) -> bool {
    SPLIT_FRAME_FORMATS.contains(&format)
}
