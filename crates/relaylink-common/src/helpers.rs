//! Common helper functions for Relaylink.

/// Marker substituted for newlines in textual replies carried over signaling.
pub const LINE_BREAK_MARKER: &str = "<BR>";

/// Last segment of a broker sender path (`room/alice` -> `alice`).
pub fn peer_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Sender path the broker expects for our own outbound frames.
pub fn sender_path(channel: &str, user: &str) -> String {
    format!("{channel}/{user}")
}

/// Replaces every newline with [`LINE_BREAK_MARKER`]; a CRLF counts as one newline.
pub fn mark_line_breaks(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', LINE_BREAK_MARKER)
}
