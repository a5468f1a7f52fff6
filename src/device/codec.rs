use std::str;

use crate::device::types::Command;

/// Decodes a telemetry frame: ASCII decimal text, surrounding whitespace allowed.
///
/// The value is not range checked here; firmware revisions disagree on the range so that
/// policy belongs to the caller.
pub fn decode(frame: &[u8]) -> Option<i32> {
    let text = str::from_utf8(frame).ok()?;
    text.trim().parse::<i32>().ok()
}

/// Encodes a command as the raw ASCII bytes of its name, without any framing.
pub fn encode(command: Command) -> &'static [u8] {
    command.name().as_bytes()
}
