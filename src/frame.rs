use std::fmt::Write;
use std::sync::Arc;

use crate::arch::Arch;
use crate::display_utils::hex_string;
use crate::maps::MapInfo;

/// One frame of an unwound stack.
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    pub index: usize,
    /// The pc in process memory. Return addresses are adjusted to point into
    /// the call instruction.
    pub pc: u64,
    /// The pc in the object's address space.
    pub rel_pc: u64,
    pub sp: u64,
    /// Empty when unknown.
    pub function_name: String,
    pub function_offset: u64,
    /// `None` when no map contains the pc.
    pub map_info: Option<Arc<MapInfo>>,
}

/// Renders `frame` as one line:
///
/// ```text
///   #01 pc 0000000000001000  /system/lib64/libc.so (offset 0x2000) (read+100) (BuildId: 46414b45)
/// ```
///
/// The pc printed is `rel_pc`, 8 hex digits wide on 32-bit architectures
/// and 16 on 64-bit ones.
pub fn format_frame(arch: Arch, frame: &FrameData, display_build_id: bool) -> String {
    let mut data = if arch.is_64bit() {
        format!("  #{:02} pc {:016x}", frame.index, frame.rel_pc)
    } else {
        format!("  #{:02} pc {:08x}", frame.index, frame.rel_pc)
    };

    let Some(map_info) = &frame.map_info else {
        data.push_str("  <unknown>");
        return data;
    };

    if map_info.name().is_empty() {
        let _ = write!(data, "  <anonymous:{:x}>", map_info.start());
    } else {
        data.push_str("  ");
        data.push_str(&map_info.full_name());
    }
    if map_info.object_start_offset() != 0 {
        let _ = write!(data, " (offset 0x{:x})", map_info.object_start_offset());
    }

    if !frame.function_name.is_empty() {
        data.push_str(" (");
        data.push_str(&frame.function_name);
        if frame.function_offset != 0 {
            let _ = write!(data, "+{}", frame.function_offset);
        }
        data.push(')');
    }

    if display_build_id {
        if let Some(build_id) = map_info.build_id().filter(|id| !id.is_empty()) {
            let _ = write!(data, " (BuildId: {})", hex_string(&build_id));
        }
    }
    data
}
