use crate::classify::RepresentationClass;
use crate::dispatch::DispatchStats;
use crate::entity::UpdateFlags;
use crate::image_manager::ImageStats;
use crate::protocol::{LocalId, TextureId};
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `SCENE_LINK_DEBUG=1`: Dump per-session batch summaries as JSON
/// - `SCENE_LINK_TRACE=1`: Enable human-readable trace logging of operations
pub fn init_debug_mode() {
    let debug = env::var("SCENE_LINK_DEBUG").is_ok();
    let trace = env::var("SCENE_LINK_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        eprintln!("[SCENE-LINK] Debug mode enabled - session summaries will be logged as JSON");
    }

    if trace {
        eprintln!("[SCENE-LINK] Trace mode enabled - human-readable operation logs");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Snapshot of one session's update pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub agent_id: String,
    pub pending: usize,
    pub in_flight: usize,
    pub stats: DispatchStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub updates: BatchSummary,
    pub images: ImageStats,
    pub active_transfers: usize,
}

/// Log a session summary in JSON format if debug mode is enabled
pub fn log_session_summary(label: &str, summary: &SessionSummary) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(summary) {
        Ok(json) => {
            eprintln!("\n[SCENE-LINK] {} Session {}:\n{}\n", label, summary.updates.agent_id, json);
        }
        Err(e) => {
            eprintln!("[SCENE-LINK] Failed to serialize session summary to JSON: {}", e);
        }
    }
}

pub fn trace_texture_progress(texture_id: TextureId, current: u32, stop: u32, sent: usize) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[SCENE-LINK] Texture {}: sent {} packets, at {}/{}", texture_id, sent, current, stop);
}

pub fn trace_classification(local_id: LocalId, mask: UpdateFlags, class: RepresentationClass, block_len: usize) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!(
        "[SCENE-LINK] Entity {} mask {:#010x} -> {:?} ({})",
        local_id,
        mask.bits(),
        class,
        format_bytes(block_len)
    );
}

pub fn trace_resend(class: RepresentationClass, updates: usize) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[SCENE-LINK] Lost {:?} packet, re-queued {} updates", class, updates);
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
