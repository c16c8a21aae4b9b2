//! Choosing which thread to show after the whole debuggee was paused

use config::SessionConfig;

use crate::target::{ThreadId, ThreadInfo, ThreadStatus};

/// Pick the thread to present for a stop that has no originating thread
///
/// In order of preference: the thread that was last active, a UI event loop
/// thread, the thread named after `config.main_thread_name`, the first running
/// thread that has frames, and finally the first thread listed.
pub fn select_presentable_thread<'a>(
    threads: &'a [ThreadInfo],
    last_active: Option<ThreadId>,
    config: &SessionConfig,
) -> Option<&'a ThreadInfo> {
    if let Some(last) = last_active {
        if let Some(thread) = threads.iter().find(|t| t.id == last) {
            return Some(thread);
        }
    }

    threads
        .iter()
        .find(|t| config.is_ui_thread(&t.name))
        .or_else(|| threads.iter().find(|t| t.name == config.main_thread_name))
        .or_else(|| {
            threads
                .iter()
                .find(|t| t.status == ThreadStatus::Running && t.frame_count > 0)
        })
        .or_else(|| threads.first())
}
