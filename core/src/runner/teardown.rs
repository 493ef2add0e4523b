use tokio::task::JoinHandle;

use super::signal;

/// Deferred cleanup for one run. Actions run in reverse registration order,
/// exactly once: on `finish`, or on drop if the run future was abandoned.
#[derive(Default)]
pub(super) struct Teardown {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl Teardown {
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(f));
    }

    pub fn abort<T>(&mut self, handle: &JoinHandle<T>) {
        let h = handle.abort_handle();
        self.defer(move || h.abort());
    }

    pub fn kill_group(&mut self, pid: u32) {
        self.defer(move || {
            if let Err(e) = signal::kill_group(pid) {
                log::warn!("Failed to kill process group {}: {}", pid, e);
            }
        });
    }

    pub fn finish(mut self) {
        self.run_actions();
    }

    fn run_actions(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run_actions();
    }
}
