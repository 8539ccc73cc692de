//! Plugin dispatch
//!
//! Each plugin class (checkpoint, burst-buffer, select) is a trait; the
//! dispatcher holds the loaded implementations behind a context lock,
//! forwards calls, and folds return codes keeping the worst error. At most
//! one plugin per class is loaded today, but the fold does not assume it.
//!
//! Calls may reach a plugin with a job that is already complete; the
//! deallocate path races with reply application by design, and plugins are
//! expected to tolerate it. No guard here second-guesses that.

pub mod burst_buffer;

pub use burst_buffer::{
    build_het_job_script, job_try_stage_in, xlate_bb_to_tres_str, BurstBufferPlugin,
};

use crate::error::{ControllerError, ControllerResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// Context shared by every call into one plugin class.
#[derive(Debug, Default)]
struct PluginContext {
    init_error: Option<String>,
}

/// Dispatcher over the loaded plugins of one class.
pub struct PluginDispatcher<P: ?Sized> {
    context: Mutex<PluginContext>,
    plugins: Vec<Arc<P>>,
}

impl<P: ?Sized> PluginDispatcher<P> {
    pub fn new(plugins: Vec<Arc<P>>) -> Self {
        PluginDispatcher {
            context: Mutex::new(PluginContext::default()),
            plugins,
        }
    }

    /// Record a failed context initialization; every later call surfaces it.
    pub fn poison(&self, error: impl Into<String>) {
        self.context.lock().init_error = Some(error.into());
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Forward a call to every loaded plugin, folding results with
    /// worst-error-wins. An empty plugin list is a successful no-op.
    pub fn dispatch<R, F>(&self, call: F) -> ControllerResult<Vec<R>>
    where
        F: Fn(&P) -> ControllerResult<R>,
    {
        {
            let context = self.context.lock();
            if let Some(err) = &context.init_error {
                return Err(ControllerError::PluginContext(err.clone()));
            }
        }
        let mut results = Vec::with_capacity(self.plugins.len());
        let mut worst: Option<ControllerError> = None;
        for plugin in &self.plugins {
            match call(plugin) {
                Ok(r) => results.push(r),
                Err(e) => {
                    let replace = match &worst {
                        None => true,
                        Some(w) => severity_rank(&e) > severity_rank(w),
                    };
                    if replace {
                        worst = Some(e);
                    }
                }
            }
        }
        match worst {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

fn severity_rank(err: &ControllerError) -> u8 {
    match err.severity() {
        "info" => 0,
        "warning" => 1,
        _ => 2,
    }
}
