//! Installed kernel specifications.
//!
//! Discovery is delegated to `runtimelib`, which walks the standard Jupyter
//! data directories. The bridge only needs a spec's name and how to
//! interrupt it; the argv is re-read from disk at launch.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// How a kernel wants to be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// SIGINT to the kernel process.
    #[default]
    Signal,
    /// `interrupt_request` on the control channel.
    Message,
}

impl InterruptMode {
    fn from_kernelspec(mode: Option<&str>) -> Self {
        match mode {
            Some("message") => InterruptMode::Message,
            _ => InterruptMode::Signal,
        }
    }
}

/// A kernel spec as exposed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
}

impl KernelSpecInfo {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            language: language.into(),
            interrupt_mode: InterruptMode::Signal,
        }
    }
}

/// All installed kernel specs, sorted by name.
pub async fn list_available() -> Vec<KernelSpecInfo> {
    let mut specs: Vec<KernelSpecInfo> = runtimelib::list_kernelspecs()
        .await
        .into_iter()
        .map(|s| KernelSpecInfo {
            interrupt_mode: InterruptMode::from_kernelspec(s.kernelspec.interrupt_mode.as_deref()),
            name: s.kernel_name,
            display_name: s.kernelspec.display_name,
            language: s.kernelspec.language,
        })
        .collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
}

/// Look up a single installed spec by name.
pub async fn resolve(spec_id: &str) -> Result<KernelSpecInfo> {
    let s = runtimelib::find_kernelspec(spec_id)
        .await
        .map_err(|_| KernelError::UnknownKernelSpec(spec_id.to_string()))?;
    Ok(KernelSpecInfo {
        interrupt_mode: InterruptMode::from_kernelspec(s.kernelspec.interrupt_mode.as_deref()),
        name: s.kernel_name,
        display_name: s.kernelspec.display_name,
        language: s.kernelspec.language,
    })
}
