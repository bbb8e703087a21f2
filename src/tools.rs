//! Interaction tooling.
//!
//! The demo has no event loop; tools are driven programmatically and act on
//! engine viewports. Initialization registers the default tool set and is
//! awaited by the bootstrap pipeline before any data is fetched.

use thiserror::Error;
use tracing::info;

use crate::engine::{EngineError, RenderingEngine};
use crate::volume::VoiWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    StackScroll,
    WindowLevel,
}

impl Tool {
    fn name(self) -> &'static str {
        match self {
            Tool::StackScroll => "StackScroll",
            Tool::WindowLevel => "WindowLevel",
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {0} is already registered")]
    Duplicate(&'static str),

    #[error("tool {0} is not registered")]
    Inactive(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Registry of active interaction tools.
pub struct ToolRegistry {
    active: Vec<Tool>,
}

impl ToolRegistry {
    /// Initialize the tooling subsystem with the default tool set.
    pub async fn init() -> Result<Self, ToolError> {
        let mut registry = Self { active: Vec::new() };
        registry.register(Tool::StackScroll)?;
        registry.register(Tool::WindowLevel)?;
        info!(tools = registry.active.len(), "interaction tooling initialized");
        Ok(registry)
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), ToolError> {
        if self.is_active(tool) {
            return Err(ToolError::Duplicate(tool.name()));
        }
        self.active.push(tool);
        Ok(())
    }

    pub fn is_active(&self, tool: Tool) -> bool {
        self.active.contains(&tool)
    }

    fn require(&self, tool: Tool) -> Result<(), ToolError> {
        if self.is_active(tool) {
            Ok(())
        } else {
            Err(ToolError::Inactive(tool.name()))
        }
    }

    /// Scroll a viewport through its stack by `delta` slices; returns the
    /// new slice index.
    pub fn scroll(
        &self,
        engine: &mut RenderingEngine,
        viewport_id: &str,
        delta: i64,
    ) -> Result<usize, ToolError> {
        self.require(Tool::StackScroll)?;
        Ok(engine.offset_slice(viewport_id, delta)?)
    }

    /// Set a viewport's VOI window.
    pub fn set_window(
        &self,
        engine: &mut RenderingEngine,
        viewport_id: &str,
        window: VoiWindow,
    ) -> Result<(), ToolError> {
        self.require(Tool::WindowLevel)?;
        engine.set_voi(viewport_id, window)?;
        Ok(())
    }
}
