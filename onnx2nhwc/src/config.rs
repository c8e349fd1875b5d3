//! Per-call translation settings.

use serde::{Deserialize, Serialize};

/// Layout the caller wants declared graph outputs delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// 4-D outputs stay (or become) channel-last image batches.
    #[default]
    Image,
    /// Every output is returned in the source's channel-first order.
    Generic,
    /// No final conversion.
    AsProduced,
}

/// Optional primitives of the target runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetCapabilities {
    /// Native grouped convolution. Without it, grouped convolutions are split
    /// per group and concatenated.
    pub grouped_conv: bool,
    /// Pad accepts one fill value per channel.
    pub per_channel_pad_fill: bool,
    /// Bounded ReLU primitive.
    pub relu6: bool,
}

impl Default for TargetCapabilities {
    fn default() -> Self {
        Self {
            grouped_conv: false,
            per_channel_pad_fill: true,
            relu6: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    pub output_layout: OutputLayout,
    /// 4-D graph inputs are fed channel-last.
    pub image_inputs: bool,
    /// Exporter operator-set version. Decides which attribute convention
    /// Upsample/Resize, Clip, Pad, Slice and friends use.
    pub opset_version: i64,
    pub capabilities: TargetCapabilities,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            output_layout: OutputLayout::Image,
            image_inputs: true,
            opset_version: 11,
            capabilities: TargetCapabilities::default(),
        }
    }
}

impl TranslateConfig {
    pub fn with_opset(mut self, opset_version: i64) -> Self {
        self.opset_version = opset_version;
        self
    }

    pub fn with_output_layout(mut self, output_layout: OutputLayout) -> Self {
        self.output_layout = output_layout;
        self
    }

    pub fn with_capabilities(mut self, capabilities: TargetCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
