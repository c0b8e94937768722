//! Hosted multimodal model interfaces used by the OCR and summary stages.
//!
//! The pipeline only needs two capabilities: describe a sheet image as
//! structured sections, and summarize a change overlay. [`HostedModelClient`]
//! talks to an OpenAI-compatible endpoint; [`OfflineServices`] derives
//! deterministic content from the diff metrics without network access.

pub mod http;
pub mod offline;
pub mod prompts;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HostedModelClient;
pub use offline::OfflineServices;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Http(String),

    #[error("Rate limited by the model endpoint")]
    RateLimited,

    #[error("Model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Model service is not configured: {0}")]
    NotConfigured(String),
}

/// Structured text read off one sheet, keyed by section
/// (`title_block`, `notes`, `revisions`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrDocument {
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

impl OcrDocument {
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|text| text.trim().is_empty())
    }
}

/// Diff facts handed to the summary model alongside the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMetadata {
    pub drawing_name: String,
    pub page_number: u32,
    pub change_count: u32,
    pub added_pixels: u64,
    pub removed_pixels: u64,
    pub overlap_pixels: u64,
    pub alignment_score: f64,
    pub composite_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_text: Option<OcrDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_text: Option<OcrDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryContent {
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub critical_change: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

pub trait VisionService: Send + Sync {
    fn extract(&self, image_png: &[u8], prompt: &str) -> Result<OcrDocument, ServiceError>;
}

pub trait SummaryService: Send + Sync {
    fn summarize(
        &self,
        overlay_png: &[u8],
        metadata: &DiffMetadata,
        prompt: &str,
    ) -> Result<SummaryContent, ServiceError>;
}
