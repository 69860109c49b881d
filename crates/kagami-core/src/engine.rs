//! Contracts for the face pipeline's native collaborators.

use std::fmt;

use image::GrayImage;

use crate::errors::AuthResult;
use crate::matcher::{self, Embedding};

pub type Frame = GrayImage;

/// Face bounding box in the coordinates of the frame it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStage {
    Direct,
    Enhanced,
    FullResolution,
}

impl CascadeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CascadeStage::Direct => "direct",
            CascadeStage::Enhanced => "enhanced",
            CascadeStage::FullResolution => "full_resolution",
        }
    }
}

impl fmt::Display for CascadeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CascadeDetection {
    pub faces: Vec<FaceRect>,
    /// Frame the faces were found in; encode against this one.
    pub processed: Frame,
    pub stage: CascadeStage,
    pub brightness: f64,
}

pub trait DetectionEngine {
    fn load(&mut self) -> AuthResult<()>;

    fn detect_cascade(
        &self,
        frame: &Frame,
        downscale: f32,
        confidence: f32,
    ) -> AuthResult<CascadeDetection>;

    fn encode(&self, frame: &Frame, faces: &[FaceRect]) -> AuthResult<Vec<Embedding>>;

    fn compare(&self, a: &[f64], b: &[f64]) -> f64 {
        matcher::cosine_distance(a, b)
    }

    fn deduplicate(&self, embeddings: &[Embedding], merge_threshold: f64) -> Vec<usize> {
        matcher::deduplicate(embeddings, merge_threshold)
    }
}

pub trait Camera {
    fn capture(&mut self) -> AuthResult<Frame>;
}

/// Opens per-thread camera and engine handles. Native handles are created
/// on the verifier thread and never leave it.
pub trait FaceBackend: Send + Sync {
    fn open_camera(&self) -> AuthResult<Box<dyn Camera>>;
    fn engine(&self) -> AuthResult<Box<dyn DetectionEngine>>;
}
