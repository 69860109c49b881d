//! dlib-backed detection engine and the production [`FaceBackend`].

use std::env;
use std::path::PathBuf;

use dlib_face_recognition::{
    FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
    LandmarkPredictor, LandmarkPredictorTrait, Rectangle,
};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use kagami_config::ResolvedConfig;
use tracing::debug;

use crate::capture::{CaptureSettings, V4lCamera};
use crate::engine::{
    Camera, CascadeDetection, CascadeStage, DetectionEngine, FaceBackend, FaceRect, Frame,
};
use crate::errors::{AuthError, AuthResult};
use crate::matcher::Embedding;

const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";

/// Mean brightness below which the cascade retries on a contrast-stretched frame.
pub const LOW_LIGHT_BRIGHTNESS: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceModelPaths {
    pub landmark: PathBuf,
    pub encoder: PathBuf,
}

impl FaceModelPaths {
    /// Configured paths win over the `DLIB_*_MODEL` environment variables.
    pub fn resolve(landmark: Option<PathBuf>, encoder: Option<PathBuf>) -> AuthResult<Self> {
        let landmark = landmark
            .or_else(|| env::var_os(LANDMARK_ENV).map(PathBuf::from))
            .ok_or(AuthError::MissingModel {
                kind: "landmark predictor",
                key: "landmark_model",
            })?;
        let encoder = encoder
            .or_else(|| env::var_os(ENCODER_ENV).map(PathBuf::from))
            .ok_or(AuthError::MissingModel {
                kind: "face encoding network",
                key: "encoder_model",
            })?;
        Ok(Self { landmark, encoder })
    }
}

struct LoadedModels {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
}

pub struct DlibEngine {
    landmark: Option<PathBuf>,
    encoder: Option<PathBuf>,
    jitters: u32,
    models: Option<LoadedModels>,
}

impl DlibEngine {
    pub fn new(landmark: Option<PathBuf>, encoder: Option<PathBuf>, jitters: u32) -> Self {
        Self {
            landmark,
            encoder,
            jitters,
            models: None,
        }
    }

    fn models(&self) -> AuthResult<&LoadedModels> {
        self.models.as_ref().ok_or(AuthError::EngineNotLoaded)
    }

    fn detect(&self, frame: &Frame) -> AuthResult<Vec<FaceRect>> {
        let matrix = to_matrix(frame);
        let locations = self.models()?.detector.face_locations(&matrix);
        Ok(locations
            .iter()
            .map(|rect| FaceRect {
                left: rect.left,
                top: rect.top,
                right: rect.right,
                bottom: rect.bottom,
            })
            .collect())
    }
}

impl DetectionEngine for DlibEngine {
    fn load(&mut self) -> AuthResult<()> {
        if self.models.is_some() {
            return Ok(());
        }
        let paths = FaceModelPaths::resolve(self.landmark.clone(), self.encoder.clone())?;
        debug!(target: "kagami::face", path = %paths.landmark.display(), "loading landmark model");
        let predictor =
            LandmarkPredictor::open(&paths.landmark).map_err(|message| AuthError::ModelLoad {
                path: paths.landmark.clone(),
                message,
            })?;
        debug!(target: "kagami::face", path = %paths.encoder.display(), "loading encoder model");
        let encoder =
            FaceEncoderNetwork::open(&paths.encoder).map_err(|message| AuthError::ModelLoad {
                path: paths.encoder.clone(),
                message,
            })?;
        self.models = Some(LoadedModels {
            detector: FaceDetector::new(),
            predictor,
            encoder,
        });
        Ok(())
    }

    /// The HOG detector reports no score, so `confidence` has no effect here.
    fn detect_cascade(
        &self,
        frame: &Frame,
        downscale: f32,
        _confidence: f32,
    ) -> AuthResult<CascadeDetection> {
        let brightness = mean_brightness(frame);
        let scaled = downscaled(frame, downscale);
        let primary = scaled.as_ref().unwrap_or(frame);

        let faces = self.detect(primary)?;
        if !faces.is_empty() {
            return Ok(CascadeDetection {
                faces,
                processed: primary.clone(),
                stage: CascadeStage::Direct,
                brightness,
            });
        }

        if brightness < LOW_LIGHT_BRIGHTNESS {
            let enhanced = stretch_contrast(primary);
            let faces = self.detect(&enhanced)?;
            if !faces.is_empty() {
                return Ok(CascadeDetection {
                    faces,
                    processed: enhanced,
                    stage: CascadeStage::Enhanced,
                    brightness,
                });
            }
        }

        if scaled.is_some() {
            let faces = self.detect(frame)?;
            return Ok(CascadeDetection {
                faces,
                processed: frame.clone(),
                stage: CascadeStage::FullResolution,
                brightness,
            });
        }

        Ok(CascadeDetection {
            faces: Vec::new(),
            processed: primary.clone(),
            stage: CascadeStage::Direct,
            brightness,
        })
    }

    fn encode(&self, frame: &Frame, faces: &[FaceRect]) -> AuthResult<Vec<Embedding>> {
        let models = self.models()?;
        let matrix = to_matrix(frame);
        let landmarks: Vec<_> = faces
            .iter()
            .map(|face| {
                let rect = Rectangle {
                    left: face.left,
                    top: face.top,
                    right: face.right,
                    bottom: face.bottom,
                };
                models.predictor.face_landmarks(&matrix, &rect)
            })
            .collect();
        let encodings = models
            .encoder
            .get_face_encodings(&matrix, &landmarks, self.jitters);
        Ok(encodings
            .iter()
            .map(|encoding| encoding.as_ref().to_vec())
            .collect())
    }
}

fn to_matrix(frame: &Frame) -> ImageMatrix {
    let rgb = DynamicImage::ImageLuma8(frame.clone()).to_rgb8();
    ImageMatrix::from_image(&rgb)
}

fn downscaled(frame: &Frame, factor: f32) -> Option<Frame> {
    if !(factor > 0.0 && factor < 1.0) {
        return None;
    }
    let width = ((frame.width() as f32) * factor).round().max(1.0) as u32;
    let height = ((frame.height() as f32) * factor).round().max(1.0) as u32;
    Some(imageops::resize(frame, width, height, FilterType::Triangle))
}

pub fn mean_brightness(frame: &Frame) -> f64 {
    let raw = frame.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    raw.iter().map(|&px| px as f64).sum::<f64>() / raw.len() as f64
}

/// Linearly stretches the frame's intensity range to the full 0..=255 span.
pub fn stretch_contrast(frame: &Frame) -> Frame {
    let raw = frame.as_raw();
    let (Some(&low), Some(&high)) = (raw.iter().min(), raw.iter().max()) else {
        return frame.clone();
    };
    if high <= low {
        return frame.clone();
    }
    let span = (high - low) as f32;
    let mut out = frame.clone();
    for px in out.pixels_mut() {
        px.0[0] = (((px.0[0] - low) as f32 / span) * 255.0).round() as u8;
    }
    out
}

/// Opens V4L2 cameras and dlib engines from the resolved configuration.
#[derive(Debug, Clone)]
pub struct DlibFaceBackend {
    capture: CaptureSettings,
    landmark: Option<PathBuf>,
    encoder: Option<PathBuf>,
    jitters: u32,
}

impl DlibFaceBackend {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            capture: CaptureSettings::from_config(config),
            landmark: config.landmark_model.clone(),
            encoder: config.encoder_model.clone(),
            jitters: config.jitters,
        }
    }
}

impl FaceBackend for DlibFaceBackend {
    fn open_camera(&self) -> AuthResult<Box<dyn Camera>> {
        Ok(Box::new(V4lCamera::open(&self.capture)?))
    }

    fn engine(&self) -> AuthResult<Box<dyn DetectionEngine>> {
        Ok(Box::new(DlibEngine::new(
            self.landmark.clone(),
            self.encoder.clone(),
            self.jitters,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn brightness_is_mean_intensity() {
        let frame = GrayImage::from_vec(2, 2, vec![0, 100, 200, 100]).unwrap();
        assert!((mean_brightness(&frame) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn contrast_stretch_spans_full_range() {
        let frame = GrayImage::from_vec(3, 1, vec![20, 30, 40]).unwrap();
        let stretched = stretch_contrast(&frame);
        assert_eq!(stretched.as_raw(), &vec![0, 128, 255]);
    }

    #[test]
    fn flat_frames_are_left_alone() {
        let frame = GrayImage::from_vec(2, 1, vec![9, 9]).unwrap();
        assert_eq!(stretch_contrast(&frame).as_raw(), &vec![9, 9]);
    }

    #[test]
    fn downscale_ignores_identity_factor() {
        let frame = GrayImage::new(8, 6);
        assert!(downscaled(&frame, 1.0).is_none());
        let small = downscaled(&frame, 0.5).unwrap();
        assert_eq!((small.width(), small.height()), (4, 3));
    }

    #[test]
    fn engine_refuses_work_before_load() {
        let engine = DlibEngine::new(None, None, 1);
        let frame = GrayImage::new(4, 4);
        assert!(matches!(
            engine.encode(&frame, &[]),
            Err(AuthError::EngineNotLoaded)
        ));
    }

    #[test]
    fn configured_model_paths_win() {
        let paths = FaceModelPaths::resolve(
            Some(PathBuf::from("/models/landmark.dat")),
            Some(PathBuf::from("/models/encoder.dat")),
        )
        .unwrap();
        assert_eq!(paths.landmark, PathBuf::from("/models/landmark.dat"));
        assert_eq!(paths.encoder, PathBuf::from("/models/encoder.dat"));
    }
}
