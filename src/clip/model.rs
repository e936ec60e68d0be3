//! CLIP model implementation using ONNX Runtime

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::tokenizer::{ClipTokenizer, CONTEXT_LENGTH};
use super::{l2_normalize, Embedding, EmbeddingProvider};
use crate::error::FilerError;
use crate::scanner::{content_hash, short_hash};

const VISUAL_FILE: &str = "visual.onnx";
const TEXT_FILE: &str = "text.onnx";
const VOCAB_FILE: &str = "vocab.json";
const MERGES_FILE: &str = "merges.txt";
const CONFIG_FILE: &str = "config.json";

/// CLIP input resolution (ViT-B/32).
const INPUT_SIZE: u32 = 224;

// CLIP normalization constants
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// CLIP visual and text encoders loaded from a local directory.
///
/// ONNX sessions need exclusive access while running, so each encoder sits
/// behind its own mutex; callers only ever see `&self`.
pub struct ClipModel {
    model_id: String,
    visual: Mutex<Session>,
    text: Mutex<Session>,
    tokenizer: ClipTokenizer,
}

impl ClipModel {
    /// Load the model from `dir`. Never touches the network: a missing or
    /// incomplete directory is reported as [`FilerError::ModelUnavailable`].
    pub fn load(dir: &Path, intra_threads: usize) -> Result<Self, FilerError> {
        let unavailable = |reason: String| FilerError::ModelUnavailable {
            path: dir.to_path_buf(),
            reason,
        };

        if !dir.is_dir() {
            return Err(unavailable("model directory not found".to_string()));
        }
        for file in [VISUAL_FILE, TEXT_FILE, VOCAB_FILE, MERGES_FILE] {
            if !dir.join(file).is_file() {
                return Err(unavailable(format!("missing {}", file)));
            }
        }

        let visual = open_session(&dir.join(VISUAL_FILE), intra_threads)
            .map_err(|e| unavailable(format!("visual encoder: {}", e)))?;
        let text = open_session(&dir.join(TEXT_FILE), intra_threads)
            .map_err(|e| unavailable(format!("text encoder: {}", e)))?;
        let tokenizer = ClipTokenizer::from_files(&dir.join(VOCAB_FILE), &dir.join(MERGES_FILE))
            .map_err(|e| unavailable(format!("tokenizer: {}", e)))?;

        let model_id = model_identifier(dir).map_err(|e| unavailable(e.to_string()))?;
        tracing::info!(model = %model_id, path = ?dir, "CLIP model loaded (offline)");

        Ok(Self {
            model_id,
            visual: Mutex::new(visual),
            text: Mutex::new(text),
            tokenizer,
        })
    }

    fn run_visual_encoder(&self, img: &DynamicImage) -> Result<Embedding> {
        let input_tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            preprocess_image(img).into_boxed_slice(),
        ))?;

        let mut model = self
            .visual
            .lock()
            .map_err(|e| anyhow!("Failed to lock visual model: {}", e))?;
        let outputs = model.run(ort::inputs!["pixel_values" => input_tensor])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        Ok(l2_normalize(embedding_data.to_vec()))
    }

    fn run_text_encoder(&self, text: &str) -> Result<Embedding> {
        let input_ids = self.tokenizer.encode_padded(text);
        let input_tensor = Tensor::from_array(([1usize, CONTEXT_LENGTH], input_ids.into_boxed_slice()))?;

        let mut model = self
            .text
            .lock()
            .map_err(|e| anyhow!("Failed to lock text model: {}", e))?;
        let outputs = model.run(ort::inputs!["input_ids" => input_tensor])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        Ok(l2_normalize(embedding_data.to_vec()))
    }
}

impl EmbeddingProvider for ClipModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_image(&self, path: &Path) -> Result<Embedding, FilerError> {
        let img = image::open(path).map_err(|e| FilerError::embedding(path, e))?;
        self.run_visual_encoder(&img)
            .map_err(|e| FilerError::embedding(path, e))
    }

    fn embed_text(&self, text: &str) -> Result<Embedding, FilerError> {
        self.run_text_encoder(text)
            .map_err(|e| FilerError::embedding(format!("prompt:{}", text), e))
    }
}

fn open_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads.max(1))?
        .commit_from_file(path)?;
    Ok(session)
}

/// Name from config.json (or the directory name) plus content hashes of
/// both encoders, so re-exported weights never reuse stale cached vectors.
fn model_identifier(dir: &Path) -> Result<String> {
    let config_path: PathBuf = dir.join(CONFIG_FILE);
    let configured = std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|value| {
            ["model_id", "_name_or_path"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        })
        .filter(|name| !name.trim().is_empty());

    let name = match configured {
        Some(name) => name,
        None => dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Cannot derive a model name from {}", dir.display()))?,
    };

    let visual = content_hash(&dir.join(VISUAL_FILE))?;
    let text = content_hash(&dir.join(TEXT_FILE))?;

    Ok(format!("{}@{}-{}", name, short_hash(&visual), short_hash(&text)))
}

/// Resize-to-fill (center crop) to 224x224 and lay out as normalized NCHW.
fn preprocess_image(img: &DynamicImage) -> Vec<f32> {
    let resized = img.resize_to_fill(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::CatmullRom);
    let rgb = resized.to_rgb8();

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        for c in 0..3 {
            input_data[c * plane + idx] = ((pixel[c] as f32 / 255.0) - MEAN[c]) / STD[c];
        }
    }

    input_data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_is_unavailable() {
        let err = ClipModel::load(Path::new("/no/such/model"), 1).err().unwrap();
        assert!(matches!(err, FilerError::ModelUnavailable { .. }));
    }

    #[test]
    fn test_incomplete_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VISUAL_FILE), b"onnx").unwrap();

        match ClipModel::load(dir.path(), 1) {
            Err(FilerError::ModelUnavailable { reason, .. }) => {
                assert_eq!(reason, format!("missing {}", TEXT_FILE));
            }
            _ => panic!("expected ModelUnavailable"),
        }
    }

    #[test]
    fn test_model_identifier_prefers_config_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VISUAL_FILE), b"12345").unwrap();
        std::fs::write(dir.path().join(TEXT_FILE), b"123").unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"_name_or_path": "openai/clip-vit-base-patch32"}"#,
        )
        .unwrap();

        let id = model_identifier(dir.path()).unwrap();
        let visual = content_hash(&dir.path().join(VISUAL_FILE)).unwrap();
        let text = content_hash(&dir.path().join(TEXT_FILE)).unwrap();
        assert_eq!(
            id,
            format!("openai/clip-vit-base-patch32@{}-{}", &visual[..8], &text[..8])
        );
    }

    #[test]
    fn test_same_size_weights_get_distinct_ids() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        for (dir, weights) in [(&old, b"aaaaaaaaaa"), (&new, b"bbbbbbbbbb")] {
            std::fs::write(dir.path().join(VISUAL_FILE), weights).unwrap();
            std::fs::write(dir.path().join(TEXT_FILE), b"text-encoder").unwrap();
            std::fs::write(dir.path().join(CONFIG_FILE), r#"{"model_id": "clip-vit-base-patch32"}"#)
                .unwrap();
        }

        assert_ne!(
            model_identifier(old.path()).unwrap(),
            model_identifier(new.path()).unwrap()
        );
    }

    #[test]
    fn test_preprocess_layout() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            300,
            200,
            image::Rgb([255, 0, 0]),
        ));
        let data = preprocess_image(&img);
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;

        assert_eq!(data.len(), 3 * plane);
        assert!((data[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-4);
        assert!((data[plane] - (0.0 - MEAN[1]) / STD[1]).abs() < 1e-4);
    }
}
