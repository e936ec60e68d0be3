use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::FilerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,

    /// Category definitions. When empty, the built-in tag list is used.
    #[serde(default)]
    pub anchors: Vec<AnchorConfig>,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub duplicates: DuplicateConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub converter: ConverterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Local directory holding visual.onnx, text.onnx, vocab.json and merges.txt.
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_model_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("photofiler/models/clip-vit-base-patch32")
}

fn default_intra_threads() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: default_model_dir(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnchorConfig {
    pub name: String,

    #[serde(default)]
    pub prompts: Vec<String>,

    /// Reference images whose embeddings are averaged into the anchor.
    #[serde(default)]
    pub exemplars: Vec<PathBuf>,

    /// Prompts that disqualify the category when they match at least as well.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl AnchorConfig {
    /// Build a prompt-only category from a free-form tag.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim();
        Self {
            name: tag.replace([' ', '/'], "_"),
            prompts: vec![tag.to_string()],
            exemplars: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    BestMatch,
    #[default]
    ThresholdMargin,
    MultiLabel,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-match" | "best" => Ok(MatchPolicy::BestMatch),
            "threshold-margin" | "margin" => Ok(MatchPolicy::ThresholdMargin),
            "multi-label" | "multi" => Ok(MatchPolicy::MultiLabel),
            other => Err(format!("unknown match policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub policy: MatchPolicy,

    #[serde(default = "default_min_score")]
    pub min_score: f32,

    #[serde(default = "default_min_margin")]
    pub min_margin: f32,
}

fn default_min_score() -> f32 {
    0.25
}

fn default_min_margin() -> f32 {
    0.05
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::default(),
            min_score: default_min_score(),
            min_margin: default_min_margin(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RepresentativeRule {
    #[default]
    LexicographicPath,
    EarliestCapture,
    HighestResolution,
    LargestFile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateAction {
    /// Duplicates are filed like any other image.
    FileAll,
    /// Non-representatives go to the duplicates bucket.
    #[default]
    Relocate,
    /// Non-representatives are left where they are.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    #[serde(default = "default_duplicates_enabled")]
    pub enabled: bool,

    /// Maximum cosine distance (1 - similarity) for two images to be duplicates.
    #[serde(default = "default_duplicate_threshold")]
    pub threshold: f32,

    #[serde(default)]
    pub representative: RepresentativeRule,

    #[serde(default)]
    pub action: DuplicateAction,

    /// Batches larger than this use hashed candidate pairs instead of all pairs.
    #[serde(default = "default_exact_limit")]
    pub exact_limit: usize,
}

fn default_duplicates_enabled() -> bool {
    true
}

fn default_duplicate_threshold() -> f32 {
    0.05
}

fn default_exact_limit() -> usize {
    2048
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            enabled: default_duplicates_enabled(),
            threshold: default_duplicate_threshold(),
            representative: RepresentativeRule::default(),
            action: DuplicateAction::default(),
            exact_limit: default_exact_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    #[default]
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FolderLayout {
    /// root/category/file
    #[default]
    Category,
    /// root/category/YYYYMMDD/file
    CategoryDate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    #[serde(alias = "source", alias = "original")]
    Auto,
    #[serde(alias = "jpeg")]
    Jpg,
    Png,
}

impl TargetFormat {
    /// Extension to force on filed images, `None` keeps the source extension.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            TargetFormat::Auto => None,
            TargetFormat::Jpg => Some("jpg"),
            TargetFormat::Png => Some("png"),
        }
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "auto" | "source" | "original" => Ok(TargetFormat::Auto),
            "jpg" | "jpeg" => Ok(TargetFormat::Jpg),
            "png" => Ok(TargetFormat::Png),
            other => Err(format!("unknown target format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileNaming {
    /// Keep the source file name.
    #[default]
    Original,
    /// `YYYYMMDD_HHMM_<tag1>_<tag2>_<tag3>` from capture time and top tags.
    Descriptive,
}

impl FromStr for FileNaming {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "original" | "keep" => Ok(FileNaming::Original),
            "descriptive" | "tags" => Ok(FileNaming::Descriptive),
            other => Err(format!("unknown naming mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_root")]
    pub root: PathBuf,

    #[serde(default = "default_unclassified_bucket")]
    pub unclassified_bucket: String,

    #[serde(default = "default_duplicates_bucket")]
    pub duplicates_bucket: String,

    #[serde(default)]
    pub operation: FileOperation,

    #[serde(default)]
    pub layout: FolderLayout,

    #[serde(default)]
    pub target_format: TargetFormat,

    #[serde(default)]
    pub naming: FileNaming,

    /// Number of tags in a descriptive name.
    #[serde(default = "default_name_tags")]
    pub name_tags: usize,

    /// Put colour heuristic tags (trench mesh, pipe colours) ahead of the
    /// CLIP tags in descriptive names.
    #[serde(default = "default_color_tags")]
    pub color_tags: bool,

    /// Plan and report without touching the destination tree.
    #[serde(default)]
    pub dry_run: bool,

    /// Write photofiler_log.csv next to the filed photos.
    #[serde(default = "default_write_log")]
    pub write_log: bool,
}

fn default_output_root() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("PhotoFiler")
}

fn default_unclassified_bucket() -> String {
    "unclassified".to_string()
}

fn default_duplicates_bucket() -> String {
    "duplicates".to_string()
}

fn default_name_tags() -> usize {
    3
}

fn default_color_tags() -> bool {
    true
}

fn default_write_log() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            unclassified_bucket: default_unclassified_bucket(),
            duplicates_bucket: default_duplicates_bucket(),
            operation: FileOperation::default(),
            layout: FolderLayout::default(),
            target_format: TargetFormat::default(),
            naming: FileNaming::default(),
            name_tags: default_name_tags(),
            color_tags: default_color_tags(),
            dry_run: false,
            write_log: default_write_log(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("photofiler/embeddings.db")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            path: default_cache_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Worker threads for embedding and filing. 0 means one per CPU.
    #[serde(default)]
    pub workers: usize,

    /// Emit an aggregate progress update every N finished images.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Per-image budget for the embedding stage, in seconds.
    #[serde(default)]
    pub time_budget_secs: Option<f64>,

    #[serde(default = "default_max_consecutive_fs_failures")]
    pub max_consecutive_fs_failures: usize,
}

fn default_progress_every() -> usize {
    1
}

fn default_max_consecutive_fs_failures() -> usize {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            progress_every: default_progress_every(),
            time_budget_secs: None,
            max_consecutive_fs_failures: default_max_consecutive_fs_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Files filed as-is into the unclassified bucket, never embedded.
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,

    #[serde(default = "default_skip_hidden")]
    pub skip_hidden: bool,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "heic".to_string(),
        "heif".to_string(),
    ]
}

fn default_media_extensions() -> Vec<String> {
    vec!["mov".to_string(), "mp4".to_string()]
}

fn default_skip_hidden() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            media_extensions: default_media_extensions(),
            skip_hidden: default_skip_hidden(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// External command used to normalize HEIC/HEIF files, e.g.
    /// `["heif-convert", "-q", "95", "{input}", "{output}"]`.
    #[serde(default)]
    pub heic_command: Option<Vec<String>>,

    /// Extensions that downstream viewers cannot open and must be converted.
    #[serde(default = "default_convert_extensions")]
    pub extensions: Vec<String>,
}

fn default_convert_extensions() -> Vec<String> {
    vec!["heic".to_string(), "heif".to_string()]
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            heic_command: None,
            extensions: default_convert_extensions(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            anchors: Vec::new(),
            matching: MatchingConfig::default(),
            duplicates: DuplicateConfig::default(),
            output: OutputConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            scanner: ScannerConfig::default(),
            converter: ConverterConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photofiler")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Check values that serde cannot constrain.
    pub fn validate(&self) -> Result<(), FilerError> {
        let m = &self.matching;
        if !(-1.0..=1.0).contains(&m.min_score) {
            return Err(FilerError::Config(format!(
                "matching.min_score must be within [-1, 1], got {}",
                m.min_score
            )));
        }
        if !(0.0..=2.0).contains(&m.min_margin) {
            return Err(FilerError::Config(format!(
                "matching.min_margin must be within [0, 2], got {}",
                m.min_margin
            )));
        }
        if !(0.0..=2.0).contains(&self.duplicates.threshold) {
            return Err(FilerError::Config(format!(
                "duplicates.threshold must be within [0, 2], got {}",
                self.duplicates.threshold
            )));
        }

        let out = &self.output;
        for (key, bucket) in [
            ("unclassified_bucket", &out.unclassified_bucket),
            ("duplicates_bucket", &out.duplicates_bucket),
        ] {
            if !is_plain_folder_name(bucket) {
                return Err(FilerError::Config(format!(
                    "output.{} must be a single folder name, got '{}'",
                    key, bucket
                )));
            }
        }
        if out.unclassified_bucket == out.duplicates_bucket {
            return Err(FilerError::Config(
                "output.unclassified_bucket and output.duplicates_bucket must differ".to_string(),
            ));
        }

        if out.name_tags == 0 {
            return Err(FilerError::Config(
                "output.name_tags must be at least 1".to_string(),
            ));
        }

        for anchor in &self.anchors {
            if !is_plain_folder_name(&anchor.name) {
                return Err(FilerError::Config(format!(
                    "anchor name '{}' is not usable as a folder name",
                    anchor.name
                )));
            }
            if anchor.name == out.unclassified_bucket || anchor.name == out.duplicates_bucket {
                return Err(FilerError::Config(format!(
                    "anchor name '{}' clashes with an output bucket",
                    anchor.name
                )));
            }
        }

        if let Some(budget) = self.batch.time_budget_secs {
            if !(budget > 0.0) {
                return Err(FilerError::Config(format!(
                    "batch.time_budget_secs must be positive, got {}",
                    budget
                )));
            }
        }

        if let Some(cmd) = &self.converter.heic_command {
            if cmd.is_empty() {
                return Err(FilerError::Config(
                    "converter.heic_command must name a program".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_plain_folder_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.policy, MatchPolicy::ThresholdMargin);
        assert_eq!(config.output.unclassified_bucket, "unclassified");
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [matching]
            policy = "multi-label"
            min_score = 0.3

            [output]
            root = "/tmp/sorted"
            target_format = "jpeg"
            layout = "category-date"

            [[anchors]]
            name = "cats"
            prompts = ["a photo of a cat"]

            [[anchors]]
            name = "dogs"
            prompts = ["a photo of a dog"]
            exclude = ["a cartoon dog"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.matching.policy, MatchPolicy::MultiLabel);
        assert!((config.matching.min_margin - 0.05).abs() < f32::EPSILON);
        assert_eq!(config.output.target_format, TargetFormat::Jpg);
        assert_eq!(config.output.layout, FolderLayout::CategoryDate);
        assert_eq!(config.anchors.len(), 2);
        assert_eq!(config.anchors[1].exclude, vec!["a cartoon dog".to_string()]);
        assert!(config.duplicates.enabled);
    }

    #[test]
    fn test_target_format_aliases() {
        assert_eq!("original".parse::<TargetFormat>().unwrap(), TargetFormat::Auto);
        assert_eq!("JPEG".parse::<TargetFormat>().unwrap(), TargetFormat::Jpg);
        assert_eq!(TargetFormat::Png.extension(), Some("png"));
        assert!("tiff".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn test_anchor_from_tag() {
        let anchor = AnchorConfig::from_tag("  blue water pipe in trench ");
        assert_eq!(anchor.name, "blue_water_pipe_in_trench");
        assert_eq!(anchor.prompts, vec!["blue water pipe in trench".to_string()]);
    }

    #[test]
    fn test_validate_rejects_bad_buckets() {
        let mut config = Config::default();
        config.output.duplicates_bucket = "unclassified".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output.unclassified_bucket = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_anchor_named_like_a_bucket() {
        for name in ["unclassified", "duplicates"] {
            let mut config = Config::default();
            config.anchors = vec![AnchorConfig::from_tag("cats"), AnchorConfig::from_tag(name)];
            match config.validate() {
                Err(FilerError::Config(msg)) => assert!(msg.contains(name)),
                other => panic!("expected a config error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_naming_modes() {
        assert_eq!(Config::default().output.naming, FileNaming::Original);
        assert_eq!("Descriptive".parse::<FileNaming>().unwrap(), FileNaming::Descriptive);
        assert!("random".parse::<FileNaming>().is_err());

        let config: Config = toml::from_str("[output]\nnaming = \"descriptive\"\nname_tags = 2\n").unwrap();
        assert_eq!(config.output.naming, FileNaming::Descriptive);
        assert_eq!(config.output.name_tags, 2);
        assert!(config.output.color_tags);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.matching.min_score = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch.time_budget_secs = Some(0.0);
        assert!(config.validate().is_err());
    }
}
