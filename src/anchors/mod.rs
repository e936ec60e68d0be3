//! Category anchors: one reference vector per category.
//!
//! An anchor is the normalized mean of the embeddings of its text prompts and
//! exemplar images. Anchors are built once per batch and never change while
//! images are being matched.

use std::collections::HashMap;

use crate::clip::{mean_embedding, Embedding, EmbeddingProvider};
use crate::config::AnchorConfig;
use crate::error::FilerError;

/// Construction-site tags used when no categories are configured.
pub const DEFAULT_TAGS: &[&str] = &[
    // Pipes / services
    "yellow trench protection mesh",
    "orange conduit bundle",
    "blue water pipe in trench",
    "green sewer pipe in trench",
    "concrete stormwater pipe installation",
    "pit lid and riser",
    // Earthworks / trenching
    "open trench excavation",
    "backfilling trench",
    "bulk earthworks stockpile",
    "benching or batter slope",
    // Roads / pavements
    "asphalt paving",
    "road base preparation",
    "concrete footpath pour",
    // Equipment
    "excavator digging trench",
    "roller compaction",
    "grader on road subgrade",
    // Landscaping
    "turf installation",
    "irrigation installation",
    "landscape planting beds",
];

/// Turn free-form tags into prompt-only category definitions.
///
/// Blank tags are dropped and repeats collapsed, keeping first-seen order.
pub fn definitions_from_tags<S: AsRef<str>>(tags: &[S]) -> Vec<AnchorConfig> {
    let mut seen: Vec<&str> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen.into_iter().map(AnchorConfig::from_tag).collect()
}

pub fn default_definitions() -> Vec<AnchorConfig> {
    definitions_from_tags(DEFAULT_TAGS)
}

#[derive(Debug, Clone)]
pub struct Anchor {
    pub category: String,
    pub vector: Embedding,
    /// Vectors that disqualify this category when matched at least as well.
    pub exclusions: Vec<Embedding>,
}

/// Ordered, name-unique collection of anchors.
#[derive(Debug, Clone, Default)]
pub struct AnchorSet {
    anchors: Vec<Anchor>,
    index: HashMap<String, usize>,
}

impl AnchorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embed every definition. Any failure is fatal: a batch cannot be
    /// classified against a partial set of categories.
    pub fn build(
        definitions: &[AnchorConfig],
        provider: &dyn EmbeddingProvider,
    ) -> Result<Self, FilerError> {
        let mut set = AnchorSet::new();

        for def in definitions {
            let name = def.name.trim();
            if name.is_empty() {
                return Err(FilerError::Config("anchor with an empty name".to_string()));
            }
            if def.prompts.is_empty() && def.exemplars.is_empty() {
                return Err(FilerError::Config(format!(
                    "anchor '{}' needs at least one prompt or exemplar",
                    name
                )));
            }

            let mut vectors = Vec::with_capacity(def.prompts.len() + def.exemplars.len());
            for prompt in &def.prompts {
                vectors.push(provider.embed_text(prompt)?);
            }
            for exemplar in &def.exemplars {
                vectors.push(provider.embed_image(exemplar)?);
            }
            let vector = mean_embedding(&vectors).ok_or_else(|| {
                FilerError::Config(format!("anchor '{}' produced inconsistent embeddings", name))
            })?;

            let exclusions = def
                .exclude
                .iter()
                .map(|prompt| provider.embed_text(prompt))
                .collect::<Result<Vec<_>, _>>()?;

            tracing::debug!(
                category = name,
                prompts = def.prompts.len(),
                exemplars = def.exemplars.len(),
                exclusions = exclusions.len(),
                "Anchor built"
            );

            set.insert(Anchor {
                category: name.to_string(),
                vector,
                exclusions,
            });
        }

        Ok(set)
    }

    /// Add an anchor. Re-adding a category replaces its vectors but keeps
    /// its original position, so tie-breaking stays stable.
    pub fn insert(&mut self, anchor: Anchor) {
        match self.index.get(&anchor.category) {
            Some(&pos) => self.anchors[pos] = anchor,
            None => {
                self.index.insert(anchor.category.clone(), self.anchors.len());
                self.anchors.push(anchor);
            }
        }
    }

    pub fn get(&self, category: &str) -> Option<&Anchor> {
        self.index.get(category).map(|&pos| &self.anchors[pos])
    }

    /// `(category, anchor_vector, exclusions)` in insertion order.
    pub fn match_candidates(&self) -> impl Iterator<Item = (&str, &[f32], &[Embedding])> {
        self.anchors.iter().map(|a| {
            (
                a.category.as_str(),
                a.vector.as_slice(),
                a.exclusions.as_slice(),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Maps known prompts to fixed axes.
    struct PromptAxes;

    impl EmbeddingProvider for PromptAxes {
        fn model_id(&self) -> &str {
            "axes"
        }

        fn embed_image(&self, path: &Path) -> Result<Embedding, FilerError> {
            match path.file_name().and_then(|n| n.to_str()) {
                Some("tabby.jpg") => Ok(vec![1.0, 0.0, 0.0]),
                Some("kitten.jpg") => Ok(vec![0.0, 1.0, 0.0]),
                _ => Err(FilerError::embedding(path, "no such image")),
            }
        }

        fn embed_text(&self, text: &str) -> Result<Embedding, FilerError> {
            Ok(match text {
                "a photo of a cat" => vec![1.0, 0.0, 0.0],
                "a kitten" => vec![0.0, 1.0, 0.0],
                _ => vec![0.0, 0.0, 1.0],
            })
        }
    }

    fn def(name: &str, prompts: &[&str]) -> AnchorConfig {
        AnchorConfig {
            name: name.to_string(),
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            exemplars: Vec::new(),
            exclude: Vec::new(),
        }
    }

    #[test]
    fn test_build_averages_prompts() {
        let set = AnchorSet::build(&[def("cats", &["a photo of a cat", "a kitten"])], &PromptAxes)
            .unwrap();
        let cats = set.get("cats").unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((cats.vector[0] - expected).abs() < 1e-6);
        assert!((cats.vector[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_build_from_exemplar_images() {
        let mut only_images = def("cats", &[]);
        only_images.exemplars = vec!["/shots/tabby.jpg".into(), "/shots/kitten.jpg".into()];
        let mut mixed = def("kittens", &["a photo of a cat"]);
        mixed.exemplars = vec!["/shots/tabby.jpg".into(), "/shots/kitten.jpg".into()];

        let set = AnchorSet::build(&[only_images, mixed], &PromptAxes).unwrap();

        let cats = set.get("cats").unwrap();
        let half = std::f32::consts::FRAC_1_SQRT_2;
        assert!((cats.vector[0] - half).abs() < 1e-6);
        assert!((cats.vector[1] - half).abs() < 1e-6);

        // Prompts and exemplars weigh the same: mean of (1,0,0) twice and (0,1,0).
        let kittens = set.get("kittens").unwrap();
        let norm = 5.0f32.sqrt();
        assert!((kittens.vector[0] - 2.0 / norm).abs() < 1e-6);
        assert!((kittens.vector[1] - 1.0 / norm).abs() < 1e-6);
        assert!(kittens.vector[2].abs() < 1e-6);
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let mut set = AnchorSet::build(
            &[def("cats", &["a photo of a cat"]), def("dogs", &["a dog"])],
            &PromptAxes,
        )
        .unwrap();

        set.insert(Anchor {
            category: "cats".to_string(),
            vector: vec![0.0, 1.0, 0.0],
            exclusions: Vec::new(),
        });

        let order: Vec<&str> = set.match_candidates().map(|(name, _, _)| name).collect();
        assert_eq!(order, vec!["cats", "dogs"]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("cats").unwrap().vector, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_definition_is_rejected() {
        let err = AnchorSet::build(&[def("nothing", &[])], &PromptAxes).unwrap_err();
        assert!(matches!(err, FilerError::Config(_)));
    }

    #[test]
    fn test_failing_exemplar_aborts_build() {
        let mut anchor = def("cats", &["a photo of a cat"]);
        anchor.exemplars.push("/missing/cat.jpg".into());
        let err = AnchorSet::build(&[anchor], &PromptAxes).unwrap_err();
        assert!(matches!(err, FilerError::EmbeddingFailed { .. }));
    }

    #[test]
    fn test_definitions_from_tags() {
        let defs = definitions_from_tags(&["a cat", " ", "a dog", "a cat"]);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a_cat", "a_dog"]);
        assert_eq!(default_definitions().len(), DEFAULT_TAGS.len());
    }
}
