use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured creator identity. Owned by the persona store; the
/// workflow engine only ever holds read-only copies keyed by id.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub location: String,
    pub country: String,
    #[serde(default)]
    pub niche: Vec<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: String,
    /// Remote image URLs, at most three.
    #[serde(default)]
    pub ref_images: Vec<String>,
}

pub const MAX_REF_IMAGES: usize = 3;

/// Forward-only pipeline position. Only an explicit reset goes back.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkflowStep {
    #[default]
    Dashboard,
    Selection,
    Ideation,
    Refinement,
    /// Transient marker while the image fan-out is in flight.
    Generation,
    Editing,
    Captions,
    Complete,
}

/// Idea-generation strategy. Fixed once chosen within a run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdeationMode {
    Manual,
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeneratedIdea {
    pub id: String,
    pub persona_id: String,
    pub title: String,
    pub description: String,
}

/// Inline binary attached during refinement. Run-scoped; never written
/// to the persona store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReferenceImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RefinementRequirement {
    pub id: String,
    pub question: String,
    /// Capability-proposed default answer.
    pub suggestion: String,
    /// Empty string means "use the suggestion".
    #[serde(default)]
    pub user_response: String,
    #[serde(default)]
    pub reference_image: Option<ReferenceImage>,
}

impl RefinementRequirement {
    /// The answer that flows into the image prompt.
    pub fn effective_answer(&self) -> &str {
        if self.user_response.trim().is_empty() {
            &self.suggestion
        } else {
            &self.user_response
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeneratedImage {
    pub id: String,
    pub idea_id: String,
    /// Data URL or remote URL.
    pub image_url: String,
    /// Exact text that produced the current content, kept for audit
    /// and edit continuity.
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CaptionData {
    pub caption: String,
    pub hashtags: Vec<String>,
}

/// The single mutable aggregate for one campaign run. Created fresh at
/// session start, discarded on completion or reset; never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct WorkflowState {
    pub step: WorkflowStep,
    /// Order-preserving, no duplicates.
    pub selected_persona_ids: Vec<String>,
    pub mode: Option<IdeationMode>,
    pub manual_activity_input: String,
    pub generated_ideas: HashMap<String, Vec<GeneratedIdea>>,
    pub selected_idea_ids: HashMap<String, String>,
    pub refinement_data: HashMap<String, Vec<RefinementRequirement>>,
    pub generated_images: HashMap<String, Vec<GeneratedImage>>,
    pub captions: HashMap<String, CaptionData>,
}

impl WorkflowState {
    pub fn selected_idea(&self, persona_id: &str) -> Option<&GeneratedIdea> {
        let idea_id = self.selected_idea_ids.get(persona_id)?;
        self.generated_ideas
            .get(persona_id)?
            .iter()
            .find(|idea| &idea.id == idea_id)
    }

    pub fn find_image_mut(&mut self, idea_id: &str, image_id: &str) -> Option<&mut GeneratedImage> {
        self.generated_images
            .get_mut(idea_id)?
            .iter_mut()
            .find(|img| img.id == image_id)
    }

    pub fn find_requirement_mut(
        &mut self,
        idea_id: &str,
        requirement_id: &str,
    ) -> Option<&mut RefinementRequirement> {
        self.refinement_data
            .get_mut(idea_id)?
            .iter_mut()
            .find(|req| req.id == requirement_id)
    }

    /// Drops everything scoped to the current run. The persona store is
    /// never touched by a reset.
    pub fn clear_run_data(&mut self) {
        self.selected_persona_ids.clear();
        self.mode = None;
        self.manual_activity_input.clear();
        self.generated_ideas.clear();
        self.selected_idea_ids.clear();
        self.refinement_data.clear();
        self.generated_images.clear();
        self.captions.clear();
    }
}
