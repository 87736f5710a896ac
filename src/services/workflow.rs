//! The workflow engine: enforces stage ordering over one
//! `WorkflowState` and drives the per-persona fan-out of capability
//! calls at every transition.
//!
//! Failure policy differs by stage on purpose: ideation, refinement
//! and captions are all-or-nothing (one failed call aborts the batch
//! and nothing is committed), while image generation catches and
//! skips individual failures and always advances. Exclusive `&mut
//! self` on every stage operation is what guarantees the single
//! in-flight operation the state model relies on.

use crate::core::config::Config;
use crate::core::ids::{self, IdFactory};
use crate::core::state::{
    GeneratedIdea, GeneratedImage, IdeationMode, Persona, ReferenceImage, RefinementRequirement,
    WorkflowState, WorkflowStep,
};
use crate::services::genai::{GenAiClient, ImageConfig, InvokeOptions, Part};
use crate::services::parse;
use crate::services::prompt::{self, ImageFetcher};
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::collections::HashMap;

pub struct WorkflowEngine {
    genai: Box<dyn GenAiClient>,
    fetcher: Box<dyn ImageFetcher>,
    /// Read-only persona snapshots, keyed by id. Owned by the persona
    /// store; a run never writes back.
    personas: HashMap<String, Persona>,
    ids: IdFactory,
    max_concurrency: usize,
    image_count: usize,
    image_quality: String,
    state: WorkflowState,
}

impl WorkflowEngine {
    pub fn new(
        config: &Config,
        genai: Box<dyn GenAiClient>,
        fetcher: Box<dyn ImageFetcher>,
        personas: Vec<Persona>,
    ) -> Self {
        Self {
            genai,
            fetcher,
            personas: personas.into_iter().map(|p| (p.id.clone(), p)).collect(),
            ids: IdFactory::new(),
            max_concurrency: config.generation.max_concurrency.max(1),
            image_count: config.generation.image_count.max(1),
            image_quality: config.generation.image_quality.clone(),
            state: WorkflowState::default(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.personas.get(id)
    }

    fn ensure_step(&self, expected: WorkflowStep, action: &str) -> Result<()> {
        if self.state.step != expected {
            bail!(
                "Cannot {} at step {:?} (expected {:?})",
                action,
                self.state.step,
                expected
            );
        }
        Ok(())
    }

    /// Dashboard -> Selection. Starts a fresh run.
    pub fn begin_run(&mut self) -> Result<()> {
        self.ensure_step(WorkflowStep::Dashboard, "begin a run")?;
        self.state.clear_run_data();
        self.state.step = WorkflowStep::Selection;
        Ok(())
    }

    /// Replaces the selection, preserving order and dropping
    /// duplicates. Every id must be a known persona.
    pub fn select_personas(&mut self, ids: &[String]) -> Result<()> {
        self.ensure_step(WorkflowStep::Selection, "select personas")?;
        let mut selected: Vec<String> = Vec::new();
        for id in ids {
            if !self.personas.contains_key(id) {
                bail!("Unknown persona: {}", id);
            }
            if !selected.contains(id) {
                selected.push(id.clone());
            }
        }
        self.state.selected_persona_ids = selected;
        Ok(())
    }

    pub fn set_manual_activity(&mut self, text: &str) {
        self.state.manual_activity_input = text.to_string();
    }

    /// Selection -> Ideation (also allowed from Ideation to
    /// regenerate, with the same mode). One call per selected
    /// persona; all-or-nothing.
    pub async fn generate_ideas(&mut self, mode: IdeationMode) -> Result<()> {
        if self.state.step != WorkflowStep::Selection && self.state.step != WorkflowStep::Ideation {
            bail!(
                "Cannot generate ideas at step {:?} (expected Selection or Ideation)",
                self.state.step
            );
        }
        if self.state.selected_persona_ids.is_empty() {
            bail!("Select at least one persona before generating ideas");
        }
        if let Some(fixed) = self.state.mode {
            if fixed != mode {
                bail!("Ideation mode is fixed for this run");
            }
        }
        if mode == IdeationMode::Manual && self.state.manual_activity_input.trim().is_empty() {
            bail!("Manual mode needs a non-empty activity description");
        }

        let batches = self.run_ideation(mode).await?;

        self.state.mode = Some(mode);
        self.state.selected_idea_ids.clear();
        for (persona_id, ideas) in batches {
            self.state.generated_ideas.insert(persona_id, ideas);
        }
        self.state.step = WorkflowStep::Ideation;
        Ok(())
    }

    async fn run_ideation(&self, mode: IdeationMode) -> Result<Vec<(String, Vec<GeneratedIdea>)>> {
        let genai = self.genai.as_ref();
        let personas = &self.personas;
        let ids = &self.ids;
        let activity = self.state.manual_activity_input.clone();

        let results: Vec<Result<(usize, String, Vec<GeneratedIdea>)>> =
            futures_util::stream::iter(self.state.selected_persona_ids.iter().enumerate())
                .map(|(i, persona_id)| {
                    let activity = activity.clone();
                    async move {
                        let persona = personas
                            .get(persona_id)
                            .with_context(|| format!("Unknown persona: {}", persona_id))?;

                        let (text, options, schema_declared) = match mode {
                            IdeationMode::Manual => (
                                prompt::ideation_prompt_manual(persona, &activity),
                                InvokeOptions::with_schema(prompt::ideas_schema())
                                    .system(prompt::IDEATION_SYSTEM),
                                true,
                            ),
                            IdeationMode::Auto => (
                                prompt::ideation_prompt_auto(persona),
                                InvokeOptions::with_search().system(prompt::IDEATION_SYSTEM),
                                false,
                            ),
                        };

                        let response = genai
                            .invoke(&[Part::Text(text)], &options)
                            .await
                            .with_context(|| {
                                format!("Idea generation failed for persona {}", persona_id)
                            })?;

                        let timestamp = ids.next_timestamp();
                        let ideas = parse::parse_ideas(
                            response.text.as_deref().unwrap_or(""),
                            persona_id,
                            schema_declared,
                            timestamp,
                        );
                        Ok((i, persona_id.clone(), ideas))
                    }
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        let mut batches: Vec<(usize, String, Vec<GeneratedIdea>)> = results
            .into_iter()
            .collect::<Result<_>>()
            .context("Idea generation aborted; nothing was committed")?;
        batches.sort_by_key(|(i, _, _)| *i);
        Ok(batches.into_iter().map(|(_, pid, list)| (pid, list)).collect())
    }

    /// Pure state update; the idea must belong to the persona.
    /// Calling it again with the same arguments is a no-op.
    pub fn select_idea(&mut self, persona_id: &str, idea_id: &str) -> Result<()> {
        self.ensure_step(WorkflowStep::Ideation, "select an idea")?;
        let known = self
            .state
            .generated_ideas
            .get(persona_id)
            .map(|list| list.iter().any(|idea| idea.id == idea_id))
            .unwrap_or(false);
        if !known {
            bail!("Idea {} does not belong to persona {}", idea_id, persona_id);
        }
        self.state
            .selected_idea_ids
            .insert(persona_id.to_string(), idea_id.to_string());
        Ok(())
    }

    /// Ideation -> Refinement. Requires a selected idea for every
    /// selected persona; all-or-nothing fan-out keyed by idea id.
    pub async fn analyze_requirements(&mut self) -> Result<()> {
        self.ensure_step(WorkflowStep::Ideation, "analyze requirements")?;
        for persona_id in &self.state.selected_persona_ids {
            if !self.state.selected_idea_ids.contains_key(persona_id) {
                bail!("Persona {} has no selected idea yet", persona_id);
            }
        }

        let batches = self.run_refinement().await?;

        for (idea_id, requirements) in batches {
            self.state.refinement_data.insert(idea_id, requirements);
        }
        self.state.step = WorkflowStep::Refinement;
        Ok(())
    }

    async fn run_refinement(&self) -> Result<Vec<(String, Vec<RefinementRequirement>)>> {
        let genai = self.genai.as_ref();

        let jobs = self.selected_jobs()?;
        let results: Vec<Result<(usize, String, Vec<RefinementRequirement>)>> =
            futures_util::stream::iter(jobs)
                .map(|(i, persona, idea)| async move {
                    let options = InvokeOptions::with_schema(prompt::requirements_schema())
                        .system(prompt::REFINEMENT_SYSTEM);
                    let text = prompt::refinement_prompt(persona, idea);

                    let response = genai
                        .invoke(&[Part::Text(text)], &options)
                        .await
                        .with_context(|| {
                            format!("Requirement analysis failed for idea {}", idea.id)
                        })?;

                    let requirements = parse::parse_requirements(
                        response.text.as_deref().unwrap_or(""),
                        &idea.id,
                    );
                    Ok((i, idea.id.clone(), requirements))
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        let mut batches: Vec<(usize, String, Vec<RefinementRequirement>)> = results
            .into_iter()
            .collect::<Result<_>>()
            .context("Requirement analysis aborted; nothing was committed")?;
        batches.sort_by_key(|(i, _, _)| *i);
        Ok(batches
            .into_iter()
            .map(|(_, idea_id, list)| (idea_id, list))
            .collect())
    }

    /// The (persona, selected idea) pairs in selection order.
    fn selected_jobs(&self) -> Result<Vec<(usize, &Persona, &GeneratedIdea)>> {
        self.state
            .selected_persona_ids
            .iter()
            .enumerate()
            .map(|(i, persona_id)| {
                let persona = self
                    .personas
                    .get(persona_id)
                    .with_context(|| format!("Unknown persona: {}", persona_id))?;
                let idea = self
                    .state
                    .selected_idea(persona_id)
                    .with_context(|| format!("No selected idea for persona {}", persona_id))?;
                Ok((i, persona, idea))
            })
            .collect()
    }

    pub fn set_requirement_response(
        &mut self,
        idea_id: &str,
        requirement_id: &str,
        text: &str,
    ) -> Result<()> {
        self.ensure_step(WorkflowStep::Refinement, "answer a requirement")?;
        let requirement = self
            .state
            .find_requirement_mut(idea_id, requirement_id)
            .with_context(|| format!("Unknown requirement {} for idea {}", requirement_id, idea_id))?;
        requirement.user_response = text.to_string();
        Ok(())
    }

    pub fn attach_reference_image(
        &mut self,
        idea_id: &str,
        requirement_id: &str,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<()> {
        self.ensure_step(WorkflowStep::Refinement, "attach a reference image")?;
        let requirement = self
            .state
            .find_requirement_mut(idea_id, requirement_id)
            .with_context(|| format!("Unknown requirement {} for idea {}", requirement_id, idea_id))?;
        requirement.reference_image = Some(ReferenceImage {
            data,
            mime_type: mime_type.to_string(),
        });
        Ok(())
    }

    pub async fn generate_images_with_defaults(&mut self) -> Result<()> {
        let count = self.image_count;
        let quality = self.image_quality.clone();
        self.generate_images(count, &quality).await
    }

    /// Refinement -> Generation (transient) -> Editing. Best-effort:
    /// a failed image call is logged and skipped, and the stage
    /// advances even when some ideas end up with no images at all.
    pub async fn generate_images(&mut self, count: usize, quality: &str) -> Result<()> {
        self.ensure_step(WorkflowStep::Refinement, "generate images")?;
        if count == 0 {
            bail!("Image count must be at least 1");
        }

        self.state.step = WorkflowStep::Generation;
        let batches = self.run_image_fanout(count, quality).await;

        for (idea_id, images) in batches {
            self.state.generated_images.insert(idea_id, images);
        }
        self.state.step = WorkflowStep::Editing;
        Ok(())
    }

    async fn run_image_fanout(
        &self,
        count: usize,
        quality: &str,
    ) -> Vec<(String, Vec<GeneratedImage>)> {
        let genai = self.genai.as_ref();
        let fetcher = self.fetcher.as_ref();
        let ids = &self.ids;

        let jobs: Vec<(usize, &Persona, &GeneratedIdea, &[RefinementRequirement])> = self
            .state
            .selected_persona_ids
            .iter()
            .enumerate()
            .filter_map(|(i, persona_id)| {
                let persona = self.personas.get(persona_id)?;
                let idea = self.state.selected_idea(persona_id)?;
                let requirements = self
                    .state
                    .refinement_data
                    .get(&idea.id)
                    .map(|list| list.as_slice())
                    .unwrap_or(&[]);
                Some((i, persona, idea, requirements))
            })
            .collect();

        let mut batches: Vec<(usize, String, Vec<GeneratedImage>)> =
            futures_util::stream::iter(jobs)
                .map(|(i, persona, idea, requirements)| {
                    let quality = quality.to_string();
                    async move {
                        let parts =
                            prompt::image_request(fetcher, persona, idea, requirements).await;
                        let prompt_text = match parts.first() {
                            Some(Part::Text(text)) => text.clone(),
                            _ => String::new(),
                        };

                        let timestamp = ids.next_timestamp();
                        let mut images = Vec::new();
                        for n in 0..count {
                            let options = InvokeOptions::for_images(ImageConfig {
                                quality: quality.clone(),
                            });
                            match genai.invoke(&parts, &options).await {
                                Ok(response) => {
                                    if let Some((bytes, mime)) =
                                        response.inline_images.into_iter().next()
                                    {
                                        images.push(GeneratedImage {
                                            id: ids::image_id(&idea.id, timestamp, n),
                                            idea_id: idea.id.clone(),
                                            image_url: prompt::to_data_url(&bytes, &mime),
                                            prompt: prompt_text.clone(),
                                        });
                                    } else {
                                        log::warn!(
                                            "Image call {} for idea {} returned no image part, skipping",
                                            n,
                                            idea.id
                                        );
                                    }
                                }
                                Err(e) => {
                                    log::warn!(
                                        "Image call {} for idea {} failed, skipping: {:#}",
                                        n,
                                        idea.id,
                                        e
                                    );
                                }
                            }
                        }
                        (i, idea.id.clone(), images)
                    }
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        batches.sort_by_key(|(i, _, _)| *i);
        batches
            .into_iter()
            .map(|(_, idea_id, images)| (idea_id, images))
            .collect()
    }

    /// Replaces one image's content in place. Id and idea id survive;
    /// the instruction becomes the image's new audit prompt. Fails
    /// visibly when the capability returns no image part.
    pub async fn edit_image(
        &mut self,
        idea_id: &str,
        image_id: &str,
        instruction: &str,
    ) -> Result<()> {
        self.ensure_step(WorkflowStep::Editing, "edit an image")?;
        if instruction.trim().is_empty() {
            bail!("Edit instruction must not be empty");
        }
        let current = self
            .state
            .generated_images
            .get(idea_id)
            .and_then(|list| list.iter().find(|img| img.id == image_id))
            .cloned()
            .with_context(|| format!("Unknown image {} for idea {}", image_id, idea_id))?;

        let parts = prompt::edit_request(self.fetcher.as_ref(), &current, instruction).await;
        let options = InvokeOptions::for_images(ImageConfig {
            quality: self.image_quality.clone(),
        });
        let response = self
            .genai
            .invoke(&parts, &options)
            .await
            .with_context(|| format!("Image edit failed for {}", image_id))?;

        let (bytes, mime) = response
            .inline_images
            .into_iter()
            .next()
            .context("Image edit returned no image content")?;

        let image = self
            .state
            .find_image_mut(idea_id, image_id)
            .with_context(|| format!("Unknown image {} for idea {}", image_id, idea_id))?;
        image.image_url = prompt::to_data_url(&bytes, &mime);
        image.prompt = instruction.to_string();
        Ok(())
    }

    /// Editing -> Captions. One caption per selected idea;
    /// all-or-nothing.
    pub async fn generate_captions(&mut self) -> Result<()> {
        self.ensure_step(WorkflowStep::Editing, "generate captions")?;

        let batches = {
            let genai = self.genai.as_ref();
            let jobs = self.selected_jobs()?;
            let results: Vec<Result<(usize, String, crate::core::state::CaptionData)>> =
                futures_util::stream::iter(jobs)
                    .map(|(i, persona, idea)| async move {
                        let options = InvokeOptions::with_schema(prompt::caption_schema())
                            .system(prompt::CAPTION_SYSTEM);
                        let text = prompt::caption_prompt(persona, idea);

                        let response = genai
                            .invoke(&[Part::Text(text)], &options)
                            .await
                            .with_context(|| {
                                format!("Caption generation failed for idea {}", idea.id)
                            })?;

                        let caption =
                            parse::parse_caption(response.text.as_deref().unwrap_or(""));
                        Ok((i, idea.id.clone(), caption))
                    })
                    .buffer_unordered(self.max_concurrency)
                    .collect()
                    .await;

            let mut batches: Vec<(usize, String, crate::core::state::CaptionData)> = results
                .into_iter()
                .collect::<Result<_>>()
                .context("Caption generation aborted; nothing was committed")?;
            batches.sort_by_key(|(i, _, _)| *i);
            batches
        };

        for (_, idea_id, caption) in batches {
            self.state.captions.insert(idea_id, caption);
        }
        self.state.step = WorkflowStep::Captions;
        Ok(())
    }

    /// Captions -> Complete. Every selected idea needs a caption.
    pub fn complete_run(&mut self) -> Result<()> {
        self.ensure_step(WorkflowStep::Captions, "complete the run")?;
        for persona_id in &self.state.selected_persona_ids {
            let idea = self
                .state
                .selected_idea(persona_id)
                .with_context(|| format!("No selected idea for persona {}", persona_id))?;
            if !self.state.captions.contains_key(&idea.id) {
                bail!("Idea {} has no caption yet", idea.id);
            }
        }
        self.state.step = WorkflowStep::Complete;
        Ok(())
    }

    /// Explicit backward transition. Discards everything run-scoped;
    /// never touches the persona store.
    pub fn reset(&mut self) {
        self.state.clear_run_data();
        self.state.step = WorkflowStep::Dashboard;
    }
}
