//! Public grading entry points.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capture::{CapturedImage, Orientation};
use crate::config::GradeConfig;
use crate::error::{GradeError, TemplateError};
use crate::pipeline::{self, BatchResult, CancelToken, RunContext, SheetRecord};
use crate::scoring::AnswerKey;
use crate::template::{Template, TemplateSpec};

/// Grader bound to one template, configuration and optional answer key.
///
/// All inputs are validated at construction; grading itself only fails
/// per sheet.
///
/// # Example
///
/// ```no_run
/// use markgrid::{AnswerKey, CapturedImage, GradeConfig, Grader, Template};
/// use std::path::Path;
///
/// let template = Template::from_json_file(Path::new("template.json")).unwrap();
/// let key = AnswerKey::from_json_file(Path::new("answer_key.json")).unwrap();
/// let grader = Grader::new(template, GradeConfig::default())
///     .unwrap()
///     .with_answer_key(key)
///     .unwrap();
/// let sheet = CapturedImage::open(Path::new("sheet-001.png")).unwrap();
/// let record = grader.grade_sheet(&sheet);
/// println!("{}", serde_json::to_string_pretty(&record).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct Grader {
    template: Arc<Template>,
    config: GradeConfig,
    key: Option<AnswerKey>,
}

impl Grader {
    pub fn new(
        template: impl Into<Arc<Template>>,
        config: GradeConfig,
    ) -> Result<Self, GradeError> {
        let template = template.into();
        config.validate_for(&template)?;
        Ok(Self {
            template,
            config,
            key: None,
        })
    }

    /// Attach an answer key after checking it against the template.
    pub fn with_answer_key(mut self, key: AnswerKey) -> Result<Self, GradeError> {
        key.validate_against(&self.template)?;
        self.key = Some(key);
        Ok(self)
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn config(&self) -> &GradeConfig {
        &self.config
    }

    pub fn answer_key(&self) -> Option<&AnswerKey> {
        self.key.as_ref()
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            template: &self.template,
            config: &self.config,
            key: self.key.as_ref(),
        }
    }

    /// Grade one sheet on the calling thread.
    pub fn grade_sheet(&self, image: &CapturedImage) -> SheetRecord {
        pipeline::grade_sheet(self.context(), image)
    }

    /// Grade a batch on a bounded worker pool; records keep submission order.
    pub fn grade_batch(&self, images: &[CapturedImage]) -> Result<BatchResult, GradeError> {
        pipeline::grade_batch(self.context(), images, None)
    }

    /// Like [`Grader::grade_batch`]; sheets not started before `cancel` fires
    /// are reported as cancelled.
    pub fn grade_batch_with_cancel(
        &self,
        images: &[CapturedImage],
        cancel: &CancelToken,
    ) -> Result<BatchResult, GradeError> {
        pipeline::grade_batch(self.context(), images, Some(cancel))
    }

    /// Grade image files. Each file is decoded by the worker that grades
    /// it, so memory stays bounded by the concurrency limit; files that fail
    /// to decode become failed records at the `loading` stage.
    pub fn grade_paths(
        &self,
        paths: &[PathBuf],
        orientation: Orientation,
    ) -> Result<BatchResult, GradeError> {
        pipeline::grade_paths(self.context(), paths, orientation, None)
    }
}

/// Templates addressable by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file of `dir` as a template.
    pub fn from_dir(dir: &Path) -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        for path in sorted_entries(dir, |p| has_extension(p, &["json"]))
            .map_err(|e| TemplateError::Io(format!("{}: {}", dir.display(), e)))?
        {
            let template = Template::from_json_file(&path)?;
            tracing::debug!(name = template.name(), path = %path.display(), "registered template");
            registry.insert(template)?;
        }
        Ok(registry)
    }

    /// Register a template under its name. Names must be unique.
    pub fn insert(
        &mut self,
        template: impl Into<Arc<Template>>,
    ) -> Result<Arc<Template>, TemplateError> {
        let template = template.into();
        let name = template.name().to_string();
        if self.templates.contains_key(&name) {
            return Err(TemplateError::Invalid(format!(
                "template '{name}' is registered twice"
            )));
        }
        self.templates.insert(name, Arc::clone(&template));
        Ok(template)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Template given by registry name or inline definition.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateRef {
    Id(String),
    Inline(TemplateSpec),
}

/// One grading run: template, images, optional key and configuration.
#[derive(Debug, Clone)]
pub struct GradeRequest {
    pub template: TemplateRef,
    pub images: Vec<CapturedImage>,
    pub answer_key: Option<AnswerKey>,
    pub config: GradeConfig,
}

/// Core entry point: resolve and validate every input, then grade the batch.
///
/// Only template, configuration and key problems fail the whole call.
pub fn grade(
    request: GradeRequest,
    registry: &TemplateRegistry,
    cancel: Option<&CancelToken>,
) -> Result<BatchResult, GradeError> {
    let template: Arc<Template> = match request.template {
        TemplateRef::Id(id) => registry.get(&id).ok_or(GradeError::UnknownTemplate(id))?,
        TemplateRef::Inline(spec) => Arc::new(Template::from_spec(spec)?),
    };
    let mut grader = Grader::new(template, request.config)?;
    if let Some(key) = request.answer_key {
        grader = grader.with_answer_key(key)?;
    }
    match cancel {
        Some(token) => grader.grade_batch_with_cancel(&request.images, token),
        None => grader.grade_batch(&request.images),
    }
}

/// Image extensions picked up from a work directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];

/// A grading work directory: `template.json`, optional `config.json` and
/// `answer_key.json`, and sheet images sorted by file name.
#[derive(Debug, Clone)]
pub struct WorkDir {
    pub template: Template,
    pub config: GradeConfig,
    pub answer_key: Option<AnswerKey>,
    pub images: Vec<PathBuf>,
}

impl WorkDir {
    pub fn load(dir: &Path) -> Result<Self, GradeError> {
        let template = Template::from_json_file(&dir.join("template.json"))?;
        let config_path = dir.join("config.json");
        let config = if config_path.is_file() {
            GradeConfig::from_json_file(&config_path)?
        } else {
            GradeConfig::default()
        };
        let key_path = dir.join("answer_key.json");
        let answer_key = if key_path.is_file() {
            Some(AnswerKey::from_json_file(&key_path)?)
        } else {
            None
        };
        let images = sorted_entries(dir, |p| has_extension(p, IMAGE_EXTENSIONS))
            .map_err(|e| GradeError::Io(format!("{}: {}", dir.display(), e)))?;
        tracing::info!(
            dir = %dir.display(),
            template = template.name(),
            images = images.len(),
            keyed = answer_key.is_some(),
            "loaded work directory"
        );
        Ok(Self {
            template,
            config,
            answer_key,
            images,
        })
    }

    /// A grader for this directory's template, configuration and key.
    pub fn grader(&self) -> Result<Grader, GradeError> {
        let grader = Grader::new(self.template.clone(), self.config.clone())?;
        match &self.answer_key {
            Some(key) => grader.with_answer_key(key.clone()),
            None => Ok(grader),
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && keep(&path) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, KeyError};
    use crate::template::tests::{quiz5, QUIZ5_JSON};

    #[test]
    fn grader_rejects_quorum_above_fiducials() {
        let config = GradeConfig {
            fiducial_quorum: 5,
            ..GradeConfig::default()
        };
        let err = Grader::new(quiz5(), config).expect_err("quorum 5 of 4");
        assert_eq!(
            err,
            GradeError::Config(ConfigError::QuorumExceedsFiducials {
                quorum: 5,
                declared: 4
            })
        );
    }

    #[test]
    fn grader_rejects_key_for_unknown_question() {
        let key = AnswerKey::new().with("q42", "A").expect("valid entry");
        let err = Grader::new(quiz5(), GradeConfig::default())
            .and_then(|g| g.with_answer_key(key))
            .expect_err("unknown question");
        assert_eq!(err, GradeError::Key(KeyError::UnknownQuestion("q42".into())));
    }

    #[test]
    fn registry_resolves_ids() {
        let mut registry = TemplateRegistry::new();
        registry.insert(quiz5()).expect("first insert");
        assert!(registry.insert(quiz5()).is_err());
        assert_eq!(registry.ids(), ["quiz5"]);

        let request = GradeRequest {
            template: TemplateRef::Id("nope".into()),
            images: Vec::new(),
            answer_key: None,
            config: GradeConfig::default(),
        };
        let err = grade(request, &registry, None).expect_err("unknown id");
        assert_eq!(err, GradeError::UnknownTemplate("nope".into()));
    }

    #[test]
    fn inline_template_errors_abort_the_run() {
        let mut spec = TemplateSpec::from_json_str(QUIZ5_JSON).expect("json");
        spec.page_size = [100.0, 100.0];
        let request = GradeRequest {
            template: TemplateRef::Inline(spec),
            images: Vec::new(),
            answer_key: None,
            config: GradeConfig::default(),
        };
        let err = grade(request, &TemplateRegistry::new(), None).expect_err("out of bounds");
        assert!(matches!(err, GradeError::Template(TemplateError::OutOfBounds { .. })));
    }

    #[test]
    fn empty_batch_has_empty_stats() {
        let request = GradeRequest {
            template: TemplateRef::Inline(TemplateSpec::from_json_str(QUIZ5_JSON).expect("json")),
            images: Vec::new(),
            answer_key: None,
            config: GradeConfig::default(),
        };
        let batch = grade(request, &TemplateRegistry::new(), None).expect("valid run");
        assert_eq!(batch.template, "quiz5");
        assert!(batch.sheets.is_empty());
        assert_eq!(batch.stats.n_sheets, 0);
    }

    #[test]
    fn work_dir_decodes_images_on_workers_and_reports_bad_files() {
        use crate::pipeline::SheetStage;
        use crate::synth::{render_sheet, RenderParams, SheetMarks};

        let dir = std::env::temp_dir().join(format!("markgrid-workdir-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        std::fs::write(dir.join("template.json"), QUIZ5_JSON).expect("template");
        let t = quiz5();
        let marks = SheetMarks::answers([("q1", "A"), ("q2", "B")]);
        render_sheet(&t, &marks, &RenderParams::fitted(&t, (600, 800)))
            .save(dir.join("a-good.png"))
            .expect("png");
        std::fs::write(dir.join("b-bad.png"), b"not an image").expect("garbage");

        let work = WorkDir::load(&dir).expect("work dir");
        let batch = work
            .grader()
            .and_then(|g| g.grade_paths(&work.images, Orientation::Upright))
            .expect("batch runs");
        std::fs::remove_dir_all(&dir).ok();

        let ids: Vec<&str> = batch.sheets.iter().map(|r| r.sheet_id.as_str()).collect();
        assert_eq!(ids, ["a-good", "b-bad"]);
        let good = batch.sheets[0].result().expect("good sheet graded");
        assert_eq!(good.responses["q1"], "A");
        assert_eq!(good.responses["q2"], "B");
        let bad = batch.sheets[1].failure().expect("bad sheet failed");
        assert_eq!(bad.stage, SheetStage::Loading);
        assert_eq!(batch.stats.n_graded, 1);
        assert_eq!(batch.stats.n_failed, 1);
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(has_extension(Path::new("a/SHEET.PNG"), IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("a/template.json"), IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("a/noext"), IMAGE_EXTENSIONS));
    }
}
