//! markgrid CLI — grade answer-sheet images against a template.

use clap::{Args, Parser, Subcommand, ValueEnum};
use markgrid::synth::{render_sheet, RenderParams, SheetMarks};
use markgrid::{
    AnswerKey, BatchResult, GradeConfig, Orientation, SheetOutcome, Template, TransformModel,
    WorkDir,
};
use std::path::{Path, PathBuf};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "markgrid")]
#[command(about = "Grade scanned or photographed OMR answer sheets against a template")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade sheet images.
    Grade(CliGradeArgs),

    /// Validate a template file and report its layout.
    CheckTemplate {
        /// Path to the template JSON.
        #[arg(long)]
        template: PathBuf,
    },

    /// Print the expanded template (questions, bubbles, fiducials) as JSON.
    TemplateInfo {
        /// Path to the template JSON.
        #[arg(long)]
        template: PathBuf,
    },

    /// Render a synthetic filled sheet for a template.
    Render(CliRenderArgs),
}

#[derive(Debug, Clone, Args)]
struct CliGradeArgs {
    /// Work directory with template.json, optional config.json and
    /// answer_key.json, and the sheet images.
    #[arg(long, conflicts_with_all = ["template", "images"])]
    dir: Option<PathBuf>,

    /// Path to the template JSON.
    #[arg(long, required_unless_present = "dir")]
    template: Option<PathBuf>,

    /// Path to a grading configuration JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to an answer key JSON.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Sheet images.
    images: Vec<PathBuf>,

    /// Path to write the batch result (JSON). Printed to stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Orientation hint applied to every image.
    #[arg(long, value_enum, default_value_t = OrientationArg::Upright)]
    orientation: OrientationArg,

    #[command(flatten)]
    overrides: CliConfigOverrides,
}

#[derive(Debug, Clone, Args, Default)]
struct CliConfigOverrides {
    /// Minimum number of matched fiducials.
    #[arg(long)]
    quorum: Option<usize>,

    /// Darkness gap under which the top marks count as tied.
    #[arg(long)]
    tie_margin: Option<f32>,

    /// Absolute darkness floor for a mark.
    #[arg(long)]
    min_darkness: Option<f32>,

    /// Maximum normalized alignment residual.
    #[arg(long)]
    max_residual: Option<f64>,

    /// Transform model used for alignment.
    #[arg(long, value_enum)]
    model: Option<ModelArg>,

    /// Maximum number of sheets graded concurrently.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Score multiply-marked questions containing a correct option as partial.
    #[arg(long)]
    lenient_multiple: bool,
}

impl CliConfigOverrides {
    fn apply(&self, config: &mut GradeConfig) {
        if let Some(q) = self.quorum {
            config.fiducial_quorum = q;
        }
        if let Some(t) = self.tie_margin {
            config.tie_margin = t;
        }
        if let Some(d) = self.min_darkness {
            config.min_mark_darkness = d;
        }
        if let Some(r) = self.max_residual {
            config.max_alignment_residual = r;
        }
        if let Some(m) = self.model {
            config.transform_model = m.to_core();
        }
        if self.concurrency.is_some() {
            config.concurrency_limit = self.concurrency;
        }
        if self.lenient_multiple {
            config.scoring.lenient_multiple = true;
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelArg {
    Auto,
    Affine,
    Homography,
}

impl ModelArg {
    fn to_core(self) -> TransformModel {
        match self {
            Self::Auto => TransformModel::Auto,
            Self::Affine => TransformModel::Affine,
            Self::Homography => TransformModel::Homography,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrientationArg {
    Upright,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl OrientationArg {
    fn to_core(self) -> Orientation {
        match self {
            Self::Upright => Orientation::Upright,
            Self::Rotate90 => Orientation::Rotate90,
            Self::Rotate180 => Orientation::Rotate180,
            Self::Rotate270 => Orientation::Rotate270,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliRenderArgs {
    /// Path to the template JSON.
    #[arg(long)]
    template: PathBuf,

    /// Output image path (PNG).
    #[arg(long)]
    out: PathBuf,

    /// Marks as QUESTION=OPTION, repeatable.
    #[arg(long = "mark", value_name = "QUESTION=OPTION")]
    marks: Vec<String>,

    /// Output width in pixels.
    #[arg(long, default_value = "1275")]
    width: u32,

    /// Output height in pixels.
    #[arg(long, default_value = "1650")]
    height: u32,

    /// Page rotation in degrees.
    #[arg(long, default_value = "0.0")]
    rotate: f64,

    /// Left-to-right lighting falloff in [0, 1).
    #[arg(long, default_value = "0.0")]
    shading: f32,

    /// Noise seed.
    #[arg(long, default_value = "7")]
    seed: u64,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Grade(args) => run_grade(&args),
        Commands::CheckTemplate { template } => run_check_template(&template),
        Commands::TemplateInfo { template } => run_template_info(&template),
        Commands::Render(args) => run_render(&args),
    }
}

// ── grade ──────────────────────────────────────────────────────────────

fn run_grade(args: &CliGradeArgs) -> CliResult<()> {
    let mut work = match &args.dir {
        Some(dir) => WorkDir::load(dir)?,
        None => load_explicit(args)?,
    };
    args.overrides.apply(&mut work.config);

    let grader = work.grader()?;
    tracing::info!(
        "Grading {} sheets with template '{}'",
        work.images.len(),
        grader.template().name()
    );

    let batch = grader.grade_paths(&work.images, args.orientation.to_core())?;
    log_summary(&batch);

    let json = serde_json::to_string_pretty(&batch)?;
    match &args.out {
        Some(out) => {
            std::fs::write(out, &json)?;
            tracing::info!("Results written to {}", out.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn load_explicit(args: &CliGradeArgs) -> CliResult<WorkDir> {
    let template_path = args
        .template
        .as_deref()
        .ok_or_else(|| -> CliError { "--template or --dir is required".into() })?;
    let template = Template::from_json_file(template_path)?;
    let config = match &args.config {
        Some(p) => GradeConfig::from_json_file(p)?,
        None => GradeConfig::default(),
    };
    let answer_key = args
        .key
        .as_deref()
        .map(AnswerKey::from_json_file)
        .transpose()?;
    Ok(WorkDir {
        template,
        config,
        answer_key,
        images: args.images.clone(),
    })
}

fn log_summary(batch: &BatchResult) {
    let s = &batch.stats;
    tracing::info!(
        "Graded {}/{} sheets ({} failed, {} cancelled, {} need review)",
        s.n_graded,
        s.n_sheets,
        s.n_failed,
        s.n_cancelled,
        s.n_needing_review,
    );
    if let (Some(mean), Some(median)) = (s.mean_score, s.median_score) {
        tracing::info!("Score: mean={:.2}, median={:.2}", mean, median);
    }
    for record in &batch.sheets {
        if let SheetOutcome::Failed(f) = &record.outcome {
            tracing::warn!("{}: {}", record.sheet_id, f);
        }
    }
}

// ── check-template ─────────────────────────────────────────────────────

fn run_check_template(path: &Path) -> CliResult<()> {
    let t = Template::from_json_file(path)?;
    let page = t.page_size();

    println!("template '{}' is valid", t.name());
    println!("  page size:      {}x{}", page[0], page[1]);
    println!("  fiducials:      {}", t.fiducials().len());
    println!("  field blocks:   {}", t.blocks().len());
    println!("  questions:      {}", t.questions().len());
    println!("  bubbles:        {}", t.bubbles().len());
    if !t.custom_labels().is_empty() {
        println!("  custom labels:  {}", t.custom_labels().len());
    }
    for block in t.blocks() {
        println!(
            "  block {:<12} {}x{} at ({:.0}, {:.0})..({:.0}, {:.0})",
            block.name,
            block.rows,
            block.cols,
            block.bounds[0],
            block.bounds[1],
            block.bounds[2],
            block.bounds[3],
        );
    }
    Ok(())
}

// ── template-info ──────────────────────────────────────────────────────

fn run_template_info(path: &Path) -> CliResult<()> {
    let t = Template::from_json_file(path)?;
    let questions: Vec<serde_json::Value> = t
        .questions()
        .iter()
        .map(|q| {
            let bubbles: Vec<serde_json::Value> = q
                .bubbles
                .iter()
                .filter_map(|&i| t.bubble(i))
                .map(|b| {
                    serde_json::json!({
                        "option": b.option,
                        "center": b.center,
                        "size": b.size,
                    })
                })
                .collect();
            serde_json::json!({ "id": q.id, "bubbles": bubbles })
        })
        .collect();
    let fiducials: Vec<serde_json::Value> = t
        .fiducials()
        .iter()
        .map(|f| serde_json::json!({ "name": f.name, "center": f.center, "size": f.size }))
        .collect();
    let info = serde_json::json!({
        "name": t.name(),
        "page_size": t.page_size(),
        "fiducials": fiducials,
        "questions": questions,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

// ── render ─────────────────────────────────────────────────────────────

fn run_render(args: &CliRenderArgs) -> CliResult<()> {
    let t = Template::from_json_file(&args.template)?;
    let mut marks = SheetMarks::new();
    for m in &args.marks {
        let (q, o) = m.split_once('=').ok_or_else(|| -> CliError {
            format!("invalid mark '{m}', expected Q=OPTION").into()
        })?;
        marks = marks.mark(q.trim(), o.trim());
    }
    let params = RenderParams::fitted(&t, (args.width, args.height))
        .rotated(args.rotate)
        .with_shading(args.shading)
        .with_noise(6, args.seed);
    let img = render_sheet(&t, &marks, &params);
    img.save(&args.out)?;
    tracing::info!(
        "Rendered {}x{} sheet to {}",
        args.width,
        args.height,
        args.out.display()
    );
    Ok(())
}
