use markgrid::synth::{render_sheet, RenderParams, SheetMarks};
use markgrid::{
    AlignmentError, AnswerKey, CancelToken, CapturedImage, Decision, DecisionStatus, GradeConfig,
    GradeRequest, Grader, Orientation, SheetOutcome, SheetStage, Template, TemplateRef,
    TemplateRegistry, TransformModel, Verdict,
};

const QUIZ5: &str = r#"{
    "schema": "markgrid.template.v1",
    "name": "quiz5",
    "page_size": [600, 800],
    "bubble_size": [30, 30],
    "fiducials": [
        {"name": "tl", "center": [40, 40], "size": 40},
        {"name": "tr", "center": [560, 40], "size": 40},
        {"name": "bl", "center": [40, 760], "size": 40},
        {"name": "br", "center": [560, 760], "size": 40}
    ],
    "field_blocks": [{
        "name": "mcq",
        "origin": [150, 150],
        "field_labels": ["q1..5"],
        "bubble_values": ["A", "B", "C", "D"],
        "bubbles_gap": 60,
        "labels_gap": 70
    }]
}"#;

const KEY: &str = r#"{"q1": "A", "q2": "B", "q3": "C", "q4": "D", "q5": "A"}"#;

fn template() -> Template {
    Template::from_json_str(QUIZ5).expect("valid template")
}

fn grader() -> Grader {
    let key = AnswerKey::from_json_str(KEY).expect("valid key");
    Grader::new(template(), GradeConfig::default())
        .and_then(|g| g.with_answer_key(key))
        .expect("valid grader")
}

fn sheet(id: &str, marks: &SheetMarks, params: &RenderParams) -> CapturedImage {
    CapturedImage::new(id, render_sheet(&template(), marks, params))
}

fn all_correct() -> SheetMarks {
    SheetMarks::answers([("q1", "A"), ("q2", "B"), ("q3", "C"), ("q4", "D"), ("q5", "A")])
}

#[test]
fn all_correct_sheet_scores_five() {
    let params = RenderParams::fitted(&template(), (600, 800));
    let record = grader().grade_sheet(&sheet("perfect", &all_correct(), &params));
    let result = record.result().expect("graded");

    let score = result.score.as_ref().expect("keyed");
    assert_eq!(score.total, 5.0);
    assert_eq!(score.max_total, 5.0);
    assert_eq!(score.n_correct, 5);
    assert!(result
        .decisions
        .iter()
        .all(|d| d.decision.status() == DecisionStatus::Single));
    assert_eq!(result.responses["q3"], "C");
    assert_eq!(result.multi_marked, 0);
    assert_eq!(result.signals.len(), 20);
}

#[test]
fn blank_question_scores_four_with_none() {
    let marks = SheetMarks::answers([("q1", "A"), ("q2", "B"), ("q4", "D"), ("q5", "A")]);
    let params = RenderParams::fitted(&template(), (600, 800));
    let record = grader().grade_sheet(&sheet("q3-blank", &marks, &params));
    let result = record.result().expect("graded");

    let score = result.score.as_ref().expect("keyed");
    assert_eq!(score.total, 4.0);
    assert_eq!(
        result.decision("q3").map(Decision::status),
        Some(DecisionStatus::None)
    );
    let q3 = score
        .questions
        .iter()
        .find(|q| q.question == "q3")
        .expect("q3 scored");
    assert_eq!(q3.verdict, Verdict::Unanswered);
    assert_eq!(result.responses["q3"], "");
}

#[test]
fn double_mark_is_multiple_not_a_guess() {
    let marks = all_correct().mark("q2", "D");
    let params = RenderParams::fitted(&template(), (600, 800));
    let record = grader().grade_sheet(&sheet("double", &marks, &params));
    let result = record.result().expect("graded");

    match result.decision("q2") {
        Some(Decision::Multiple { options, .. }) => assert_eq!(options, &["B", "D"]),
        other => panic!("expected multiple for q2, got {other:?}"),
    }
    assert_eq!(result.multi_marked, 1);
    assert_eq!(result.responses["q2"], "BD");
    assert_eq!(result.score.as_ref().map(|s| s.total), Some(4.0));
    assert!(result.needs_review());
}

#[test]
fn rotated_sheet_aligns_with_high_confidence() {
    for degrees in [-8.0, -3.0, 4.0, 8.0] {
        let params = RenderParams::fitted(&template(), (600, 800)).rotated(degrees);
        let record = grader().grade_sheet(&sheet("rotated", &all_correct(), &params));
        let result = record
            .result()
            .unwrap_or_else(|| panic!("rotation {degrees} failed: {:?}", record.failure()));
        assert!(
            result.alignment.confidence > 0.9,
            "rotation {degrees}: confidence {}",
            result.alignment.confidence
        );
        assert!((result.alignment.shape.rotation_deg - degrees).abs() < 0.5);
        assert_eq!(result.score.as_ref().map(|s| s.total), Some(5.0));
    }
}

#[test]
fn strongly_rotated_small_page_is_graded() {
    let params = RenderParams::fitted(&template(), (600, 800))
        .scaled(0.7)
        .rotated(20.0)
        .with_noise(6, 21);
    let record = grader().grade_sheet(&sheet("rotated20", &all_correct(), &params));
    let result = record
        .result()
        .unwrap_or_else(|| panic!("20 degree sheet failed: {:?}", record.failure()));
    assert!((result.alignment.shape.rotation_deg - 20.0).abs() < 1.0);
    assert!((result.alignment.shape.scale_ratio - 0.63).abs() < 0.02);
    assert_eq!(result.score.as_ref().map(|s| s.total), Some(5.0));
}

#[test]
fn perspective_and_uneven_lighting_are_tolerated() {
    let params = RenderParams::fitted(&template(), (600, 800))
        .tilted(1.5e-4, -1e-4)
        .with_shading(0.35);
    let record = grader().grade_sheet(&sheet("photo", &all_correct(), &params));
    let result = record.result().expect("graded");
    assert_eq!(result.alignment.model, TransformModel::Homography);
    assert_eq!(result.score.as_ref().map(|s| s.total), Some(5.0));
}

#[test]
fn two_visible_fiducials_fail_alignment() {
    let params =
        RenderParams::fitted(&template(), (600, 800)).with_hidden_fiducials(&["bl", "br"]);
    let record = grader().grade_sheet(&sheet("occluded", &all_correct(), &params));
    let failure = record.failure().expect("alignment must fail");
    assert_eq!(failure.stage, SheetStage::Aligning);
    // pencil marks are also candidates, so only the counts are pinned
    assert!(
        failure
            .reason
            .starts_with("insufficient fiducials: matched 2 of required 3"),
        "{}",
        failure.reason
    );

    let err = markgrid::align(
        &render_sheet(&template(), &SheetMarks::new(), &params),
        &template(),
        &GradeConfig::default(),
    )
    .expect_err("two corners");
    assert_eq!(
        err,
        AlignmentError::InsufficientFiducials {
            matched: 2,
            required: 3,
            candidates: 2
        }
    );
}

#[test]
fn orientation_hint_is_applied_before_alignment() {
    let params = RenderParams::fitted(&template(), (600, 800));
    let upright = render_sheet(&template(), &all_correct(), &params);
    // stored rotated 90° counter-clockwise; the hint rotates it back
    let stored = image::imageops::rotate270(&upright);
    let capture = CapturedImage::new("sideways", stored).with_orientation(Orientation::Rotate90);
    let record = grader().grade_sheet(&capture);
    let result = record.result().expect("graded");
    assert_eq!(result.image_size, [600, 800]);
    assert_eq!(result.score.as_ref().map(|s| s.total), Some(5.0));
}

#[test]
fn batch_isolates_failures_and_keeps_order() {
    let t = template();
    let good = RenderParams::fitted(&t, (600, 800));
    let bad = good.clone().with_hidden_fiducials(&["tl", "tr", "bl"]);
    let blank_q3 = SheetMarks::answers([("q1", "A"), ("q2", "B"), ("q4", "D"), ("q5", "A")]);

    let images = vec![
        sheet("s1", &all_correct(), &good),
        sheet("s2", &all_correct(), &bad),
        sheet("s3", &blank_q3, &good.clone().rotated(3.0)),
        CapturedImage::new("s4", image::GrayImage::new(1, 1)),
        sheet("s5", &all_correct().mark("q5", "B"), &good),
    ];
    let batch = grader().grade_batch(&images).expect("batch runs");

    let ids: Vec<&str> = batch.sheets.iter().map(|s| s.sheet_id.as_str()).collect();
    assert_eq!(ids, ["s1", "s2", "s3", "s4", "s5"]);
    assert!(batch.sheets[1].failure().is_some());
    assert!(batch.sheets[3].failure().is_some());

    let stats = &batch.stats;
    assert_eq!(stats.n_sheets, 5);
    assert_eq!(stats.n_graded, 3);
    assert_eq!(stats.n_failed, 2);
    assert_eq!(stats.n_needing_review, 1);
    assert_eq!(stats.mean_score, Some(13.0 / 3.0));
    assert_eq!(stats.median_score, Some(4.0));
    assert_eq!(stats.question_stats[2].n_none, 1);
}

#[test]
fn batch_cancelled_up_front_starts_nothing() {
    let params = RenderParams::fitted(&template(), (300, 400));
    let images: Vec<CapturedImage> = (0..3)
        .map(|i| sheet(&format!("s{i}"), &all_correct(), &params))
        .collect();
    let token = CancelToken::new();
    token.cancel();
    let batch = grader()
        .grade_batch_with_cancel(&images, &token)
        .expect("batch runs");
    assert!(batch
        .sheets
        .iter()
        .all(|s| s.outcome == SheetOutcome::Cancelled));
    assert_eq!(batch.stats.n_cancelled, 3);
}

#[test]
fn grade_entry_point_resolves_registry_templates() {
    let mut registry = TemplateRegistry::new();
    registry.insert(template()).expect("registered");
    let params = RenderParams::fitted(&template(), (600, 800));
    let request = GradeRequest {
        template: TemplateRef::Id("quiz5".into()),
        images: vec![sheet("only", &all_correct(), &params)],
        answer_key: Some(AnswerKey::from_json_str(KEY).expect("valid key")),
        config: GradeConfig {
            concurrency_limit: Some(2),
            ..GradeConfig::default()
        },
    };
    let batch = markgrid::grade(request, &registry, None).expect("graded");
    assert_eq!(batch.template, "quiz5");
    assert_eq!(batch.stats.mean_score, Some(5.0));

    let json = serde_json::to_value(&batch).expect("serializable");
    assert_eq!(json["sheets"][0]["outcome"]["status"], "graded");
    assert_eq!(
        json["sheets"][0]["outcome"]["decisions"][0]["decision"]["status"],
        "single"
    );
}
