use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use site_publish::build_output::BuildOutput;
use site_publish::contract::{
    AcquireError, DeployCredential, HistoryDepth, MockAcquirer, MockPublisher, MockRenderer,
    PublishReceipt, PublishTarget, RenderError, RenderReport, SourceSnapshot, ThemeReference,
};
use site_publish::ledger::BuildLedger;
use site_publish::pipeline::{
    Pipeline, PipelineError, PipelineSettings, RunOutcome, RunState, Stage,
};
use site_publish::trigger::{BranchFilter, TriggerEvent};
use tempfile::tempdir;

type Published = Arc<Mutex<Vec<BTreeMap<String, Vec<u8>>>>>;

fn settings(credential: Option<&str>) -> PipelineSettings {
    PipelineSettings {
        theme: ThemeReference::new("paper", None),
        output_dir: PathBuf::from("public"),
        target: PublishTarget::new("alice/alice.github.io", "main"),
        credential: credential.map(DeployCredential::new),
        ledger: None,
        lock: None,
    }
}

fn main_only() -> BranchFilter {
    BranchFilter::new(["main"]).unwrap()
}

fn acquirer_at(root: &Path, history: HistoryDepth) -> MockAcquirer {
    let root = root.to_path_buf();
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().returning(move |event: &TriggerEvent| {
        Ok(SourceSnapshot {
            root: root.clone(),
            branch: event.branch.clone(),
            commit: event.commit.clone(),
            history,
        })
    });
    acquirer
}

fn renderer_writing(files: &'static [(&'static str, &'static str)]) -> MockRenderer {
    let mut renderer = MockRenderer::new();
    renderer
        .expect_render()
        .returning(move |_source: &SourceSnapshot, _theme: &ThemeReference, out: &Path| {
            for (path, content) in files {
                let dest = out.join(path);
                fs::create_dir_all(dest.parent().unwrap()).unwrap();
                fs::write(dest, content).unwrap();
            }
            Ok(RenderReport::default())
        });
    renderer
}

fn recording_publisher(published: Published) -> MockPublisher {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().returning(
        move |output: &BuildOutput,
              _credential: &DeployCredential,
              target: &PublishTarget,
              _source_commit: &str| {
            published.lock().unwrap().push(output.files().clone());
            Ok(PublishReceipt {
                target: target.clone(),
                build_id: output.build_id().clone(),
                commit: "0123abcd".to_string(),
                pushed: true,
            })
        },
    );
    publisher
}

fn silent_mocks() -> (MockAcquirer, MockRenderer, MockPublisher) {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().never();
    let mut renderer = MockRenderer::new();
    renderer.expect_render().never();
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();
    (acquirer, renderer, publisher)
}

#[tokio::test]
async fn push_to_unlisted_branch_is_skipped_without_side_effects() {
    let (acquirer, renderer, publisher) = silent_mocks();
    let pipeline = Pipeline::new(main_only(), acquirer, renderer, publisher, settings(Some("key")));

    let outcome = pipeline
        .run(TriggerEvent::new("feature/x", "abc"))
        .await
        .expect("a skipped trigger is not an error");
    assert!(matches!(outcome, RunOutcome::Skipped { branch } if branch == "feature/x"));
}

#[tokio::test]
async fn successful_run_publishes_exactly_the_rendered_files() {
    let source = tempdir().unwrap();
    let published = Published::default();
    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer_writing(&[("index.html", "<h1>home</h1>"), ("posts/a/index.html", "a")]),
        recording_publisher(published.clone()),
        settings(Some("key")),
    );

    let outcome = pipeline.run(TriggerEvent::new("refs/heads/main", "c0ffee")).await.unwrap();
    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(report.source_commit, "c0ffee");
    assert_eq!(report.file_count, 2);
    assert!(report.receipt.pushed);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Idle,
            RunState::Triggered,
            RunState::Acquiring,
            RunState::Cleaning,
            RunState::Rendering,
            RunState::Publishing,
            RunState::Succeeded,
        ]
    );

    let published = published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let paths: Vec<_> = published[0].keys().cloned().collect();
    assert_eq!(paths, vec!["index.html", "posts/a/index.html"]);
}

#[tokio::test]
async fn stale_output_from_a_previous_build_is_not_published() {
    let source = tempdir().unwrap();
    let stale = source.path().join("public/removed-post/index.html");
    fs::create_dir_all(stale.parent().unwrap()).unwrap();
    fs::write(&stale, "gone").unwrap();

    let published = Published::default();
    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer_writing(&[("index.html", "fresh")]),
        recording_publisher(published.clone()),
        settings(Some("key")),
    );
    pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap();

    let published = published.lock().unwrap();
    assert_eq!(published[0].keys().collect::<Vec<_>>(), vec!["index.html"]);
}

#[tokio::test]
async fn render_failure_never_reaches_publish() {
    let source = tempdir().unwrap();
    let mut renderer = MockRenderer::new();
    renderer.expect_render().times(1).returning(|_, _, _| {
        Err(RenderError::Exited {
            code: Some(2),
            stderr: "template error".into(),
        })
    });
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();

    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer,
        publisher,
        settings(Some("key")),
    );
    let err = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap_err();
    assert_eq!(err.stage(), Stage::Render);
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn empty_render_output_is_a_render_failure() {
    let source = tempdir().unwrap();
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();

    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer_writing(&[]),
        publisher,
        settings(Some("key")),
    );
    let err = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Render(RenderError::Output(_))));
}

#[tokio::test]
async fn missing_credential_fails_before_any_step() {
    for credential in [None, Some("  ")] {
        let (acquirer, renderer, publisher) = silent_mocks();
        let pipeline = Pipeline::new(main_only(), acquirer, renderer, publisher, settings(credential));
        let err = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential));
        assert_eq!(err.stage(), Stage::Trigger);
    }
}

#[tokio::test]
async fn acquisition_failure_stops_the_run() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(1).returning(|_| {
        Err(AcquireError::Git {
            step: "clone",
            code: Some(128),
            stderr: "repository not found".into(),
        })
    });
    let mut renderer = MockRenderer::new();
    renderer.expect_render().never();
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();

    let pipeline = Pipeline::new(main_only(), acquirer, renderer, publisher, settings(Some("key")));
    let err = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap_err();
    assert_eq!(err.stage(), Stage::Acquire);
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn shallow_history_still_completes() {
    let source = tempdir().unwrap();
    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Shallow),
        renderer_writing(&[("index.html", "x")]),
        recording_publisher(Published::default()),
        settings(Some("key")),
    );
    let outcome = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap();
    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(report.history, HistoryDepth::Shallow);
}

#[tokio::test]
async fn identical_renders_produce_identical_build_ids() {
    let source = tempdir().unwrap();
    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer_writing(&[("index.html", "same"), ("css/site.css", "body{}")]),
        recording_publisher(Published::default()),
        settings(Some("key")),
    );

    let mut ids = Vec::new();
    for commit in ["aaa", "bbb"] {
        match pipeline.run(TriggerEvent::new("main", commit)).await.unwrap() {
            RunOutcome::Completed(report) => ids.push(report.build_id),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn archived_build_can_be_republished_without_rendering() {
    let source = tempdir().unwrap();
    let ledger_dir = tempdir().unwrap();
    let published = Published::default();
    let mut with_ledger = settings(Some("key"));
    with_ledger.ledger = Some(BuildLedger::new(ledger_dir.path()));

    let pipeline = Pipeline::new(
        main_only(),
        acquirer_at(source.path(), HistoryDepth::Full),
        renderer_writing(&[("index.html", "v1")]),
        recording_publisher(published.clone()),
        with_ledger,
    );
    let RunOutcome::Completed(report) = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap() else {
        panic!("expected a completed run");
    };

    let listed = pipeline.ledger().unwrap().list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].build_id, report.build_id);
    assert_eq!(listed[0].source_commit, "abc");

    let receipt = pipeline.republish(report.build_id.as_str()).await.unwrap();
    assert_eq!(receipt.build_id, report.build_id);

    let published = published.lock().unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0], published[1]);
}

#[tokio::test]
async fn republish_requires_a_ledger() {
    let (acquirer, renderer, publisher) = silent_mocks();
    let pipeline = Pipeline::new(main_only(), acquirer, renderer, publisher, settings(Some("key")));
    let err = pipeline.republish(&"a".repeat(64)).await.unwrap_err();
    assert!(matches!(err, PipelineError::LedgerDisabled));
}

#[tokio::test]
async fn output_dir_at_the_source_root_is_refused_before_cleaning() {
    for output_dir in ["", ".", "content/.."] {
        let source = tempdir().unwrap();
        let post = source.path().join("content/post.md");
        fs::create_dir_all(post.parent().unwrap()).unwrap();
        fs::write(&post, "# Post").unwrap();

        let mut renderer = MockRenderer::new();
        renderer.expect_render().never();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();
        let mut unsafe_settings = settings(Some("key"));
        unsafe_settings.output_dir = PathBuf::from(output_dir);

        let pipeline = Pipeline::new(
            main_only(),
            acquirer_at(source.path(), HistoryDepth::Full),
            renderer,
            publisher,
            unsafe_settings,
        );
        let err = pipeline.run(TriggerEvent::new("main", "abc")).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsafeOutputDir(_)), "`{output_dir}`: {err}");
        assert_eq!(err.stage(), Stage::Clean);
        assert!(post.exists(), "source tree must survive `{output_dir}`");
    }
}
