mod common;

use std::io::Read;
use std::sync::Arc;

use blendfarm::{
    EngineVariant, FarmConfig, FarmError, JobStatus, RenderFarmBuilder, RenderType,
};
use blendfarm_testkit::{FakeEngine, NodeScript, WAIT, next_job_end, wait_for};

use common::start;

#[tokio::test]
async fn test_output_is_unavailable_until_finished() {
    let t = start(FakeEngine::new(1).with_default_script(NodeScript::Hold)).await;

    let id = t.farm.register(
        "busy",
        "/scenes/busy.blend",
        RenderType::Animation,
        EngineVariant::Current,
    );
    assert!(wait_for(|| t.engine.launch_count() == 1, WAIT).await);

    let err = t.farm.retrieve_output(id).await.unwrap_err();
    assert!(matches!(
        err,
        FarmError::InvalidState {
            status: JobStatus::Rendering,
            expected: JobStatus::Finished,
            ..
        }
    ));
    assert_eq!(t.archiver.call_count(), 0);
}

#[tokio::test]
async fn test_still_output_is_the_rendered_image() {
    let t = start(FakeEngine::new(2)).await;
    let mut events = t.farm.subscribe();

    let id = t.farm.register(
        "poster",
        "/scenes/poster.blend",
        RenderType::Still,
        EngineVariant::Current,
    );
    next_job_end(&mut events, id).await.expect("job ended");

    let path = t.farm.retrieve_output(id).await.expect("output");
    let expected = t
        .root
        .path()
        .join(format!("poster_{id}"))
        .join(format!("poster_{id}.png"));
    assert_eq!(path, expected);
    assert_eq!(t.archiver.call_count(), 0);
}

#[tokio::test]
async fn test_animation_is_archived_once() {
    let t = start(FakeEngine::new(2)).await;
    let mut events = t.farm.subscribe();

    let id = t.farm.register(
        "walk",
        "/scenes/walk.blend",
        RenderType::Animation,
        EngineVariant::Current,
    );
    let job = next_job_end(&mut events, id).await.expect("job ended");
    assert_eq!(job.status, JobStatus::Finished);

    let (first, second) = tokio::join!(t.farm.retrieve_output(id), t.farm.retrieve_output(id));
    let first = first.expect("first retrieval");
    assert_eq!(first, second.expect("second retrieval"));
    assert_eq!(first, t.root.path().join(format!("walk_{id}.zip")));

    let third = t.farm.retrieve_output(id).await.expect("third retrieval");
    assert_eq!(third, first);

    let calls = t.archiver.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, job.output_folder(t.root.path()));
    assert_eq!(calls[0].destination, first);
}

#[tokio::test]
async fn test_animation_frames_are_zipped_on_retrieval() {
    let root = tempfile::tempdir().expect("tempdir");
    let engine = FakeEngine::new(1);
    let farm = RenderFarmBuilder::new(FarmConfig {
        output_root: root.path().to_path_buf(),
        ..FarmConfig::default()
    })
    .with_engine(Arc::new(engine))
    .build()
    .await
    .expect("farm starts");
    let mut events = farm.subscribe();

    let id = farm.register(
        "turntable",
        "/scenes/turntable.blend",
        RenderType::Animation,
        EngineVariant::Current,
    );
    let job = next_job_end(&mut events, id).await.expect("job ended");

    let folder = job.output_folder(root.path());
    std::fs::create_dir_all(&folder).expect("create folder");
    for frame in 1..=3 {
        std::fs::write(
            folder.join(format!("{}-{frame:04}.png", job.output_name())),
            format!("frame {frame}"),
        )
        .expect("write frame");
    }

    let path = farm.retrieve_output(id).await.expect("archive");
    assert!(path.exists());

    let file = std::fs::File::open(&path).expect("open archive");
    let mut archive = zip::ZipArchive::new(file).expect("read archive");
    assert_eq!(archive.len(), 3);
    let mut contents = String::new();
    archive
        .by_name(&format!("{}-0002.png", job.output_name()))
        .expect("frame entry")
        .read_to_string(&mut contents)
        .expect("read entry");
    assert_eq!(contents, "frame 2");
}
