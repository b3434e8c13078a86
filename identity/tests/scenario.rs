//! End-to-end enrollment, matching and persistence through `FaceService`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use facebank_identity::{
    AddRequest, Config, Cropper, FaceBoundingBox, FaceCrop, FaceDetector, FaceEmbedder, FaceService,
    ImageSource, Metric, Pipeline, Registry, Result,
};

/// A fake "photo": jpeg magic followed by one byte per face, the byte
/// being that face's identity.
fn photo(faces: &[u8]) -> ImageSource {
    let mut b = vec![0xFF, 0xD8, 0xFF];
    b.extend_from_slice(faces);
    ImageSource::Bytes(b)
}

struct ByteFaces;

impl FaceDetector for ByteFaces {
    fn name(&self) -> &str {
        "byte-faces"
    }

    fn detect(&self, images: &[ImageSource]) -> Result<Vec<Vec<FaceBoundingBox>>> {
        images
            .iter()
            .map(|img| {
                Ok(img.bytes()?[3..]
                    .iter()
                    .map(|&id| FaceBoundingBox::new(id as i32, 0, 32, 32, 0.98))
                    .collect())
            })
            .collect()
    }
}

struct NoDecode;

impl Cropper for NoDecode {
    fn dimensions(&self, _image: &ImageSource) -> Result<(u32, u32)> {
        Ok((640, 480))
    }

    fn crop(&self, _image: &ImageSource, bbox: &FaceBoundingBox, align: bool) -> Result<FaceCrop> {
        Ok(FaceCrop {
            bbox: *bbox,
            aligned: align,
            width: 32,
            height: 32,
            pixels: Vec::new(),
        })
    }
}

/// Each identity is its own axis, scaled so distinct identities sit
/// beyond the euclidean threshold.
struct IdentityAxis;

impl FaceEmbedder for IdentityAxis {
    fn embed(&self, crops: &[FaceCrop], model: &str) -> Result<Vec<Vec<f32>>> {
        let dim = facebank_identity::embedding_dimension(model)?;
        Ok(crops
            .iter()
            .map(|c| {
                let mut v = vec![0.0; dim];
                v[c.bbox.x as usize % dim] = 20.0;
                v
            })
            .collect())
    }
}

fn pipeline() -> Arc<Pipeline> {
    Arc::new(
        Pipeline::new(Arc::new(NoDecode), Arc::new(IdentityAxis))
            .with_detector(Arc::new(ByteFaces)),
    )
}

fn config(base: &Path, metric: Metric) -> Config {
    Config::parse(&format!(
        "detector_model:
  name: byte-faces
embedding_model:
  name: FaceNet128
image_store:
  vector_indexing: true
  metric: {metric}
  embedding_model: FaceNet128
  dump_interval_secs: 3600
database_path: {}
",
        base.display()
    ))
    .unwrap()
}

/// Set `RUST_LOG=facebank_identity=debug` to see store events.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn enroll_and_recognize(metric: Metric) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let svc = FaceService::open(&config(dir.path(), metric), pipeline()).unwrap();
    let photo_a = photo(&[17]);

    let added = svc.add_identity(&[AddRequest::new(photo_a.clone(), "alice")]);
    assert!(added[0].success);
    assert_eq!(added[0].reason, None);

    let again = svc.add_identity(&[AddRequest::new(photo_a.clone(), "alice")]);
    assert!(!again[0].success);
    assert!(again[0].reason.as_deref().unwrap().starts_with("duplicate"));
    assert_eq!(svc.store().len(), 1);

    let res = svc.recognize(&[photo_a, photo(&[99])]).unwrap();
    assert!(res[0].verified, "{metric}: enrolled face must match");
    assert_eq!(res[0].user_id.as_deref(), Some("alice"));
    assert_eq!(res[0].metric, Some(metric));

    assert!(!res[1].verified, "{metric}: stranger must not match");
    assert_eq!(res[1].user_id, None);
}

#[test]
fn scenario_cosine() {
    enroll_and_recognize(Metric::Cosine);
}

#[test]
fn scenario_euclidean() {
    enroll_and_recognize(Metric::EuclideanL2);
}

#[test]
fn empty_store_recognize_is_default_answer() {
    let dir = tempfile::tempdir().unwrap();
    let svc = FaceService::open(&config(dir.path(), Metric::Cosine), pipeline()).unwrap();
    for r in svc.recognize(&[photo(&[1]), photo(&[2, 3]), photo(&[])]).unwrap() {
        assert!(!r.verified);
        assert_eq!(r.distance, 0.0);
        assert_eq!(r.metric, None);
        assert_eq!(r.threshold, None);
        assert_eq!(r.user_id, None);
    }
}

#[test]
fn verify_reports_winning_faces() {
    let dir = tempfile::tempdir().unwrap();
    let svc = FaceService::open(&config(dir.path(), Metric::Cosine), pipeline()).unwrap();
    let res = svc
        .verify(&[(photo(&[1, 2, 3]), photo(&[9, 3]))], Some(Metric::EuclideanL2))
        .unwrap();
    let m = res[0].as_ref().unwrap();
    assert!(m.verified);
    assert_eq!(m.distance, 0.0);
    let faces = m.faces.unwrap();
    assert_eq!((faces.image1.x, faces.image2.x), (3, 3));
}

#[tokio::test]
async fn snapshot_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), Metric::Cosine);

    let svc = FaceService::open(&cfg, pipeline()).unwrap();
    let added = svc.add_identity(&[
        AddRequest::new(photo(&[5]), "alice"),
        AddRequest::new(photo(&[6, 7]), "bob"),
    ]);
    assert!(added.iter().all(|r| r.success));

    let handle = svc.start_persistence();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.completed_dumps() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first snapshot");
    handle.shutdown().await;
    drop(svc);

    let reopened = FaceService::open(&cfg, pipeline()).unwrap();
    assert_eq!(reopened.store().len(), 2);
    assert_eq!(reopened.store().vector_count(), Some(3));
    let res = reopened.recognize(&[photo(&[7])]).unwrap();
    assert_eq!(res[0].user_id.as_deref(), Some("bob"));
}

#[test]
fn registry_serves_one_service_per_name() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), Metric::Cosine);

    let services: Registry<FaceService> = Registry::new("store");
    services.register("faces", move || FaceService::open(&cfg, pipeline()).map(Arc::new));
    services.validate(["faces"]).unwrap();

    let a = services.get("faces").unwrap();
    a.add_identity(&[AddRequest::new(photo(&[40]), "carol")]);
    let b = services.get("faces").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.store().len(), 1);
    assert!(services.get("other").is_err());
}
