mod common;

use common::{memory_store, random_unit_vectors, TestArchive};
use eventlens::db::{
    BoundingBox, CopyPlan, Database, FaceDetection, GroupRename, ImageFilter, ModelKind, NewImage,
    ObjectDetection,
};
use eventlens::error::StoreError;
use proptest::prelude::*;

fn detection(face_id: &str, image_id: i64, embedding: Vec<f32>) -> FaceDetection {
    FaceDetection {
        face_id: face_id.to_string(),
        image_id,
        model_name: "faces-v1".to_string(),
        bbox: BoundingBox {
            x1: 1.0,
            y1: 2.0,
            x2: 30.0,
            y2: 40.0,
        },
        det_score: 0.93,
        landmark: Some(vec![[5.0, 6.0], [7.0, 8.0]]),
        age: Some(31),
        gender: None,
        embedding,
        person_label: None,
        cluster_id: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn registration_is_idempotent(urls in prop::collection::vec("[a-z]{1,6}", 1..20)) {
        let db = memory_store();
        let images: Vec<NewImage> = urls
            .iter()
            .map(|u| NewImage::new(format!("https://x/{}", u), "G", 2024))
            .collect();

        let first = db.register_images(&images).unwrap();
        let count = db.count_images().unwrap();
        let replay = db.register_images(&images).unwrap();

        let distinct: std::collections::HashSet<_> = urls.iter().collect();
        prop_assert_eq!(first, distinct.len());
        prop_assert_eq!(replay, 0);
        prop_assert_eq!(db.count_images().unwrap(), count);
    }
}

#[test]
fn first_registration_wins() {
    let db = memory_store();
    assert!(db
        .register_image(&NewImage::new("https://x/1", "PyCon JP 2024", 2024))
        .unwrap());
    assert!(!db
        .register_image(&NewImage::new("https://x/1", "Something else", 1999))
        .unwrap());

    let image = db.lookup_by_source_url("https://x/1").unwrap().unwrap();
    assert_eq!(image.group_name, "PyCon JP 2024");
    assert_eq!(image.group_year, 2024);
}

#[test]
fn vector_insert_rejects_undeclared_model_and_wrong_dimension() {
    let db = memory_store();
    db.register_image(&NewImage::new("u", "G", 2024).with_storage_path("u.jpg"))
        .unwrap();

    let err = db.insert_vectors(&[1], &[vec![1.0, 0.0]], "nope").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownModel(_))
    ));

    db.declare_model("img", ModelKind::Image, 3).unwrap();
    let err = db.insert_vectors(&[1], &[vec![1.0, 0.0]], "img").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DimensionMismatch {
            expected: 3,
            actual: 2,
            ..
        })
    ));
    assert_eq!(db.embedding_stats("img").unwrap().embedded, 0);

    let err = db.declare_model("img", ModelKind::Image, 4).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::ModelConflict { .. })
    ));
}

#[test]
fn vectors_for_missing_image_fail_without_partial_writes() {
    let db = memory_store();
    db.declare_model("img", ModelKind::Image, 2).unwrap();
    db.register_image(&NewImage::new("u", "G", 2024).with_storage_path("u.jpg"))
        .unwrap();

    let result = db.insert_vectors(&[1, 99], &[vec![1.0, 0.0], vec![0.0, 1.0]], "img");
    assert!(result.is_err());
    assert_eq!(db.embedding_stats("img").unwrap().embedded, 0);
}

#[test]
fn models_are_separate_namespaces() {
    let db = memory_store();
    db.declare_model("v1", ModelKind::Image, 2).unwrap();
    db.declare_model("v2", ModelKind::Image, 3).unwrap();
    db.register_image(&NewImage::new("u", "G", 2024).with_storage_path("u.jpg"))
        .unwrap();

    db.insert_vectors(&[1], &[vec![1.0, 0.0]], "v1").unwrap();

    assert!(db.pending_images("v1").unwrap().is_empty());
    assert_eq!(db.pending_images("v2").unwrap(), vec![(1, "u.jpg".to_string())]);
    assert_eq!(db.vector_for(1, "v2").unwrap(), None);

    assert_eq!(db.purge_model_vectors("v1").unwrap(), 1);
    assert_eq!(db.pending_images("v1").unwrap().len(), 1);
}

#[test]
fn rename_groups_dry_run_then_apply() {
    let db = memory_store();
    db.register_image(&NewImage::new("a", "PyCon JP", 2023)).unwrap();
    db.register_image(&NewImage::new("b", "PyCon JP", 2024)).unwrap();
    db.register_image(&NewImage::new("c", "Other", 2024)).unwrap();

    let renames = vec![GroupRename {
        from: "PyCon JP".to_string(),
        to: "PyCon JP 2024".to_string(),
        year: Some(2024),
    }];

    let preview = db.rename_groups(&renames, true).unwrap();
    assert_eq!(preview[0].matched, 2);
    assert!(!preview[0].applied);
    assert!(db.group_names().unwrap().contains(&"PyCon JP".to_string()));
    assert!(!db.group_names().unwrap().contains(&"PyCon JP 2024".to_string()));

    let applied = db.rename_groups(&renames, false).unwrap();
    assert_eq!(applied[0].matched, 2);
    assert!(applied[0].applied);

    let filter = ImageFilter {
        group_name: Some("PyCon JP 2024".to_string()),
        ..Default::default()
    };
    let renamed = db.list_images(&filter).unwrap();
    assert_eq!(renamed.len(), 2);
    assert!(renamed.iter().all(|image| image.group_year == 2024));
    assert_eq!(db.group_names().unwrap(), vec!["Other", "PyCon JP 2024"]);
    assert_eq!(db.group_years().unwrap(), vec![2024]);
}

fn populated_source() -> TestArchive {
    let source = TestArchive::new();
    let a = source.add_image("a.jpg", "PyCon JP 2024", 2024);
    let b = source.add_image("b.jpg", "PyCon JP 2024", 2024);

    source.db.declare_model("img", ModelKind::Image, 4).unwrap();
    let vectors = random_unit_vectors(7, 2, 4);
    source.db.insert_vectors(&[a, b], &vectors, "img").unwrap();

    source.db.declare_model("faces-v1", ModelKind::Face, 4).unwrap();
    source
        .db
        .insert_detections(&[detection("f-1", a, vectors[0].clone())])
        .unwrap();
    source.db.mark_processed(a, "faces-v1", 1).unwrap();
    source.db.mark_processed(b, "faces-v1", 0).unwrap();

    source
        .db
        .insert_object_detections(&[ObjectDetection {
            detection_id: "o-1".to_string(),
            image_id: b,
            model_name: "yolo".to_string(),
            label: "laptop".to_string(),
            confidence: 0.8,
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
            },
        }])
        .unwrap();
    source.db.mark_objects_processed(a, "yolo", 0).unwrap();
    source.db.mark_objects_processed(b, "yolo", 1).unwrap();
    source
}

#[test]
fn copy_store_moves_everything_and_is_replayable() {
    let source = populated_source();
    let target = TestArchive::new();

    let report = target.db.copy_from_store(&source.db_path(), CopyPlan::all()).unwrap();
    assert_eq!(report.models, 2);
    assert_eq!(report.images, 2);
    assert_eq!(report.embeddings, 2);
    assert_eq!(report.faces, 1);
    assert_eq!(report.ledger, 2);
    assert_eq!(report.objects, 1);
    assert_eq!(report.object_ledger, 2);

    let objects = target.db.objects_for_image(2, "yolo").unwrap();
    assert_eq!(objects[0].detection_id, "o-1");
    assert!(target.db.pending_object_images("yolo").unwrap().is_empty());

    let face = target.db.face_by_id("f-1").unwrap().unwrap();
    assert_eq!(face.landmark, Some(vec![[5.0, 6.0], [7.0, 8.0]]));
    assert_eq!(face.age, Some(31));
    assert!(target.db.pending_face_images("faces-v1").unwrap().is_empty());
    assert_eq!(
        target.db.vector_for(1, "img").unwrap(),
        source.db.vector_for(1, "img").unwrap()
    );

    let replay = target.db.copy_from_store(&source.db_path(), CopyPlan::all()).unwrap();
    assert_eq!(replay.images, 0);
    assert_eq!(replay.embeddings, 0);
    assert_eq!(replay.faces, 0);
    assert_eq!(replay.ledger, 0);
    assert_eq!(replay.objects, 0);
    assert_eq!(replay.object_ledger, 0);
}

#[test]
fn copy_of_dependents_without_images_fails_and_rolls_back() {
    let source = populated_source();
    let target = TestArchive::new();

    let plan = CopyPlan {
        images: false,
        embeddings: true,
        faces: true,
        objects: true,
    };
    assert!(target.db.copy_from_store(&source.db_path(), plan).is_err());

    assert_eq!(target.db.count_images().unwrap(), 0);
    assert!(target.db.models().unwrap().is_empty());

    // The store is usable and detached afterwards
    let report = target.db.copy_from_store(&source.db_path(), CopyPlan::all()).unwrap();
    assert_eq!(report.images, 2);
}

#[test]
fn copy_rejects_conflicting_model_declaration() {
    let source = populated_source();
    let target = TestArchive::new();
    target.db.declare_model("img", ModelKind::Image, 8).unwrap();

    let err = target
        .db
        .copy_from_store(&source.db_path(), CopyPlan::all())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::ModelConflict { .. })
    ));
    assert_eq!(target.db.count_images().unwrap(), 0);
}

#[test]
fn store_reopens_with_data_intact() {
    let archive = TestArchive::new();
    let id = archive.add_image("a.jpg", "G", 2024);
    archive.db.declare_model("img", ModelKind::Image, 2).unwrap();
    archive.db.insert_vectors(&[id], &[vec![0.6, 0.8]], "img").unwrap();

    let reopened = Database::open(&archive.db_path()).unwrap();
    reopened.initialize().unwrap();
    assert_eq!(reopened.vector_for(id, "img").unwrap(), Some(vec![0.6, 0.8]));
    assert_eq!(reopened.model_spec("img").unwrap().unwrap().dim, 2);
}
