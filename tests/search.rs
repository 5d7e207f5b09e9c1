mod common;

use proptest::prelude::*;
use std::collections::HashSet;

use common::{
    face, memory_store, normalize, object, random_unit_vectors, FakeDetector, FakeEmbedder,
    FakeObjectDetector, TestArchive,
};
use eventlens::config::{IndexingConfig, SearchConfig};
use eventlens::db::{cosine_similarity, Database, ModelKind, NewImage};
use eventlens::error::StoreError;
use eventlens::indexing::{EmbeddingIndexer, FaceIndexer, IndexOptions, ObjectIndexer};
use eventlens::search::SearchEngine;

const GROUPS: [(&str, i32); 3] = [
    ("PyCon JP 2023", 2023),
    ("PyCon JP 2024", 2024),
    ("PyCon APAC 2024", 2024),
];

/// In-memory store with `count` images spread over three groups and one
/// random vector each.
fn seeded_store(count: usize, dim: usize, seed: u64) -> (Database, Vec<Vec<f32>>) {
    let db = memory_store();
    db.declare_model("img", ModelKind::Image, dim).unwrap();

    let images: Vec<NewImage> = (0..count)
        .map(|i| {
            let (group, year) = GROUPS[i % GROUPS.len()];
            NewImage::new(format!("https://x/{}", i), group, year).with_storage_path(format!("{}.jpg", i))
        })
        .collect();
    db.register_images(&images).unwrap();

    let vectors = random_unit_vectors(seed, count, dim);
    let ids: Vec<i64> = (1..=count as i64).collect();
    db.insert_vectors(&ids, &vectors, "img").unwrap();
    (db, vectors)
}

#[test]
fn every_image_finds_itself_first() {
    let (db, _) = seeded_store(20, 32, 11);
    let engine = SearchEngine::new(&db, SearchConfig::default());

    for id in 1..=20 {
        let page = engine
            .find_similar_to_image(id, "img", 5, 0, None)
            .unwrap()
            .unwrap();
        assert_eq!(page.hits[0].image.id, id);
        assert!(page.hits[0].score >= 0.99);
        assert!(page.has_more);
    }
}

#[test]
fn three_images_end_to_end_at_768_dimensions() {
    let archive = TestArchive::new();
    let names = ["keynote.jpg", "hallway.jpg", "sprint.jpg"];
    for name in names {
        archive.add_image(name, "PyCon JP 2025", 2025);
    }
    let vectors = random_unit_vectors(2025, 3, 768);
    let embedder = names
        .iter()
        .zip(vectors.iter().cloned())
        .fold(FakeEmbedder::new("siglip-test", 768), |e, (n, v)| e.with_vector(n, v));

    let options = IndexOptions::new(archive.data_dir(), &IndexingConfig::default());
    EmbeddingIndexer::new(&archive.db, &embedder).run(&options, None).unwrap();

    let engine = SearchEngine::new(&archive.db, SearchConfig::default());
    let page = engine.search_by_vector(&vectors[1], "siglip-test", 10, 0, None).unwrap();

    assert_eq!(page.hits.len(), 3);
    assert!(!page.has_more);
    assert_eq!(page.hits[0].image.storage_path.as_deref(), Some("hallway.jpg"));
    assert!((page.hits[0].score - 1.0).abs() < 1e-5);

    for hit in &page.hits {
        let index = names
            .iter()
            .position(|n| Some(*n) == hit.image.storage_path.as_deref())
            .unwrap();
        let expected = cosine_similarity(&vectors[1], &vectors[index]);
        assert!((hit.score - expected).abs() < 1e-5);
    }
    assert!(page.hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn query_vector_is_normalized_at_search_time() {
    let (db, vectors) = seeded_store(6, 16, 5);
    let engine = SearchEngine::new(&db, SearchConfig::default());

    let scaled: Vec<f32> = vectors[2].iter().map(|x| x * 7.5).collect();
    let page = engine.search_by_vector(&scaled, "img", 1, 0, None).unwrap();
    assert_eq!(page.hits[0].image.id, 3);
    assert!((page.hits[0].score - 1.0).abs() < 1e-5);
}

#[test]
fn group_filter_restricts_results() {
    let (db, vectors) = seeded_store(30, 16, 9);
    let engine = SearchEngine::new(&db, SearchConfig::default());
    let groups = vec!["PyCon JP 2024".to_string(), "PyCon APAC 2024".to_string()];

    let page = engine
        .search_by_vector(&vectors[0], "img", 100, 0, Some(groups.as_slice()))
        .unwrap();
    assert_eq!(page.hits.len(), 20);
    assert!(page.hits.iter().all(|h| groups.contains(&h.image.group_name)));

    let unfiltered = engine
        .search_by_vector(&vectors[0], "img", 100, 0, Some(&[][..]))
        .unwrap();
    assert_eq!(unfiltered.hits.len(), 30);

    let unknown = vec!["No such event".to_string()];
    let none = engine
        .search_by_vector(&vectors[0], "img", 100, 0, Some(unknown.as_slice()))
        .unwrap();
    assert!(none.hits.is_empty());
    assert!(!none.has_more);
}

#[test]
fn unknown_model_and_bad_query_dimension_are_errors() {
    let (db, _) = seeded_store(3, 8, 1);
    let engine = SearchEngine::new(&db, SearchConfig::default());

    let err = engine.search_by_vector(&[1.0; 8], "other", 5, 0, None).unwrap_err();
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::UnknownModel(_))));

    let err = engine.search_by_vector(&[1.0; 4], "img", 5, 0, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DimensionMismatch { .. })
    ));
}

#[test]
fn similar_to_unembedded_image_is_none() {
    let (db, _) = seeded_store(3, 8, 1);
    db.register_image(&NewImage::new("https://x/new", "G", 2024).with_storage_path("new.jpg"))
        .unwrap();
    let engine = SearchEngine::new(&db, SearchConfig::default());

    assert!(engine.find_similar_to_image(4, "img", 5, 0, None).unwrap().is_none());
}

#[test]
fn text_and_image_file_queries_use_the_embedder() {
    let archive = TestArchive::new();
    archive.add_image("a.jpg", "G", 2024);
    archive.add_image("b.jpg", "G", 2024);

    let a = normalize(vec![1.0, 0.1, 0.0]);
    let b = normalize(vec![0.0, 1.0, 0.2]);
    let embedder = FakeEmbedder::new("clip-test", 3)
        .with_vector("a.jpg", a.clone())
        .with_vector("b.jpg", b.clone())
        .with_vector("probe.jpg", b.clone())
        .with_text("people on stage", a.clone());

    let options = IndexOptions::new(archive.data_dir(), &IndexingConfig::default());
    EmbeddingIndexer::new(&archive.db, &embedder).run(&options, None).unwrap();

    let engine = SearchEngine::new(&archive.db, SearchConfig::default());
    let by_text = engine
        .search_by_text(&embedder, "people on stage", 1, 0, None)
        .unwrap();
    assert_eq!(by_text.hits[0].image.id, 1);
    assert!(by_text.has_more);

    let probe = archive.root.path().join("probe.jpg");
    std::fs::write(&probe, b"probe").unwrap();
    let by_image = engine.search_by_image_file(&embedder, &probe, 1, 0, None).unwrap();
    assert_eq!(by_image.hits[0].image.id, 2);
}

#[test]
fn browsing_passthroughs() {
    let (db, _) = seeded_store(6, 4, 3);
    let engine = SearchEngine::new(&db, SearchConfig::default());

    assert_eq!(
        engine.group_names().unwrap(),
        vec!["PyCon APAC 2024", "PyCon JP 2023", "PyCon JP 2024"]
    );
    assert_eq!(engine.group_years().unwrap(), vec![2024, 2023]);
    assert_eq!(engine.list_images(&Default::default()).unwrap().len(), 6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pages_are_disjoint_and_follow_the_full_ranking(limit in 1usize..8, seed in 0u64..1000) {
        let (db, vectors) = seeded_store(25, 8, seed);
        let engine = SearchEngine::new(&db, SearchConfig::default());
        let query = &vectors[(seed % 25) as usize];

        let full = engine.search_by_vector(query, "img", 25, 0, None).unwrap();
        prop_assert!(!full.has_more);

        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        let mut offset = 0;
        loop {
            let page = engine.search_by_vector(query, "img", limit, offset, None).unwrap();
            for hit in &page.hits {
                prop_assert!(seen.insert(hit.image.id));
                collected.push(hit.image.id);
            }
            prop_assert_eq!(page.has_more, offset + limit < 25);
            if !page.has_more {
                break;
            }
            offset += limit;
        }

        let expected: Vec<i64> = full.hits.iter().map(|h| h.image.id).collect();
        prop_assert_eq!(collected, expected);
    }
}

// ============================================================================
// Faces
// ============================================================================

#[test]
fn face_search_returns_one_entry_per_image_with_its_best_face() {
    let archive = TestArchive::new();
    let group_photo = archive.add_image("group.jpg", "PyCon JP 2024", 2024);
    let portrait = archive.add_image("portrait.jpg", "PyCon JP 2024", 2024);
    let other_year = archive.add_image("2023.jpg", "PyCon JP 2023", 2023);

    let person = normalize(vec![1.0, 0.0, 0.0, 0.0]);
    let near = normalize(vec![0.9, 0.1, 0.0, 0.0]);
    let stranger = normalize(vec![0.0, 0.0, 1.0, 0.0]);

    let detector = FakeDetector::new("faces-test", 4)
        .with_faces(
            "group.jpg",
            vec![face(near.clone(), 0.95), face(stranger.clone(), 0.9), face(person.clone(), 0.7)],
        )
        .with_faces("portrait.jpg", vec![face(near.clone(), 0.99)])
        .with_faces("2023.jpg", vec![face(person.clone(), 0.99)]);
    let options = IndexOptions::new(archive.data_dir(), &IndexingConfig::default());
    FaceIndexer::new(&archive.db, &detector).run(&options, None).unwrap();

    let engine = SearchEngine::new(&archive.db, SearchConfig::default());
    let hits = engine.search_by_face_vector(&person, "faces-test", 10, None).unwrap();

    let images: Vec<i64> = hits.iter().map(|h| h.image.id).collect();
    assert_eq!(images, vec![group_photo, other_year, portrait]);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert!((hits[1].score - 1.0).abs() < 1e-5);
    assert_eq!(hits[0].face.embedding, person);

    let only_2023 = vec!["PyCon JP 2023".to_string()];
    let filtered = engine
        .search_by_face_vector(&person, "faces-test", 10, Some(only_2023.as_slice()))
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].image.id, other_year);

    let top_one = engine.search_by_face_vector(&person, "faces-test", 1, None).unwrap();
    assert_eq!(top_one.len(), 1);
    assert_eq!(top_one[0].image.id, group_photo);
}

#[test]
fn same_person_seeds_from_a_stored_face() {
    let archive = TestArchive::new();
    let a = archive.add_image("a.jpg", "G", 2024);
    let b = archive.add_image("b.jpg", "G", 2024);
    archive.add_image("c.jpg", "G", 2024);

    let vectors = random_unit_vectors(77, 3, 16);
    let detector = FakeDetector::new("faces-test", 16)
        .with_faces("a.jpg", vec![face(vectors[0].clone(), 0.9)])
        .with_faces("b.jpg", vec![face(vectors[0].clone(), 0.8)])
        .with_faces("c.jpg", vec![face(vectors[2].clone(), 0.9)]);
    let options = IndexOptions::new(archive.data_dir(), &IndexingConfig::default());
    FaceIndexer::new(&archive.db, &detector).run(&options, None).unwrap();

    let engine = SearchEngine::new(&archive.db, SearchConfig::default());
    let seed = engine.faces_in_image(a, "faces-test").unwrap().remove(0);

    let hits = engine.find_same_person(&seed.face_id, 2, None).unwrap().unwrap();
    let images: Vec<i64> = hits.iter().map(|h| h.image.id).collect();
    assert_eq!(images, vec![a, b]);
    assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-5));

    assert!(engine.find_same_person("not-a-face", 2, None).unwrap().is_none());
}

#[test]
fn label_lookup_after_object_run() {
    let archive = TestArchive::new();
    let a = archive.add_image("a.jpg", "PyCon JP 2023", 2023);
    let b = archive.add_image("b.jpg", "PyCon JP 2024", 2024);
    archive.add_image("c.jpg", "PyCon JP 2024", 2024);
    let detector = FakeObjectDetector::new("yolo-test")
        .with_objects("a.jpg", vec![object("laptop", 0.9), object("person", 0.8)])
        .with_objects("b.jpg", vec![object("laptop", 0.3)]);

    ObjectIndexer::new(&archive.db, &detector)
        .run(&IndexOptions::new(archive.data_dir(), &IndexingConfig::default()), None)
        .unwrap();

    let engine = SearchEngine::new(&archive.db, SearchConfig::default());
    let ids = |min: f32, groups: Option<&[String]>| -> Vec<i64> {
        engine
            .images_with_label("yolo-test", "laptop", min, groups)
            .unwrap()
            .into_iter()
            .map(|image| image.id)
            .collect()
    };
    assert_eq!(ids(0.0, None), vec![a, b]);
    assert_eq!(ids(0.5, None), vec![a]);

    let groups = vec!["PyCon JP 2024".to_string()];
    assert_eq!(ids(0.0, Some(groups.as_slice())), vec![b]);
    assert_eq!(ids(0.0, Some(&[][..])), vec![a, b]);

    let labels = engine.object_labels("yolo-test", 0.0).unwrap();
    assert_eq!(labels[0].label, "laptop");
    assert_eq!(labels[0].images, 2);
    assert_eq!(engine.objects_in_image(a, "yolo-test").unwrap().len(), 2);
}
