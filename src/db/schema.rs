pub const SCHEMA: &str = r#"
-- Image catalog: one row per distinct source image
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_url TEXT NOT NULL UNIQUE,
    storage_path TEXT,                 -- relative to the data directory once downloaded
    external_photo_id TEXT UNIQUE,     -- provider-assigned id (e.g. Flickr photo id)
    collection_id TEXT,                -- album id
    collection_title TEXT,
    group_name TEXT NOT NULL,          -- event label, e.g. 'PyCon JP 2024'
    group_year INTEGER NOT NULL,
    group_kind TEXT NOT NULL DEFAULT 'conference',
    format TEXT,
    width INTEGER,
    height INTEGER,
    byte_size INTEGER,
    downloaded_at TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_images_group ON images(group_name, group_year);
CREATE INDEX IF NOT EXISTS idx_images_collection ON images(collection_id);

-- Declared vector spaces: one row per model identity string
CREATE TABLE IF NOT EXISTS vector_models (
    model_name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,                -- 'image' or 'face'
    dim INTEGER NOT NULL,
    declared_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Whole-image embeddings, one per (image, model)
CREATE TABLE IF NOT EXISTS image_embeddings (
    image_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    embedding BLOB NOT NULL,           -- little-endian f32 array
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (image_id, model_name),
    FOREIGN KEY (image_id) REFERENCES images(id),
    FOREIGN KEY (model_name) REFERENCES vector_models(model_name)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON image_embeddings(model_name);

-- Detected faces with their own recognition embeddings
CREATE TABLE IF NOT EXISTS face_detections (
    face_id TEXT PRIMARY KEY,
    image_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    bbox_x1 REAL NOT NULL,             -- pixel coordinates in the original image
    bbox_y1 REAL NOT NULL,
    bbox_x2 REAL NOT NULL,
    bbox_y2 REAL NOT NULL,
    det_score REAL NOT NULL,
    landmark TEXT,                     -- JSON array of [x, y] keypoints
    age INTEGER,
    gender TEXT,
    embedding BLOB NOT NULL,
    person_label TEXT,                 -- reserved for clustering
    cluster_id INTEGER,                -- reserved for clustering
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (image_id) REFERENCES images(id),
    FOREIGN KEY (model_name) REFERENCES vector_models(model_name)
);

CREATE INDEX IF NOT EXISTS idx_faces_image ON face_detections(image_id, model_name);
CREATE INDEX IF NOT EXISTS idx_faces_model ON face_detections(model_name);

-- Track which images have been scanned for faces (even if 0 faces found)
CREATE TABLE IF NOT EXISTS face_processed_images (
    image_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    face_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (image_id, model_name),
    FOREIGN KEY (image_id) REFERENCES images(id)
);

-- Labelled object boxes from a closed-set detector (COCO classes)
CREATE TABLE IF NOT EXISTS object_detections (
    detection_id TEXT PRIMARY KEY,
    image_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    bbox_x1 REAL NOT NULL,
    bbox_y1 REAL NOT NULL,
    bbox_x2 REAL NOT NULL,
    bbox_y2 REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (image_id) REFERENCES images(id)
);

CREATE INDEX IF NOT EXISTS idx_objects_image ON object_detections(image_id, model_name);
CREATE INDEX IF NOT EXISTS idx_objects_label ON object_detections(model_name, label);

CREATE TABLE IF NOT EXISTS object_processed_images (
    image_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    object_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (image_id, model_name),
    FOREIGN KEY (image_id) REFERENCES images(id)
);
"#;
