use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

pub fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(relative)
}

pub fn load_fixture(relative: &str) -> String {
    fs::read_to_string(fixture_path(relative))
        .unwrap_or_else(|_| panic!("Failed to load fixture: {}", relative))
}

/// Copy the shareholder-list fixtures into `dest`, returning how many were copied
pub fn copy_documents(dest: &Path) -> usize {
    fs::create_dir_all(dest).unwrap();
    let mut copied = 0;
    for entry in fs::read_dir(fixture_path("documents")).unwrap().flatten() {
        let path = entry.path();
        if path.is_file() {
            fs::copy(&path, dest.join(entry.file_name())).unwrap();
            copied += 1;
        }
    }
    copied
}

/// Uncompressed ZIP archive holding `entries` in order
pub fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
