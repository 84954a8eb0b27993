//! Resource index tests on a real directory tree
//!
//! Lookup order across search directories, re-validation of indexed paths
//! and the reverse lookup from a file to every handle that points at it.

use std::fs;
use std::path::Path;

use wpsr::error::ErrorKind;
use wpsr::resource_index::{ResourceHandle, ResourceIndex};

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, "data").unwrap();
}

// =============================================================================
// Registration and lookup
// =============================================================================

#[test]
fn test_first_search_directory_wins() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("site/table.csv"));
    touch(&dir.path().join("shared/table.csv"));

    let mut index = ResourceIndex::new();
    index.add_search_directory(dir.path().join("site"));
    index.add_search_directory(dir.path().join("shared"));
    index.add_search_directory(dir.path().join("site"));
    assert_eq!(index.search_directories().len(), 2);

    let handle = ResourceHandle::new("s", "table.csv");
    assert!(index.register_resources(std::slice::from_ref(&handle)));
    assert_eq!(index.resolve(&handle).unwrap(), dir.path().join("site/table.csv"));
}

#[test]
fn test_partial_registration_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("a.csv"));
    touch(&dir.path().join("nested/b.csv"));

    let mut index = ResourceIndex::new();
    index.add_search_directory(dir.path());
    let handles = [
        ResourceHandle::new("s", "a.csv"),
        ResourceHandle::new("s", "nested/b.csv"),
        ResourceHandle::new("s", "c.csv"),
    ];
    assert!(!index.register_resources(&handles));
    assert!(index.is_available(&handles[0]));
    assert!(index.is_available(&handles[1]));

    let err = index.resolve(&handles[2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(index.handles_for_script("s").len(), 2);
}

#[test]
fn test_absolute_names_bypass_search_path() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("elsewhere/lookup.csv");
    touch(&file);

    let mut index = ResourceIndex::new();
    let handle = ResourceHandle::private("s", file.to_str().unwrap());
    assert!(index.register_resources(std::slice::from_ref(&handle)));
    assert_eq!(index.resolve(&handle).unwrap(), file);
}

// =============================================================================
// Re-validation
// =============================================================================

#[test]
fn test_deleted_file_becomes_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("table.csv");
    touch(&file);

    let mut index = ResourceIndex::new();
    index.add_search_directory(dir.path());
    let handle = ResourceHandle::new("s", "table.csv");
    index.register_resources(std::slice::from_ref(&handle));
    assert!(index.resolve(&handle).is_ok());

    fs::remove_file(&file).unwrap();
    let err = index.resolve(&handle).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(!index.is_available(&handle));

    // Coming back makes it available again without re-registration
    touch(&file);
    assert!(index.is_available(&handle));
}

// =============================================================================
// Reverse lookup
// =============================================================================

#[test]
fn test_many_handles_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("shared.csv");
    touch(&file);

    let mut index = ResourceIndex::new();
    index.add_search_directory(dir.path());
    let first = ResourceHandle::new("alpha", "shared.csv");
    let second = ResourceHandle::new("beta", "shared.csv");
    let other = ResourceHandle::new("beta", "other.csv");
    touch(&dir.path().join("other.csv"));
    index.register_resources(&[first.clone(), second.clone(), other]);

    let by_absolute = index.referencing_handles(&file).unwrap();
    assert_eq!(by_absolute.into_iter().collect::<Vec<_>>(), vec![first.clone(), second.clone()]);

    let by_name = index.referencing_handles(Path::new("shared.csv")).unwrap();
    assert_eq!(by_name.len(), 2);
}

#[test]
fn test_reverse_lookup_of_unindexed_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("loose.csv");
    touch(&file);

    let index = ResourceIndex::new();
    assert!(index.referencing_handles(&file).unwrap().is_empty());
}

#[test]
fn test_reverse_lookup_of_missing_path_names_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut index = ResourceIndex::new();
    index.add_search_directory(dir.path());

    let missing = dir.path().join("gone.csv");
    let err = index.referencing_handles(&missing).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(err.to_string().contains("gone.csv"));
}
