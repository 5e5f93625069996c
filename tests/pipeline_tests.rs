//! Integration tests for the front half of the pipeline
//!
//! Coverage:
//! - annotation files: load, membership, clear, merging several files
//! - numbering: determinism across runs, JSON persistence, source dumps
//! - runtime functions named in an annotation file are never numbered
//! - instrumenting an unnumbered module is rejected

use pmtrace::annotation::AnnotationSet;
use pmtrace::instrument::{InstrumentConfig, Instrumenter};
use pmtrace::ir::Module;
use pmtrace::numbering::{number_module, strip_numbering, NumberingOptions, ProgramPoints};
use std::fs;
use tempfile::TempDir;

const FIXTURE: &str = include_str!("fixtures/nova_mini.json");

fn fixture() -> Module {
    Module::from_json_str(FIXTURE).unwrap()
}

#[test]
fn test_annotation_file_membership_and_clear() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("funcs.txt");
    fs::write(&path, "foo\nbar\n").unwrap();

    let mut set = AnnotationSet::new();
    assert_eq!(set.load(&path), 2);
    assert!(set.contains("foo"));
    assert!(set.contains("bar"));
    assert!(!set.contains("baz"));

    set.clear();
    assert!(!set.contains("foo"));
    assert!(set.is_empty());
}

#[test]
fn test_annotation_files_merge_and_missing_file_ignored() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    fs::write(&a, "nova_write\nnova_read\n").unwrap();
    fs::write(&b, "nova_read\nnova_fsync\n").unwrap();

    let set = AnnotationSet::from_files(&[a, dir.path().join("missing.txt"), b]);
    assert_eq!(set.len(), 3);
    assert!(set.contains("nova_fsync"));
    assert!(!set.contains("NOVA_WRITE"));
}

#[test]
fn test_numbering_is_deterministic() {
    let mut first = fixture();
    let mut second = fixture();
    let options = NumberingOptions::default();
    let report = number_module(&mut first, &AnnotationSet::new(), &options).unwrap();
    number_module(&mut second, &AnnotationSet::new(), &options).unwrap();

    assert_eq!(report.points, 5);
    assert_eq!(report.blocks, 3);
    assert_eq!(first.numbering, second.numbering);
    assert_eq!(first.to_json_string().unwrap(), second.to_json_string().unwrap());
}

#[test]
fn test_numbering_survives_serialization() {
    let mut module = fixture();
    number_module(&mut module, &AnnotationSet::new(), &NumberingOptions::default()).unwrap();
    let reloaded = Module::from_json_str(&module.to_json_string().unwrap()).unwrap();
    assert_eq!(reloaded.numbering, module.numbering);

    let points = ProgramPoints::from_module(&reloaded).unwrap();
    assert_eq!(points.len(), 5);
    let store = points.instruction_of(2).unwrap();
    assert_eq!(points.id_of(store), Some(2));
    assert_eq!(points.block_id("init_module", "entry"), Some(2));
}

#[test]
fn test_numbering_dumps_sources() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("points.txt");
    let mut module = fixture();
    let options = NumberingOptions {
        dump_sources: Some(dump.clone()),
    };
    number_module(&mut module, &AnnotationSet::new(), &options).unwrap();

    let text = fs::read_to_string(&dump).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "1:inode.c:10",
            "2:inode.c:11",
            "3:super.c:40",
            "4:super.c:41",
            "5:super.c:42"
        ]
    );
}

#[test]
fn test_runtime_functions_not_numbered() {
    let mut module = fixture();
    let runtime_funcs = AnnotationSet::from_names(["dax_direct_access"]);
    let report =
        number_module(&mut module, &runtime_funcs, &NumberingOptions::default()).unwrap();
    assert_eq!(report.points, 4);
}

#[test]
fn test_numbering_twice_and_strip() {
    let mut module = fixture();
    number_module(&mut module, &AnnotationSet::new(), &NumberingOptions::default()).unwrap();
    assert!(number_module(&mut module, &AnnotationSet::new(), &NumberingOptions::default())
        .is_err());
    assert!(strip_numbering(&mut module));
    assert!(!strip_numbering(&mut module));
    assert_eq!(module, fixture());
}

#[test]
fn test_instrumenting_unnumbered_module_fails() {
    let mut module = fixture();
    let mut engine = Instrumenter::new(InstrumentConfig::default()).unwrap();
    assert!(engine.run(&mut module).is_err());
}
