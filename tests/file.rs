use std::fs;

use tagcache::{backend::FileBackend, format::PostcardFormatter, Cache, Error};

fn get_cache(dir: &tempfile::TempDir, compression: bool) -> Cache<FileBackend> {
    let backend = FileBackend::open(dir.path(), compression).unwrap();
    Cache::new(backend, PostcardFormatter, 600)
}

#[test]
fn test_basic_insert_delete() {
    for compression in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = get_cache(&dir, compression);
        let text = "lorem ipsum ".repeat(100);
        cache.set("foo", &text, None).unwrap();
        cache.set("asdf", &vec![1u8, 2, 3], Some(0)).unwrap();
        assert_eq!(cache.get("foo").unwrap(), Some(text));
        assert_eq!(cache.get("asdf").unwrap(), Some(vec![1u8, 2, 3]));

        assert!(cache.delete("foo").unwrap());
        assert!(!cache.delete("foo").unwrap());
        assert_eq!(cache.get::<String>("foo").unwrap(), None);
    }
}

#[test]
fn test_tags_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut cache = get_cache(&dir, true);
        cache.set_with_tags("a", &1, None, &["t"]).unwrap();
        cache.set_with_tags("b", &2, None, &["t", "u"]).unwrap();
    }

    let mut cache = get_cache(&dir, true);
    assert_eq!(cache.find_by_tag::<i32>("t").unwrap().len(), 2);
    assert!(cache.delete_tag("u").unwrap());
    assert_eq!(cache.get::<i32>("b").unwrap(), None);
    assert_eq!(cache.get("a").unwrap(), Some(1));
    cache.close().unwrap();

    let mut cache = get_cache(&dir, false);
    assert!(!cache.delete_tag("u").unwrap());
    assert_eq!(cache.find_by_tag::<i32>("t").unwrap().len(), 1);
}

#[test]
fn test_expired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = get_cache(&dir, false);
    cache.set("old", &1, Some(-5)).unwrap();
    cache.set("new", &2, None).unwrap();
    assert_eq!(cache.garbage_collect().unwrap(), 1);
    assert_eq!(cache.get::<i32>("old").unwrap(), None);
    assert_eq!(cache.get("new").unwrap(), Some(2));
}

#[test]
fn test_delete_all_keeps_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("README"), "keep me").unwrap();
    let mut cache = get_cache(&dir, false);
    cache.set("foo", &1, None).unwrap();
    cache.set_with_tags("bar", &2, None, &["t"]).unwrap();
    assert!(cache.delete_all().unwrap());
    assert_eq!(cache.get::<i32>("foo").unwrap(), None);
    assert!(cache.find_by_tag::<i32>("t").unwrap().is_empty());
    assert!(dir.path().join("README").exists());
}

#[test]
fn test_counters_are_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = get_cache(&dir, false);
    assert!(matches!(
        cache.set_counter("hits", 1, None),
        Err(Error::ArithmeticUnsupported)
    ));
}
