//! Needs a running server, e.g. `MEMCACHE_SERVER=memcache://127.0.0.1:11211 cargo test`. Skipped
//! if `MEMCACHE_SERVER` is not set.

use std::collections::BTreeMap;

use tagcache::{
    backend::MemcacheBackend, config::CacheConfig, format::PostcardFormatter, Cache, Error,
};

fn get_backend(namespace: &str, compression: bool) -> Option<MemcacheBackend> {
    let url = std::env::var("MEMCACHE_SERVER").ok()?;
    Some(
        MemcacheBackend::connect(
            vec![url],
            format!("tagcache-test:{namespace}"),
            compression,
            None,
        )
        .unwrap(),
    )
}

fn get_cache(namespace: &str) -> Option<Cache<MemcacheBackend>> {
    let mut cache = Cache::new(get_backend(namespace, true)?, PostcardFormatter, 20);
    cache.delete_all().unwrap();
    Some(cache)
}

#[test]
fn test_basic_insert_delete() {
    let Some(mut cache) = get_cache("test_basic_insert_delete") else {
        return;
    };
    let text = "lorem ipsum ".repeat(100);
    cache.set("foo", &text, None).unwrap();
    cache.set("never", &1, Some(0)).unwrap();
    cache.set("past", &2, Some(-1)).unwrap();
    assert_eq!(cache.get("foo").unwrap(), Some(text));
    assert_eq!(cache.get("never").unwrap(), Some(1));
    assert_eq!(cache.get::<i32>("past").unwrap(), None);
    cache.delete("foo").unwrap();
    assert_eq!(cache.get::<String>("foo").unwrap(), None);
}

#[test]
fn test_long_keys() {
    let Some(mut cache) = get_cache("test_long_keys") else {
        return;
    };
    let long = "k".repeat(400);
    cache.set(&long, &1, None).unwrap();
    assert_eq!(cache.get(&long).unwrap(), Some(1));
    assert_eq!(cache.get::<i32>(&"k".repeat(401)).unwrap(), None);
}

#[test]
fn test_tags_survive_reopen() {
    let Some(mut cache) = get_cache("test_tags_survive_reopen") else {
        return;
    };
    cache
        .set_with_tags("user:42", &"a".to_owned(), Some(60), &["users", "active"])
        .unwrap();
    cache.set_with_tags("user:7", &"b".to_owned(), None, &["users"]).unwrap();
    cache.close().unwrap();

    let Some(backend) = get_backend("test_tags_survive_reopen", false) else {
        return;
    };
    let mut cache = Cache::new(backend, PostcardFormatter, 20);
    assert_eq!(
        cache.find_by_tag::<String>("users").unwrap(),
        BTreeMap::from([
            ("user:42".to_owned(), "a".to_owned()),
            ("user:7".to_owned(), "b".to_owned()),
        ])
    );
    assert!(cache.delete_tag("active").unwrap());
    assert_eq!(cache.get::<String>("user:42").unwrap(), None);
    assert_eq!(cache.find_by_tag::<String>("users").unwrap().len(), 1);
}

#[test]
fn test_delete_all_is_namespaced() {
    let (Some(mut a), Some(mut b)) = (
        get_cache("test_delete_all_is_namespaced_a"),
        get_cache("test_delete_all_is_namespaced_b"),
    ) else {
        return;
    };
    a.set("foo", &1, None).unwrap();
    b.set("foo", &2, None).unwrap();
    a.delete_all().unwrap();
    assert_eq!(a.get::<i32>("foo").unwrap(), None);
    assert_eq!(b.get("foo").unwrap(), Some(2));
}

#[test]
fn test_delete_all_survives_lost_generation() {
    let namespace = "test_delete_all_survives_lost_generation";
    let Some(backend) = get_backend(namespace, false) else {
        return;
    };
    // what an LRU eviction of the generation key looks like to the cache
    let client = memcache::Client::connect(std::env::var("MEMCACHE_SERVER").unwrap()).unwrap();
    let evict = || {
        client
            .delete(&format!("tagcache-test:{namespace}:generation"))
            .unwrap();
    };

    evict();
    let mut cache = Cache::new(backend, PostcardFormatter, 20);
    cache.set("k", &1, None).unwrap();
    cache.delete_all().unwrap();
    evict();
    assert_eq!(cache.get::<i32>("k").unwrap(), None);

    cache.set("k", &2, None).unwrap();
    assert_eq!(cache.get("k").unwrap(), Some(2));
}

#[test]
fn test_counters() {
    let Some(mut cache) = get_cache("test_counters") else {
        return;
    };
    assert_eq!(cache.increment("hits", 1).unwrap(), None);
    cache.set_counter("hits", 3, None).unwrap();
    assert_eq!(cache.increment("hits", 2).unwrap(), Some(5));
    assert_eq!(cache.decrement("hits", 1).unwrap(), Some(4));
    assert_eq!(cache.get_counter("hits").unwrap(), Some(4));
    assert!(matches!(
        cache.set_counter("hits", -1, None),
        Err(Error::Store(_))
    ));
}

#[test]
fn test_servers_required() {
    assert!(matches!(
        Cache::from_config(&CacheConfig::new("memcache"), PostcardFormatter),
        Err(Error::Config(_))
    ));
}
