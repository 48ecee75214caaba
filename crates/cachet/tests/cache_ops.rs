//! Core operation contracts: reads, writes, batches, numeric operations,
//! commands, and lifecycle.

mod common;

use cachet::{Cache, CacheConfig, Command, Error, Fetched, Key, Options, Value};
use futures::StreamExt;
use serde_json::json;

use common::{start_plain, unique_name};

#[test_log::test(tokio::test)]
async fn put_get_del_round_trip() {
    let cache = start_plain("ops").await;

    assert!(cache.put("k", json!("v"), Options::new()).await.expect("put"));
    assert_eq!(cache.get("k").await.expect("get"), Some(json!("v")));

    assert!(cache.del("k").await.expect("del"));
    assert_eq!(cache.get("k").await.expect("get"), None);
}

#[test_log::test(tokio::test)]
async fn put_overwrites_value_and_ttl() {
    let cache = start_plain("ops").await;

    cache
        .put("k", json!(1), Options::new().expire(60_000))
        .await
        .expect("put");
    cache.put("k", json!(2), Options::new()).await.expect("put");

    assert_eq!(cache.get("k").await.expect("get"), Some(json!(2)));
    // the second put carried no TTL, so the entry no longer expires
    assert_eq!(cache.ttl("k").await.expect("ttl"), None);
}

#[test_log::test(tokio::test)]
async fn integer_and_string_keys_coexist() {
    let cache = start_plain("ops").await;

    cache.put(2, json!("int"), Options::new()).await.expect("put");
    cache.put("2", json!("str"), Options::new()).await.expect("put");

    assert_eq!(cache.get(2).await.expect("get"), Some(json!("int")));
    assert_eq!(cache.get("2").await.expect("get"), Some(json!("str")));
}

#[test_log::test(tokio::test)]
async fn take_reads_and_deletes_atomically() {
    let cache = start_plain("ops").await;

    cache.put("k", json!("v"), Options::new()).await.expect("put");
    assert_eq!(cache.take("k").await.expect("take"), Some(json!("v")));
    assert_eq!(cache.take("k").await.expect("take"), None);
    assert_eq!(cache.get("k").await.expect("get"), None);
}

#[test_log::test(tokio::test)]
async fn update_preserves_ttl_and_reports_absence() {
    let cache = start_plain("ops").await;

    assert!(!cache.update("k", json!(9)).await.expect("update"));

    cache
        .put("k", json!(1), Options::new().expire(60_000))
        .await
        .expect("put");
    assert!(cache.update("k", json!(9)).await.expect("update"));
    assert_eq!(cache.get("k").await.expect("get"), Some(json!(9)));
    let ttl = cache.ttl("k").await.expect("ttl").expect("ttl should remain");
    assert!(ttl > 55_000, "update must not clear the TTL, got {ttl}");
}

#[test_log::test(tokio::test)]
async fn put_many_writes_every_pair() {
    let cache = start_plain("ops").await;

    assert!(cache
        .put_many(vec![("a", json!(1)), ("b", json!(2)), ("c", json!(3))], Options::new())
        .await
        .expect("put_many"));
    assert_eq!(cache.size().await.expect("size"), 3);
    assert_eq!(cache.get("b").await.expect("get"), Some(json!(2)));
}

#[test_log::test(tokio::test)]
async fn empty_put_many_is_a_no_op() {
    let cache = start_plain("ops").await;
    let pairs: Vec<(&str, Value)> = Vec::new();
    assert!(cache.put_many(pairs, Options::new()).await.expect("put_many"));
    assert_eq!(cache.size().await.expect("size"), 0);
}

#[test_log::test(tokio::test)]
async fn incr_decr_respect_defaults_and_types() {
    let cache = start_plain("ops").await;

    assert_eq!(cache.incr("n", 1, Options::new()).await.expect("incr"), 1);
    assert_eq!(cache.incr("n", 4, Options::new()).await.expect("incr"), 5);
    assert_eq!(cache.decr("n", 2, Options::new()).await.expect("decr"), 3);

    // missing key starts from the provided default
    assert_eq!(
        cache
            .incr("m", 1, Options::new().default_value(10))
            .await
            .expect("incr"),
        11
    );

    cache.put("s", json!("text"), Options::new()).await.expect("put");
    assert!(matches!(
        cache.incr("s", 1, Options::new()).await,
        Err(Error::NonNumericValue)
    ));
    // the non-numeric value is untouched
    assert_eq!(cache.get("s").await.expect("get"), Some(json!("text")));
}

#[test_log::test(tokio::test)]
async fn clear_returns_the_pre_clear_size() {
    let cache = start_plain("ops").await;
    cache
        .put_many(vec![("a", json!(1)), ("b", json!(2))], Options::new())
        .await
        .expect("put_many");

    assert_eq!(cache.clear().await.expect("clear"), 2);
    assert_eq!(cache.size().await.expect("size"), 0);
    assert!(cache.is_empty().await.expect("is_empty"));
}

#[test_log::test(tokio::test)]
async fn exists_and_keys_skip_nothing_live() {
    let cache = start_plain("ops").await;
    cache.put("a", json!(1), Options::new()).await.expect("put");
    cache.put(7, json!(2), Options::new()).await.expect("put");

    assert!(cache.exists("a").await.expect("exists"));
    assert!(!cache.exists("zzz").await.expect("exists"));

    let mut keys = cache.keys().await.expect("keys");
    keys.sort();
    let mut expected = vec![Key::from("a"), Key::from(7)];
    expected.sort();
    assert_eq!(keys, expected);
}

#[test_log::test(tokio::test)]
async fn stream_pages_through_live_entries() {
    let cache = start_plain("ops").await;
    for i in 0..40 {
        cache.put(i, json!(i), Options::new()).await.expect("put");
    }

    let entries: Vec<_> = cache
        .stream(Options::new().buffer(7))
        .await
        .expect("stream")
        .collect()
        .await;
    assert_eq!(entries.len(), 40);

    let mut values: Vec<i64> = entries
        .iter()
        .map(|entry| entry.value.as_i64().expect("numeric value"))
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..40).collect::<Vec<_>>());
}

#[test_log::test(tokio::test)]
async fn invoke_runs_read_and_write_commands() {
    let name = unique_name("ops");
    let cache = Cache::start(
        CacheConfig::builder(name)
            .command("last", Command::read(|value| {
                value.as_array().and_then(|items| items.last()).cloned().unwrap_or(Value::Null)
            }))
            .command("lpop", Command::write(|value| {
                let mut items = value.as_array().cloned().unwrap_or_default();
                if items.is_empty() {
                    (Value::Null, Value::Array(items))
                } else {
                    let head = items.remove(0);
                    (head, Value::Array(items))
                }
            }))
            .build(),
    )
    .await
    .expect("cache should start");

    cache.put("k", json!([1, 2, 3, 4]), Options::new()).await.expect("put");

    assert_eq!(cache.invoke("last", "k").await.expect("invoke"), json!(4));
    assert_eq!(cache.invoke("lpop", "k").await.expect("invoke"), json!(1));
    assert_eq!(cache.get("k").await.expect("get"), Some(json!([2, 3, 4])));

    assert!(matches!(
        cache.invoke("missing", "k").await,
        Err(Error::InvalidCommand)
    ));
}

#[test_log::test(tokio::test)]
async fn execute_batches_without_isolation() {
    let cache = start_plain("ops").await;
    let total = cache
        .execute(|handle| async move {
            handle.put("a", json!(1), Options::new()).await.expect("put");
            handle.put("b", json!(2), Options::new()).await.expect("put");
            handle.size().await.expect("size")
        })
        .await
        .expect("execute");
    assert_eq!(total, 2);
}

#[test_log::test(tokio::test)]
async fn get_and_update_commits_and_ignores() {
    let cache = start_plain("ops").await;
    cache.put("k", json!([1]), Options::new()).await.expect("put");

    let outcome = cache
        .get_and_update(
            "k",
            |current| {
                let mut items = current
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                items.push(json!(2));
                Value::Array(items)
            },
            Options::new(),
        )
        .await
        .expect("get_and_update");
    assert_eq!(outcome, Fetched::Commit(json!([1, 2])));

    let ignored = cache
        .get_and_update(
            "k",
            |current| {
                cachet::FallbackResult::ignore(current.cloned().unwrap_or(Value::Null))
            },
            Options::new(),
        )
        .await
        .expect("get_and_update");
    assert_eq!(ignored, Fetched::Ignore(json!([1, 2])));
    assert_eq!(cache.get("k").await.expect("get"), Some(json!([1, 2])));
}

#[test_log::test(tokio::test)]
async fn entry_exposes_raw_stamps_without_eviction() {
    let cache = start_plain("ops").await;

    cache
        .put("k", json!("v"), Options::new().expire(1))
        .await
        .expect("put");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // inspection sees the expired record and leaves it resident
    let entry = cache.entry("k").await.expect("entry").expect("raw entry");
    assert_eq!(entry.key, Key::from("k"));
    assert_eq!(entry.value, json!("v"));
    assert_eq!(entry.expiration, Some(1));
    assert!(entry.modified > 0);
    assert_eq!(cache.size().await.expect("size"), 1);
}

#[test_log::test(tokio::test)]
async fn stopped_caches_reject_operations() {
    let cache = start_plain("ops").await;
    assert!(cache.is_running().await);

    cache.stop().await.expect("stop");
    assert!(!cache.is_running().await);
    assert!(matches!(cache.get("k").await, Err(Error::NoCache)));
    assert!(matches!(cache.stop().await, Err(Error::NoCache)));
}

#[test_log::test(tokio::test)]
async fn duplicate_names_cannot_start_twice() {
    let name = unique_name("ops");
    let cache = Cache::start(CacheConfig::builder(name.clone()).build())
        .await
        .expect("cache should start");
    assert!(matches!(
        Cache::start(CacheConfig::builder(name).build()).await,
        Err(Error::AlreadyStarted)
    ));
    cache.stop().await.expect("stop");
}

#[test_log::test(tokio::test)]
async fn invalid_configurations_are_rejected() {
    assert!(matches!(
        Cache::start(CacheConfig::builder("").build()).await,
        Err(Error::InvalidName)
    ));
    assert!(matches!(
        Cache::start(CacheConfig::builder(unique_name("ops")).sweep_interval(0).build()).await,
        Err(Error::InvalidOption("expiration.interval"))
    ));
}
