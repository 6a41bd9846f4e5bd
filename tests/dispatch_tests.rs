mod common;

use common::{make_job, test_config, FakeConnector};
use predqd::config::ServerKind;
use predqd::dispatch::Dispatcher;
use predqd::error::QdError;
use predqd::nodes::NodePool;
use predqd::store::{CacheStore, SetKind, Tag};

/// Put a complete topcons-style entry into the cache for `sequence`.
fn seed_cache(cache: &CacheStore, sequence: &str) -> String {
    let key = CacheStore::key(sequence, None);
    let dir = cache.dir_path(&key);
    std::fs::create_dir_all(dir.join("Topcons")).unwrap();
    std::fs::write(dir.join("Topcons/topcons.top"), "iiMMMMiii").unwrap();
    key
}

#[tokio::test]
async fn cache_hits_resolve_without_submission() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), ServerKind::Topcons2);
    let cache = CacheStore::new(cfg.cache_root.clone());
    let connector = FakeConnector::default();

    let store = make_job(&cfg, "rst_a", &[("one", "MKTAYIAK"), ("two", "GGGGG")], "", "");
    seed_cache(&cache, "MKTAYIAK");

    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);
    dispatcher.submit_job("rst_a", &mut pool, 2).await.unwrap();

    assert_eq!(store.read_set(SetKind::Finished), [0].into_iter().collect());
    assert_eq!(store.read_order(), vec![1]);
    assert!(store.has_tag(Tag::CacheDone));
    assert!(store.has_tag(Tag::Initialized));
    assert!(store.has_tag(Tag::Started));
    assert!(store.read_remote_queue().is_empty());

    // The cached copy got this job's annotation back.
    let seq_fa = std::fs::read_to_string(store.seq_dir(0).join("seq.fa")).unwrap();
    assert!(seq_fa.starts_with(">one\n"));
    let records = std::fs::read_to_string(store.output_dir().join("finished_seqs.txt")).unwrap();
    assert!(records.contains("cached"));
}

#[tokio::test]
async fn cache_scan_checkpoints_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path(), ServerKind::Topcons2);
    cfg.max_cache_per_pass = 1;
    let cache = CacheStore::new(cfg.cache_root.clone());
    let connector = FakeConnector::default();

    let store = make_job(
        &cfg,
        "rst_b",
        &[("s0", "AAAAAAA"), ("s1", "CCCCCCC"), ("s2", "DDDDDDD")],
        "",
        "",
    );
    seed_cache(&cache, "AAAAAAA");
    seed_cache(&cache, "DDDDDDD");

    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);

    // First pass: one hit processed, then the scan yields.
    dispatcher.submit_job("rst_b", &mut pool, 3).await.unwrap();
    assert_eq!(store.read_set(SetKind::Finished), [0].into_iter().collect());
    assert!(!store.has_tag(Tag::CacheDone));
    assert!(!store.has_tag(Tag::Initialized));
    assert_eq!(store.read_cache_checkpoint(), Some(0));

    // Second pass resumes past the checkpoint and completes the scan.
    dispatcher.submit_job("rst_b", &mut pool, 3).await.unwrap();
    assert_eq!(
        store.read_set(SetKind::Finished),
        [0, 2].into_iter().collect()
    );
    assert!(store.has_tag(Tag::CacheDone));
    assert!(store.has_tag(Tag::Initialized));
    assert_eq!(store.read_order(), vec![1]);
}

#[tokio::test]
async fn submission_respects_node_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path(), ServerKind::Topcons2);
    cfg = cfg.with_node("n1:50051", 3);
    let cache = CacheStore::new(cfg.cache_root.clone());
    let (connector, node) = FakeConnector::single("n1:50051");

    let seqs: Vec<(String, String)> = (0..5).map(|i| (format!("s{}", i), "MKT".into())).collect();
    let seq_refs: Vec<(&str, &str)> = seqs.iter().map(|(a, s)| (a.as_str(), s.as_str())).collect();
    let store = make_job(&cfg, "rst_c", &seq_refs, "", "");

    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);
    pool.begin_pass();
    // Another job already took one slot this pass.
    pool.slots_mut()[0].accept();

    dispatcher.submit_job("rst_c", &mut pool, 5).await.unwrap();

    // capacity 3 minus 1 pre-accepted = 2 submissions.
    assert_eq!(node.state().submissions.len(), 2);
    assert_eq!(pool.slots()[0].accepted(), 3);
    let queue = store.read_remote_queue();
    assert_eq!(queue.len(), 2);
    assert_eq!(store.read_order().len(), 3);
    // The ordered head of the list went out first.
    let submitted: Vec<usize> = queue.iter().map(|t| t.index).collect();
    assert_eq!(submitted, vec![0, 1]);
}

#[tokio::test]
async fn rerun_after_full_submission_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path(), ServerKind::Topcons2);
    cfg = cfg.with_node("n1:50051", 10);
    let cache = CacheStore::new(cfg.cache_root.clone());
    let (connector, node) = FakeConnector::single("n1:50051");

    let store = make_job(&cfg, "rst_d", &[("a", "MKT"), ("b", "GGG")], "", "");
    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);

    let mut pool = NodePool::from_config(&cfg.nodes);
    pool.begin_pass();
    dispatcher.submit_job("rst_d", &mut pool, 2).await.unwrap();
    assert_eq!(node.state().submissions.len(), 2);
    assert!(store.read_order().is_empty());
    let finished_before = store.read_set(SetKind::Finished);

    // A fresh pass over the same job changes nothing.
    pool.begin_pass();
    dispatcher.submit_job("rst_d", &mut pool, 2).await.unwrap();
    assert_eq!(node.state().submissions.len(), 2);
    assert_eq!(store.read_remote_queue().len(), 2);
    assert_eq!(store.read_set(SetKind::Finished), finished_before);
}

#[tokio::test]
async fn unreachable_node_goes_offline_for_the_pass() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path(), ServerKind::Topcons2);
    cfg = cfg.with_node("down:50051", 5).with_node("up:50051", 5);
    let cache = CacheStore::new(cfg.cache_root.clone());
    let mut connector = FakeConnector::default();
    let down = connector.add("down:50051");
    down.state().reachable = false;
    let up = connector.add("up:50051");

    let store = make_job(&cfg, "rst_e", &[("a", "MKT"), ("b", "GGG")], "", "");
    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);
    pool.begin_pass();
    dispatcher.submit_job("rst_e", &mut pool, 2).await.unwrap();

    assert!(!pool.slots()[0].is_online());
    assert_eq!(up.state().submissions.len(), 2);
    assert!(store
        .read_remote_queue()
        .iter()
        .all(|t| t.node == "up:50051"));
}

#[tokio::test]
async fn repeated_rejection_becomes_failed_to_submit() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path(), ServerKind::Topcons2);
    cfg = cfg.with_node("n1:50051", 5);
    cfg.max_submit_try = 3;
    let cache = CacheStore::new(cfg.cache_root.clone());
    let (connector, node) = FakeConnector::single("n1:50051");
    node.state().accept = false;

    let store = make_job(&cfg, "rst_f", &[("a", "MKT")], "", "");
    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);
    pool.begin_pass();
    dispatcher.submit_job("rst_f", &mut pool, 1).await.unwrap();

    assert_eq!(node.state().submissions.len(), 3);
    // Dropped from the work list, but failed-to-submit is not a compute
    // failure: the repair path will reschedule it later.
    assert!(store.read_order().is_empty());
    assert!(store.read_set(SetKind::Failed).is_empty());
    assert!(store.read_remote_queue().is_empty());
}

#[tokio::test]
async fn zero_sequences_marks_the_job_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), ServerKind::Topcons2);
    let cache = CacheStore::new(cfg.cache_root.clone());
    let connector = FakeConnector::default();

    let store = make_job(&cfg, "rst_g", &[], "", "");
    let dispatcher = Dispatcher::new(&cfg, &cache, &connector);
    let mut pool = NodePool::from_config(&cfg.nodes);
    let err = dispatcher.submit_job("rst_g", &mut pool, 1).await;

    assert!(matches!(err, Err(QdError::EmptyQuery(_))));
    assert!(store.has_tag(Tag::Failed));
}
