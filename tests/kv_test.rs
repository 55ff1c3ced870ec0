//! KV 存储集成测试

use flare_discovery::{
    KvProvider, KvStore, KvWatch, MemoryBackend, Registry, RegistryConfig, RegistryError,
};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use tokio::time::{Duration, sleep, timeout};

fn setup() -> (Arc<MemoryBackend>, KvStore) {
    let backend = Arc::new(MemoryBackend::new());
    let kv = KvStore::new(backend.clone(), &RegistryConfig::default());
    (backend, kv)
}

#[tokio::test(start_paused = true)]
async fn test_put_get_delete() {
    let (_backend, kv) = setup();

    kv.put("config/orders/limit", b"100").await.expect("put");
    assert_eq!(kv.get("config/orders/limit").await.expect("get"), b"100".to_vec());

    kv.put("config/orders/limit", b"200").await.expect("overwrite");
    assert_eq!(kv.get("config/orders/limit").await.expect("get"), b"200".to_vec());

    kv.delete("config/orders/limit").await.expect("delete");
    let err = kv.get("config/orders/limit").await.expect_err("deleted");
    assert_eq!(err, RegistryError::KeyNotFound("config/orders/limit".to_string()));
    assert!(err.is_not_found());

    // 重复删除不存在的键
    assert_ok!(kv.delete("config/orders/limit").await);
    assert_ok!(kv.delete("never/existed").await);
    assert_err!(kv.get("never/existed").await);
}

#[tokio::test(start_paused = true)]
async fn test_backend_errors_are_returned() {
    let (backend, kv) = setup();
    backend.set_unavailable(true);

    assert!(matches!(
        kv.put("k", b"v").await,
        Err(RegistryError::BackendUnavailable(_))
    ));
    assert!(matches!(
        kv.get("k").await,
        Err(RegistryError::BackendUnavailable(_))
    ));
    assert!(matches!(
        kv.delete("k").await,
        Err(RegistryError::BackendUnavailable(_))
    ));
}

/// 监听返回新值；键被删除后返回空结果且不报错；同时 get 返回 KeyNotFound
#[tokio::test(start_paused = true)]
async fn test_watch_value_and_deletion() {
    let (_backend, kv) = setup();
    kv.put("feature/flag", b"on").await.expect("put");

    let watcher = kv.watch("feature/flag").await.expect("watch");
    assert_eq!(watcher.key(), "feature/flag");

    kv.put("feature/flag", b"off").await.expect("put");
    let value = timeout(Duration::from_secs(120), watcher.next())
        .await
        .expect("changed")
        .expect("no error");
    assert_eq!(value, Some(b"off".to_vec()));

    kv.delete("feature/flag").await.expect("delete");
    let value = timeout(Duration::from_secs(120), watcher.next())
        .await
        .expect("changed")
        .expect("deletion is not an error");
    assert_eq!(value, None);

    assert!(matches!(
        kv.get("feature/flag").await,
        Err(RegistryError::KeyNotFound(_))
    ));
}

/// 阻塞查询在等待窗口内无变化时继续等待，不返回
#[tokio::test(start_paused = true)]
async fn test_watch_blocks_without_changes() {
    let (_backend, kv) = setup();
    kv.put("a", b"1").await.expect("put");
    let watcher = kv.watch("a").await.expect("watch");

    assert!(timeout(Duration::from_secs(300), watcher.next()).await.is_err());
}

/// stop 取消正在进行的阻塞查询
#[tokio::test(start_paused = true)]
async fn test_watch_stop_cancels_pending_next() {
    let (_backend, kv) = setup();
    kv.put("a", b"1").await.expect("put");
    let watcher = Arc::new(kv.watch("a").await.expect("watch"));

    let pending = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.next().await })
    };
    sleep(Duration::from_secs(5)).await;
    watcher.stop();
    watcher.stop();

    let result = pending.await.expect("join");
    assert_eq!(result, Err(RegistryError::Cancelled));
    assert_eq!(watcher.next().await, Err(RegistryError::Cancelled));
}

/// 注册中心关闭时 KV 监听一并取消
#[tokio::test(start_paused = true)]
async fn test_registry_shutdown_cancels_kv_watch() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new(backend.clone(), RegistryConfig::default());
    let kv = registry.kv();
    kv.put("a", b"1").await.expect("put");
    let watcher = kv.watch("a").await.expect("watch");

    registry.shutdown().await;
    assert_eq!(watcher.next().await, Err(RegistryError::Cancelled));
}

/// 通过 KvProvider trait 对象使用
#[tokio::test(start_paused = true)]
async fn test_kv_provider_trait_object() {
    let (_backend, kv) = setup();
    let provider: Box<dyn KvProvider> = Box::new(kv);

    provider.put("x", b"42").await.expect("put");
    assert_eq!(provider.get("x").await.expect("get"), b"42".to_vec());

    let watcher = provider.watch("x").await.expect("watch");
    provider.delete("x").await.expect("delete");
    let value = timeout(Duration::from_secs(60), watcher.next())
        .await
        .expect("changed")
        .expect("no error");
    assert_eq!(value, None);
    assert!(watcher.stop().is_ok());
}
