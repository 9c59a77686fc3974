// End-to-end flows through the real segment fetcher against a local HTTP
// fixture: full HLS caching, proxy manifest rewriting, restart restore, and
// the progressive single-file variant.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use hls::Playlist;
use vcache_engine::{
    CacheEventHandler, CacheProxyConfig, DownloadError, DownloadTask, PROXY_PLAYLIST_NAME,
    TaskState,
};

#[derive(Default)]
struct Recorder {
    ready: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
    progress_percents: Mutex<Vec<u32>>,
    proxy_url: Mutex<Option<String>>,
}

impl CacheEventHandler for Recorder {
    fn on_cache_ready(&self, _source_url: &str, local_proxy_url: &str) {
        self.ready.fetch_add(1, Ordering::SeqCst);
        *self.proxy_url.lock() = Some(local_proxy_url.to_string());
    }

    fn on_cache_progress(
        &self,
        _source_url: &str,
        percent: u32,
        _cached_bytes: u64,
        _playlist: Option<Arc<Playlist>>,
    ) {
        self.progress_percents.lock().push(percent);
    }

    fn on_cache_finished(&self, _source_url: &str) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cache_failed(&self, _source_url: &str, _error: &DownloadError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn manifest(segments: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
    for i in 0..segments {
        text.push_str(&format!("#EXTINF:10,\nchunk_{i}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

#[tokio::test]
async fn hls_flow_caches_everything_and_publishes_a_rewritten_manifest() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let mut mocks = Vec::new();
    for i in 0..4 {
        mocks.push(
            server
                .mock("GET", format!("/video/chunk_{i}.ts").as_str())
                .with_status(200)
                .with_body(format!("segment-{i}"))
                .expect(1)
                .create_async()
                .await,
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CacheProxyConfig::new("127.0.0.1", 8090, dir.path()));
    let source_url = format!("{}/video/index.m3u8", server.url());
    let task = DownloadTask::hls(config.clone(), &source_url, &manifest(4))
        .await
        .unwrap();
    let handler = Arc::new(Recorder::default());

    task.start(handler.clone()).await.unwrap();
    wait_until("completion", || task.state() == TaskState::Completed).await;

    for mock in &mocks {
        mock.assert_async().await;
    }
    assert_eq!(handler.ready.load(Ordering::SeqCst), 1);
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    assert_eq!(handler.failed.load(Ordering::SeqCst), 0);

    // Percentages only ever grow and end at 100.
    let percents = handler.progress_percents.lock().clone();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let cache_dir = task.cache_dir();
    let namespace = CacheProxyConfig::cache_namespace(&source_url);
    let published = std::fs::read_to_string(cache_dir.join(PROXY_PLAYLIST_NAME)).unwrap();
    for i in 0..4 {
        assert_eq!(
            std::fs::read_to_string(cache_dir.join(format!("seg_{i}.ts"))).unwrap(),
            format!("segment-{i}")
        );
        assert!(published.contains(&format!("http://127.0.0.1:8090/{namespace}/seg_{i}.ts")));
    }
    assert!(!published.contains(&server.url()));
    assert_eq!(
        handler.proxy_url.lock().clone().unwrap(),
        format!("http://127.0.0.1:8090/{namespace}/{PROXY_PLAYLIST_NAME}")
    );
}

#[tokio::test]
async fn restart_restores_progress_without_refetching() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let mut mocks = Vec::new();
    for i in 0..3 {
        // Exactly one hit per segment across both task lifetimes.
        mocks.push(
            server
                .mock("GET", format!("/video/chunk_{i}.ts").as_str())
                .with_status(200)
                .with_body(format!("segment-{i}"))
                .expect(1)
                .create_async()
                .await,
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CacheProxyConfig::new("127.0.0.1", 8090, dir.path()));
    let source_url = format!("{}/video/index.m3u8", server.url());

    {
        let task = DownloadTask::hls(config.clone(), &source_url, &manifest(3))
            .await
            .unwrap();
        let handler = Arc::new(Recorder::default());
        task.start(handler).await.unwrap();
        wait_until("first run completion", || task.state() == TaskState::Completed).await;
    }

    // A new task for the same URL restores the persisted record and the
    // on-disk segments; starting it completes without network traffic.
    let task = DownloadTask::hls(config, &source_url, &manifest(3))
        .await
        .unwrap();
    let restored = task.record();
    assert!(restored.complete);
    assert_eq!(restored.cached_segments, 3);

    let handler = Arc::new(Recorder::default());
    task.start(handler.clone()).await.unwrap();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(handler.ready.load(Ordering::SeqCst), 1);
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);

    for mock in &mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn redirect_limit_on_a_segment_surfaces_failure_but_spares_siblings() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/video/chunk_0.ts")
        .with_status(200)
        .with_body("segment-0")
        .create_async()
        .await;
    // chunk_1 redirects forever; the hop bound fails it.
    for hop in 0..6 {
        let target = if hop == 0 {
            "/video/chunk_1.ts".to_string()
        } else {
            format!("/video/hop_{hop}")
        };
        server
            .mock("GET", target.as_str())
            .with_status(302)
            .with_header("location", &format!("{}/video/hop_{}", server.url(), hop + 1))
            .create_async()
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CacheProxyConfig::new("127.0.0.1", 8090, dir.path()));
    let source_url = format!("{}/video/index.m3u8", server.url());
    let task = DownloadTask::hls(config, &source_url, &manifest(2))
        .await
        .unwrap();
    let handler = Arc::new(Recorder::default());

    task.start(handler.clone()).await.unwrap();
    {
        let handler = handler.clone();
        let seg0 = task.cache_dir().join("seg_0.ts");
        wait_until("failure surfaced and sibling cached", move || {
            handler.failed.load(Ordering::SeqCst) >= 1 && seg0.is_file()
        })
        .await;
    }

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(handler.finished.load(Ordering::SeqCst), 0);
    assert!(!task.record().complete);
}

#[tokio::test]
async fn progressive_flow_serves_the_cached_file_directly() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/media/movie.mp4")
        .with_status(200)
        .with_body(vec![7u8; 2048])
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CacheProxyConfig::new("127.0.0.1", 8090, dir.path()));
    let source_url = format!("{}/media/movie.mp4", server.url());
    let task = DownloadTask::progressive(config, &source_url).await.unwrap();
    let handler = Arc::new(Recorder::default());

    task.start(handler.clone()).await.unwrap();
    wait_until("completion", || task.state() == TaskState::Completed).await;

    mock.assert_async().await;
    let cached = task.cache_dir().join("video.mp4");
    assert_eq!(std::fs::metadata(&cached).unwrap().len(), 2048);
    assert!(task.proxy_url().ends_with("/video.mp4"));
    assert_eq!(handler.ready.load(Ordering::SeqCst), 1);
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn encrypted_playlist_caches_the_key_alongside_segments() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/video/enc.key")
        .with_status(200)
        .with_body("0123456789abcdef")
        .create_async()
        .await;
    for i in 0..2 {
        server
            .mock("GET", format!("/video/chunk_{i}.ts").as_str())
            .with_status(200)
            .with_body(format!("segment-{i}"))
            .create_async()
            .await;
    }

    let text = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
                #EXT-X-KEY:METHOD=AES-128,URI=\"enc.key\",IV=0x0001\n\
                #EXTINF:10,\nchunk_0.ts\n#EXTINF:10,\nchunk_1.ts\n#EXT-X-ENDLIST\n";

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CacheProxyConfig::new("127.0.0.1", 8090, dir.path()));
    let source_url = format!("{}/video/index.m3u8", server.url());
    let task = DownloadTask::hls(config, &source_url, text).await.unwrap();
    let handler = Arc::new(Recorder::default());

    task.start(handler.clone()).await.unwrap();
    wait_until("completion", || task.state() == TaskState::Completed).await;

    let cache_dir = task.cache_dir();
    assert_eq!(
        std::fs::read_to_string(cache_dir.join(hls::LOCAL_KEY_FILE_NAME)).unwrap(),
        "0123456789abcdef"
    );
    let published = std::fs::read_to_string(cache_dir.join(PROXY_PLAYLIST_NAME)).unwrap();
    assert!(published.contains("#EXT-X-KEY:METHOD=AES-128"));
    assert!(published.contains("IV=0x0001"));
}
