use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

use netqueue::image::{
    BoundedImageCache, IMAGE_REQUEST_TAG, ImageConfig, ImageLoader, ImagePerformanceProfile, ImageSlot, image_cache_key,
};
use netqueue::{
    Dispatcher, DispatcherConfig, RequestError, Transport, TransportError, TransportRequest, TransportResponse,
};

fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_fn(width, height, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 128u8, 255u8]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encode failed");
    bytes
}

/// 按地址返回固定尺寸的 PNG；`missing` 结尾的地址返回 404。
struct ImageServer {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    delay: Duration,
}

impl ImageServer {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ImageServer {
    async fn execute(&self, request: TransportRequest, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen lock poisoned").push(request.url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if request.url.ends_with("missing") {
            return Ok(TransportResponse::new(404, ""));
        }
        let (width, height) = if request.url.ends_with("tall.png") { (32, 64) } else { (64, 32) };
        Ok(TransportResponse::new(200, create_png_bytes(width, height)))
    }
}

fn loader(server: Arc<ImageServer>) -> (Dispatcher, ImageLoader) {
    let config = DispatcherConfig {
        worker_threads: 2,
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(config, server).expect("dispatcher init failed");
    let image_config = ImageConfig {
        cache_capacity_bytes: 4 * 1024 * 1024,
        ..ImageConfig::with_profile(ImagePerformanceProfile::Balanced)
    };
    let loader = ImageLoader::from_config(dispatcher.clone(), image_config).expect("loader init failed");
    (dispatcher, loader)
}

#[tokio::test]
async fn concurrent_identical_loads_share_one_request() {
    let server = ImageServer::new(Duration::from_millis(200));
    let (_dispatcher, loader) = loader(server.clone());

    let handles: Vec<_> = (0..5).map(|_| loader.load("http://img.test/wide.png", 0, 0)).collect();
    let mut images = Vec::new();
    for handle in handles {
        images.push(handle.await.expect("image load failed"));
    }

    assert_eq!(server.calls(), 1);
    assert!(images.iter().all(|image| Arc::ptr_eq(image, &images[0])));
    assert_eq!((images[0].width(), images[0].height()), (64, 32));
}

#[tokio::test]
async fn downsampled_result_is_cached_per_target_size() {
    let server = ImageServer::new(Duration::ZERO);
    let (_dispatcher, loader) = loader(server.clone());
    let url = "http://img.test/wide.png";

    let thumb = loader.load(url, 16, 16).await.expect("image load failed");
    assert_eq!((thumb.width(), thumb.height()), (16, 8));
    assert!(loader.cache().contains(&image_cache_key(url, 16, 16)));

    let again = loader.load(url, 16, 16).await.expect("cached load failed");
    assert!(Arc::ptr_eq(&thumb, &again));
    assert_eq!(server.calls(), 1);

    let full = loader.load(url, 0, 0).await.expect("full size load failed");
    assert_eq!((full.width(), full.height()), (64, 32));
    assert_eq!(server.calls(), 2);
    assert!(loader.cached(url, 0, 0).is_some());
}

#[tokio::test]
async fn cancelling_image_requests_notifies_every_waiter() {
    let server = ImageServer::new(Duration::ZERO);
    let (dispatcher, loader) = loader(server.clone());
    let url = "http://img.test/wide.png";

    dispatcher.pause();
    let first = loader.load(url, 0, 0);
    let second = loader.load(url, 0, 0);
    assert_eq!(dispatcher.cancel_all(IMAGE_REQUEST_TAG), 1);

    assert_eq!(first.await, Err(RequestError::Cancelled));
    assert_eq!(second.await, Err(RequestError::Cancelled));

    dispatcher.resume();
    let retried = loader.load(url, 0, 0).await.expect("fresh load after cancel failed");
    assert_eq!(retried.width(), 64);
    assert_eq!(server.calls(), 1);
}

#[tokio::test]
async fn cancelling_one_waiter_keeps_the_shared_request() {
    let server = ImageServer::new(Duration::ZERO);
    let (dispatcher, loader) = loader(server.clone());
    let url = "http://img.test/wide.png";

    dispatcher.pause();
    let first = loader.load(url, 0, 0);
    let second = loader.load(url, 0, 0);
    assert!(first.cancel());
    assert_eq!(dispatcher.pending(), 1);

    dispatcher.resume();
    assert_eq!(first.await, Err(RequestError::Cancelled));
    assert!(second.await.is_ok());
    assert_eq!(server.calls(), 1);
}

#[tokio::test]
async fn cancelling_last_waiter_cancels_the_request() {
    let server = ImageServer::new(Duration::ZERO);
    let (dispatcher, loader) = loader(server.clone());

    dispatcher.pause();
    let only = loader.load("http://img.test/wide.png", 0, 0);
    assert!(only.cancel());
    assert_eq!(dispatcher.pending(), 0);
    assert!(!only.cancel());

    dispatcher.resume();
    assert_eq!(only.await, Err(RequestError::Cancelled));
    assert_eq!(server.calls(), 0);
}

#[tokio::test]
async fn failed_download_reaches_all_waiters() {
    let server = ImageServer::new(Duration::from_millis(50));
    let (_dispatcher, loader) = loader(server.clone());

    let first = loader.load("http://img.test/missing", 0, 0);
    let second = loader.load("http://img.test/missing", 0, 0);

    assert!(matches!(first.await, Err(RequestError::TransportIo { transient: false, .. })));
    assert!(matches!(second.await, Err(RequestError::TransportIo { transient: false, .. })));
    assert!(loader.cached("http://img.test/missing", 0, 0).is_none());
}

#[tokio::test]
async fn data_url_is_decoded_without_network() {
    let server = ImageServer::new(Duration::ZERO);
    let (_dispatcher, loader) = loader(server.clone());
    let encoded = base64::engine::general_purpose::STANDARD.encode(create_png_bytes(20, 10));
    let url = format!("data:image/png;base64,{}", encoded);

    let image = loader.load(&url, 10, 10).await.expect("data url decode failed");

    assert_eq!((image.width(), image.height()), (10, 5));
    assert_eq!(server.calls(), 0);
    assert!(loader.cached(&url, 10, 10).is_some());
}

#[tokio::test]
async fn slot_delivers_only_the_latest_url() {
    let server = ImageServer::new(Duration::ZERO);
    let (dispatcher, loader) = loader(server.clone());
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

    let slot = ImageSlot::new(loader, 16, 16, move |result| {
        let _ = sender.send(result);
    });

    dispatcher.pause();
    slot.set_url("http://img.test/wide.png");
    slot.set_url("http://img.test/tall.png");
    assert_eq!(dispatcher.pending(), 1);
    dispatcher.resume();

    let delivered = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("slot listener timed out")
        .expect("listener channel closed")
        .expect("slot load failed");

    assert_eq!((delivered.width(), delivered.height()), (8, 16));
    assert_eq!(slot.url().as_deref(), Some("http://img.test/tall.png"));
    assert_eq!(
        *server.seen.lock().expect("seen lock poisoned"),
        vec!["http://img.test/tall.png".to_string()]
    );
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn slot_resize_reloads_at_new_dimensions() {
    let server = ImageServer::new(Duration::ZERO);
    let (_dispatcher, loader) = loader(server.clone());
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

    let slot = ImageSlot::new(loader.clone(), 32, 32, move |result| {
        let _ = sender.send(result);
    });
    slot.set_url("http://img.test/wide.png");
    let first = receiver.recv().await.expect("listener channel closed").expect("slot load failed");
    assert_eq!((first.width(), first.height()), (32, 16));

    slot.set_size(16, 16);
    assert_eq!(slot.size(), (16, 16));
    let second = receiver.recv().await.expect("listener channel closed").expect("slot load failed");
    assert_eq!((second.width(), second.height()), (16, 8));

    assert!(loader.cached("http://img.test/wide.png", 32, 32).is_some());
    assert!(loader.cached("http://img.test/wide.png", 16, 16).is_some());
    assert_eq!(server.calls(), 2);
}

#[tokio::test]
async fn loaders_sharing_a_cache_reuse_each_others_results() {
    let server = ImageServer::new(Duration::ZERO);
    let (dispatcher, first) = loader(server.clone());
    let cache = Arc::new(BoundedImageCache::new(1024 * 1024));
    let a = ImageLoader::new(dispatcher.clone(), cache.clone(), ImageConfig::default()).expect("loader init failed");
    let b = ImageLoader::new(dispatcher, cache.clone(), ImageConfig::default()).expect("loader init failed");

    a.load("http://img.test/tall.png", 0, 0).await.expect("image load failed");
    let reused = b.load("http://img.test/tall.png", 0, 0).await.expect("cached load failed");

    assert_eq!((reused.width(), reused.height()), (32, 64));
    assert_eq!(cache.total_bytes(), 32 * 64 * 4);
    assert_eq!(server.calls(), 1);
    assert!(first.cached("http://img.test/tall.png", 0, 0).is_none());
}
