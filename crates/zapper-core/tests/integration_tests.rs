//! Integration tests for Zapper Core

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use url::Url;
use zapper_core::{
    ChannelDescriptor, ChannelSwitcher, CollaboratorMessage, ControllerConfig, DrmConfig,
    EngineFactory, EngineFault, EngineRequest, FaultCategory, FaultSender, JsonFileStore,
    KeyHarvester, KeyValueStore, MemoryKeySlot, MemoryStore, OfflineRegistry, PlaybackEngine,
    RequestFilter, RequestKind, Result, SchemeResolver, StreamingConfig, SwitchOutcome,
    SwitchPhase, VideoSink,
};

// =============================================================================
// Scripted engine
// =============================================================================

const KEY_HEX: &str = "00112233445566778899aabbccddeeff";

/// Shared view of every engine the factory produced
#[derive(Default)]
struct Tally {
    live: AtomicUsize,
    attached: AtomicUsize,
    overlap: AtomicBool,
    loads: AtomicUsize,
    events: Mutex<Vec<String>>,
    senders: Mutex<Vec<FaultSender>>,
}

impl Tally {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn sender(&self, index: usize) -> FaultSender {
        self.senders.lock().unwrap()[index].clone()
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Behaviour is picked from the stream path:
/// `hang` never finishes, `fail` rejects the load, `flaky` reports a
/// recoverable fault, `crash` reports a critical fault, `slowexit` takes
/// 200ms to tear down, and `harvest` fetches its key through the relay like
/// a real DRM client would.
struct ScriptedEngine {
    tally: Arc<Tally>,
    faults: FaultSender,
    filters: Vec<Arc<dyn RequestFilter>>,
    schemes: HashMap<String, Arc<dyn SchemeResolver>>,
    attached: bool,
    slow_exit: bool,
}

#[async_trait]
impl PlaybackEngine for ScriptedEngine {
    fn configure_streaming(&mut self, config: &StreamingConfig) -> Result<()> {
        assert_eq!(config.buffering_goal, 30.0);
        Ok(())
    }

    fn configure_drm(&mut self, drm: &DrmConfig) -> Result<()> {
        self.tally
            .record(format!("drm:{}:{}", self.faults.channel_id(), drm.mode()));
        Ok(())
    }

    fn register_request_filter(&mut self, filter: Arc<dyn RequestFilter>) {
        self.filters.push(filter);
    }

    fn register_scheme(&mut self, scheme: &str, resolver: Arc<dyn SchemeResolver>) {
        self.schemes.insert(scheme.to_string(), resolver);
    }

    async fn attach(&mut self, _sink: &VideoSink) -> Result<()> {
        if self.tally.attached.fetch_add(1, Ordering::SeqCst) > 0 {
            self.tally.overlap.store(true, Ordering::SeqCst);
        }
        self.attached = true;
        self.tally.record(format!("attach:{}", self.faults.channel_id()));
        Ok(())
    }

    async fn load(&mut self, url: &Url, _start: f64, _mime: Option<&'static str>) -> Result<()> {
        self.tally.loads.fetch_add(1, Ordering::SeqCst);
        self.tally.record(format!("load:{}", self.faults.channel_id()));
        let path = url.path().to_string();
        self.slow_exit = path.contains("slowexit");

        if path.contains("hang") {
            std::future::pending::<()>().await;
        }
        if path.contains("fail") {
            return Err(EngineFault::critical("1002", FaultCategory::Network, "manifest 404").into());
        }
        if path.contains("flaky") {
            self.faults.emit(EngineFault::recoverable(
                "1001",
                FaultCategory::Network,
                "segment 503",
            ));
        }
        if path.contains("crash") {
            self.faults
                .emit(EngineFault::critical("3016", FaultCategory::Media, "decode failed"));
        }
        if path.contains("harvest") {
            let relay = Url::parse("https://keyrelay.zapper.local/widevine").unwrap();
            let mut request = EngineRequest::new(RequestKind::License, relay);
            for filter in &self.filters {
                filter.filter(&mut request);
            }
            let resolver = self
                .schemes
                .get(request.uri.scheme())
                .cloned()
                .ok_or_else(|| EngineFault::critical("6001", FaultCategory::Drm, "no key source"))?;
            let key = resolver.resolve(&request.uri).await?;
            self.tally.record(format!("key:{}", hex::encode(&key)));
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.slow_exit {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if std::mem::take(&mut self.attached) {
            self.tally.attached.fetch_sub(1, Ordering::SeqCst);
        }
        self.tally.live.fetch_sub(1, Ordering::SeqCst);
        self.tally.record(format!("destroy:{}", self.faults.channel_id()));
        Ok(())
    }
}

struct ScriptedFactory {
    tally: Arc<Tally>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, faults: FaultSender) -> Result<Box<dyn PlaybackEngine>> {
        self.tally.live.fetch_add(1, Ordering::SeqCst);
        self.tally.senders.lock().unwrap().push(faults.clone());
        Ok(Box::new(ScriptedEngine {
            tally: self.tally.clone(),
            faults,
            filters: Vec::new(),
            schemes: HashMap::new(),
            attached: false,
            slow_exit: false,
        }))
    }
}

fn channel(id: &str, path: &str) -> ChannelDescriptor {
    ChannelDescriptor::new(id, id.to_uppercase(), format!("https://cdn.example.com/{path}"))
}

async fn controller(channels: Vec<ChannelDescriptor>) -> (Arc<Tally>, Arc<ChannelSwitcher>) {
    let tally = Arc::new(Tally::default());
    let switcher = ChannelSwitcher::with_store(
        Arc::new(ScriptedFactory { tally: tally.clone() }),
        Arc::new(MemoryStore::new()),
        ControllerConfig::default(),
        VideoSink::default(),
    );
    switcher.set_channels(channels).await;
    (tally, Arc::new(switcher))
}

fn is_offline(switcher: &ChannelSwitcher, id: &str) -> bool {
    switcher.classifier().registry().is_offline(id).unwrap()
}

// =============================================================================
// DRM Resolution
// =============================================================================

#[test]
fn test_clearkey_descriptor_yields_single_pair() {
    let drm = DrmConfig::resolve(Some("0123456789abcdef0123456789abcdef:00112233445566778899aabbccddeeff"));
    match drm {
        DrmConfig::ClearKey { keys, .. } => {
            assert_eq!(keys.len(), 1);
            assert_eq!(
                keys.get("0123456789abcdef0123456789abcdef").map(String::as_str),
                Some("00112233445566778899aabbccddeeff")
            );
        }
        other => panic!("expected clear-key config, got {other:?}"),
    }
}

#[test]
fn test_license_server_url_is_verbatim() {
    let license = "https://license.example.com/wv?token=a:b&x=1";
    match DrmConfig::resolve(Some(license)) {
        DrmConfig::LicenseServer { url, .. } => assert_eq!(url, license),
        other => panic!("expected license server, got {other:?}"),
    }
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_switch_destroys_previous_before_attach() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8"), channel("b", "b.mpd")]).await;

    assert_ok!(switcher.select_index(0).await);
    assert_ok!(switcher.select_index(1).await);

    let events = tally.events();
    let destroy_a = events.iter().position(|e| e == "destroy:a").unwrap();
    let attach_b = events.iter().position(|e| e == "attach:b").unwrap();
    assert!(destroy_a < attach_b);
    assert!(!tally.overlap.load(Ordering::SeqCst));
    assert_eq!(tally.live.load(Ordering::SeqCst), 1);
    assert_eq!(tally.attached.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_releases_engine() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8")]).await;
    assert_ok!(switcher.select_index(0).await);

    switcher.shutdown().await;
    assert_eq!(tally.live.load(Ordering::SeqCst), 0);
    assert_eq!(switcher.session_id().await, None);
}

// =============================================================================
// Channel switching
// =============================================================================

#[tokio::test]
async fn test_navigate_relative_wraps_both_ways() {
    let (_tally, switcher) = controller(vec![
        channel("a", "a.m3u8"),
        channel("b", "b.m3u8"),
        channel("c", "c.m3u8"),
    ])
    .await;

    assert_ok!(switcher.navigate_relative(-1).await);
    assert_eq!(switcher.current_index().await, Some(2));
    assert_ok!(switcher.navigate_relative(1).await);
    assert_eq!(switcher.current_index().await, Some(0));
    assert_ok!(switcher.navigate_relative(-4).await);
    assert_eq!(switcher.current_index().await, Some(2));
}

#[tokio::test]
async fn test_reselecting_current_channel_is_noop() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8")]).await;
    assert_ok!(switcher.select_index(0).await);
    let mut phases = switcher.subscribe_phase();
    phases.borrow_and_update();

    let outcome = assert_ok!(switcher.select_index(0).await);
    assert_eq!(outcome, SwitchOutcome::Unchanged);
    assert_eq!(tally.loads(), 1);
    assert!(!phases.has_changed().unwrap());
    assert_eq!(switcher.phase().await, SwitchPhase::Playing);
}

#[tokio::test]
async fn test_newer_switch_supersedes_hung_load() {
    let (tally, switcher) = controller(vec![channel("a", "hang.m3u8"), channel("b", "b.m3u8")]).await;

    let (first, second) = tokio::join!(switcher.select_index(0), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        switcher.select_index(1).await
    });

    assert_eq!(assert_ok!(first), SwitchOutcome::Superseded);
    assert!(matches!(assert_ok!(second), SwitchOutcome::Playing(_)));
    assert_eq!(switcher.current_channel().await.unwrap().id, "b");
    assert_eq!(switcher.phase().await, SwitchPhase::Playing);
    assert!(!is_offline(&switcher, "a"));
    assert_eq!(tally.live.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_newer_switch_during_teardown_skips_pending_load() {
    let (tally, switcher) = controller(vec![
        channel("x", "slowexit.m3u8"),
        channel("a", "hang.m3u8"),
        channel("c", "c.m3u8"),
    ])
    .await;
    assert_ok!(switcher.select_index(0).await);

    let start = tokio::time::Instant::now();
    let (first, second) = assert_ok!(
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(switcher.select_index(1), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                switcher.select_index(2).await
            })
        })
        .await
    );

    assert_eq!(assert_ok!(first), SwitchOutcome::Superseded);
    assert!(matches!(assert_ok!(second), SwitchOutcome::Playing(_)));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(switcher.current_channel().await.unwrap().id, "c");
    assert!(!tally.events().iter().any(|e| e == "attach:a"));
    assert_eq!(tally.live.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_selects_settle_on_committed_channel() {
    let channels: Vec<_> = (0..8)
        .map(|i| channel(&format!("ch{i}"), &format!("ch{i}.m3u8")))
        .collect();
    let (tally, switcher) = controller(channels).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let switcher = switcher.clone();
            tokio::spawn(async move { switcher.select_index(i).await })
        })
        .collect();
    for handle in handles {
        assert_ok!(assert_ok!(handle.await));
    }

    let current = switcher.current_channel().await.unwrap();
    let last_attach = tally
        .events()
        .into_iter()
        .filter_map(|e| e.strip_prefix("attach:").map(str::to_string))
        .last()
        .unwrap();
    assert_eq!(last_attach, current.id);
    assert_eq!(switcher.phase().await, SwitchPhase::Playing);
    assert_eq!(tally.live.load(Ordering::SeqCst), 1);
    assert!(!tally.overlap.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_retry_reloads_current_channel() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8")]).await;
    assert_ok!(switcher.select_index(0).await);

    let outcome = assert_ok!(switcher.retry().await);
    assert!(matches!(outcome, SwitchOutcome::Playing(_)));
    assert_eq!(tally.loads(), 2);
}

#[tokio::test]
async fn test_retry_without_channel_errors() {
    let (_tally, switcher) = controller(vec![]).await;
    assert_err!(switcher.retry().await);
}

// =============================================================================
// Fault handling
// =============================================================================

#[tokio::test]
async fn test_critical_fault_during_load_fails_and_marks_offline() {
    let (tally, switcher) = controller(vec![channel("news", "crash.mpd")]).await;

    let outcome = assert_ok!(switcher.select_index(0).await);
    match outcome {
        SwitchOutcome::Failed(classification) => assert_eq!(classification.report.code, "3016"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(switcher.phase().await, SwitchPhase::Failed);
    assert!(is_offline(&switcher, "news"));
    assert_eq!(tally.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_load_fails_and_marks_offline() {
    let (_tally, switcher) = controller(vec![channel("news", "fail.m3u8")]).await;

    assert!(matches!(
        assert_ok!(switcher.select_index(0).await),
        SwitchOutcome::Failed(_)
    ));
    assert!(is_offline(&switcher, "news"));
    assert!(switcher.channel_views().await[0].offline);
}

#[tokio::test]
async fn test_recoverable_fault_keeps_playing() {
    let (_tally, switcher) = controller(vec![channel("news", "flaky.m3u8")]).await;

    assert!(matches!(
        assert_ok!(switcher.select_index(0).await),
        SwitchOutcome::Playing(_)
    ));
    assert_eq!(switcher.phase().await, SwitchPhase::Playing);
    assert!(switcher.classifier().registry().list().unwrap().is_empty());
    assert_eq!(switcher.classifier().recent().len(), 1);
}

#[tokio::test]
async fn test_runtime_fault_and_stale_fault() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8"), channel("b", "b.m3u8")]).await;
    assert_ok!(switcher.select_index(0).await);
    assert_ok!(switcher.select_index(1).await);

    let stale = tally.sender(0);
    assert!(!stale.emit(EngineFault::critical("3016", FaultCategory::Media, "late")));
    assert_eq!(switcher.pump_faults().await, 0);
    assert_eq!(switcher.phase().await, SwitchPhase::Playing);
    assert!(!is_offline(&switcher, "a"));

    let live = tally.sender(1);
    assert!(live.emit(EngineFault::critical("4000", FaultCategory::Streaming, "stream died")));
    assert_eq!(switcher.pump_faults().await, 1);
    assert_eq!(switcher.phase().await, SwitchPhase::Failed);
    assert!(is_offline(&switcher, "b"));
    assert_eq!(switcher.session_id().await, None);
}

#[tokio::test]
async fn test_watch_faults_applies_runtime_faults() {
    let (tally, switcher) = controller(vec![channel("a", "a.m3u8")]).await;
    assert_ok!(switcher.select_index(0).await);

    let shutdown = CancellationToken::new();
    let watcher = {
        let switcher = switcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { switcher.watch_faults(shutdown).await })
    };

    let mut phases = switcher.subscribe_phase();
    tally
        .sender(0)
        .emit(EngineFault::critical("3016", FaultCategory::Media, "decode failed"));
    assert_ok!(phases.wait_for(|phase| *phase == SwitchPhase::Failed).await);
    assert!(is_offline(&switcher, "a"));

    shutdown.cancel();
    assert_ok!(watcher.await);
}

// =============================================================================
// Key harvesting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_harvested_channel_receives_delivered_key() {
    let (tally, switcher) = controller(vec![
        channel("relay", "harvest.mpd").with_harvest_id("relay-page"),
    ])
    .await;

    let (outcome, delivered) = tokio::join!(switcher.select_index(0), async {
        tokio::time::sleep(Duration::from_millis(350)).await;
        switcher
            .harvester()
            .deliver(CollaboratorMessage::KeyCaptured { key: KEY_HEX.to_string() })
    });

    assert_ok!(delivered);
    assert!(matches!(assert_ok!(outcome), SwitchOutcome::Playing(_)));
    assert!(tally.events().contains(&format!("key:{KEY_HEX}")));
}

#[tokio::test(start_paused = true)]
async fn test_harvest_timeout_fails_channel() {
    let (_tally, switcher) = controller(vec![
        channel("relay", "harvest.mpd").with_harvest_id("relay-page"),
    ])
    .await;
    let start = tokio::time::Instant::now();

    let outcome = assert_ok!(switcher.select_index(0).await);
    assert!(start.elapsed() >= Duration::from_millis(15_000));
    match outcome {
        SwitchOutcome::Failed(classification) => {
            assert_eq!(classification.report.code, "HARVEST_TIMEOUT");
            assert_eq!(classification.report.category, FaultCategory::Drm);
        }
        other => panic!("expected harvest timeout, got {other:?}"),
    }
    assert!(is_offline(&switcher, "relay"));
}

#[tokio::test(start_paused = true)]
async fn test_switch_cancels_pending_harvest() {
    let (tally, switcher) = controller(vec![
        channel("relay", "harvest.mpd").with_harvest_id("relay-page"),
        channel("plain", "plain.m3u8"),
    ])
    .await;

    let (first, second) = tokio::join!(switcher.select_index(0), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        switcher.select_index(1).await
    });

    assert_eq!(assert_ok!(first), SwitchOutcome::Superseded);
    assert!(matches!(assert_ok!(second), SwitchOutcome::Playing(_)));
    assert!(!is_offline(&switcher, "relay"));
    assert!(switcher.classifier().recent().is_empty());
    assert_eq!(switcher.harvester().armed_channel(), None);
    assert!(tally.events().iter().all(|e| !e.starts_with("key:")));
}

#[tokio::test(start_paused = true)]
async fn test_empty_slot_times_out_after_exact_budget() {
    let harvester = KeyHarvester::new(Arc::new(MemoryKeySlot::new()), Default::default());
    let uri = zapper_core::harvest::synthetic_key_uri("news");
    let start = tokio::time::Instant::now();

    let err = assert_err!(harvester.resolve_harvested_key(&uri, &CancellationToken::new()).await);
    assert!(matches!(err, zapper_core::Error::HarvestTimeout { attempts: 150 }));
    assert_eq!(start.elapsed(), Duration::from_millis(15_000));
}

// =============================================================================
// Offline registry
// =============================================================================

#[test]
fn test_mark_offline_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(dir.path().join("store.json")));
    let registry = OfflineRegistry::with_default_key(store.clone());

    assert!(registry.mark_offline("news").unwrap());
    assert!(!registry.mark_offline("news").unwrap());

    let reopened = OfflineRegistry::with_default_key(store);
    assert_eq!(reopened.list().unwrap(), vec!["news".to_string()]);
}
