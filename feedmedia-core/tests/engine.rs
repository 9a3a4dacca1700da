mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use feedmedia_core::{
    DiskLimits, DiskSpillover, EngineError, EngineEvent, ItemId, LoadOutcome,
    LoadRequest, LoadSource, MediaEngine, MediaRef, Priority, RequestState,
    VideoVariant,
};
use support::*;
use tempfile::tempdir;
use url::Url;

fn items(n: usize) -> Vec<ItemId> {
    (0..n).map(|i| ItemId::new(format!("post{i}"))).collect()
}

#[tokio::test]
async fn duplicate_submissions_share_one_network_call() {
    init_tracing();
    let (transport, gate) = FakeTransport::gated();
    transport.script(&url_for("a"), vec![Reply::png(png(4, 4))]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(4), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    let delivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let delivered = delivered.clone();
        let request = LoadRequest::new(image_ref("a"), Priority::Normal)
            .on_result(move |outcome| {
                assert!(matches!(outcome, LoadOutcome::Loaded(_)));
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        engine.submit(request).unwrap();
    }

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.queued, 0);

    gate.add_permits(1);
    wait_for(&mut events, is_loaded("a")).await;
    engine.stats().await.unwrap();

    assert_eq!(transport.calls(&url_for("a")), 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 5);
    assert_eq!(
        engine.state(&key("a")).await.unwrap(),
        Some(RequestState::Completed)
    );
    assert!(engine.cached(&key("a")).await.unwrap().is_some());
}

#[tokio::test]
async fn excess_high_priority_requests_stay_pending() {
    let (transport, _gate) = FakeTransport::gated();
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), None).unwrap();

    for name in ["k0", "k1", "k2", "k3"] {
        engine
            .submit(LoadRequest::new(image_ref(name), Priority::High))
            .unwrap();
    }

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.queued, 2);
    assert_eq!(
        engine.state(&key("k0")).await.unwrap(),
        Some(RequestState::Active)
    );
    assert_eq!(
        engine.state(&key("k3")).await.unwrap(),
        Some(RequestState::Pending)
    );
}

#[tokio::test]
async fn freed_slot_promotes_pending_request_exactly_once() {
    let (transport, gate) = FakeTransport::gated();
    transport.script(&url_for("busy"), vec![Reply::png(png(2, 2))]);
    transport.script(&url_for("a"), vec![Reply::png(png(2, 2))]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(1), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(image_ref("busy"), Priority::High))
        .unwrap();
    engine
        .submit(LoadRequest::new(image_ref("a"), Priority::Normal))
        .unwrap();
    assert_eq!(
        engine.state(&key("a")).await.unwrap(),
        Some(RequestState::Pending)
    );
    assert_eq!(transport.calls(&url_for("a")), 0);

    gate.add_permits(1);
    wait_for(&mut events, is_loaded("busy")).await;
    assert_eq!(
        engine.state(&key("a")).await.unwrap(),
        Some(RequestState::Active)
    );
    assert_eq!(engine.stats().await.unwrap().active, 1);

    gate.add_permits(1);
    wait_for(&mut events, is_loaded("a")).await;
    assert_eq!(transport.calls(&url_for("a")), 1);
}

#[tokio::test]
async fn cancelled_pending_request_never_starts() {
    let (transport, gate) = FakeTransport::gated();
    transport.script(&url_for("busy"), vec![Reply::png(png(2, 2))]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(1), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(image_ref("busy"), Priority::High))
        .unwrap();
    engine
        .submit(LoadRequest::new(image_ref("a"), Priority::Normal))
        .unwrap();
    engine.cancel(&key("a")).unwrap();
    wait_for(&mut events, is_cancelled("a")).await;
    assert_eq!(engine.stats().await.unwrap().queued, 0);

    gate.add_permits(1);
    wait_for(&mut events, is_loaded("busy")).await;
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(transport.calls(&url_for("a")), 0);
    assert_eq!(
        engine.state(&key("a")).await.unwrap(),
        Some(RequestState::Cancelled)
    );
}

#[tokio::test]
async fn result_arriving_after_cancellation_is_discarded() {
    let (transport, gate) = FakeTransport::gated();
    let transport = transport.ignoring_cancellation();
    transport.script(&url_for("a"), vec![Reply::png(png(2, 2))]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    let called = Arc::new(AtomicUsize::new(0));
    let called_in_cb = called.clone();
    let request = LoadRequest::new(image_ref("a"), Priority::Normal)
        .on_result(move |_| {
            called_in_cb.fetch_add(1, Ordering::SeqCst);
        });
    engine.submit(request).unwrap();
    assert_eq!(engine.stats().await.unwrap().active, 1);

    engine.cancel(&key("a")).unwrap();
    gate.add_permits(1);
    wait_for(&mut events, is_cancelled("a")).await;

    assert!(engine.cached(&key("a")).await.unwrap().is_none());
    assert_eq!(
        engine.state(&key("a")).await.unwrap(),
        Some(RequestState::Cancelled)
    );
    assert_eq!(engine.stats().await.unwrap().active, 0);
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_give_up_until_manual_retry() {
    let transport = FakeTransport::new();
    transport.script(&url_for("b"), vec![Reply::status(503)]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(4), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let request = LoadRequest::new(image_ref("b"), Priority::High)
        .on_result(move |outcome| {
            let _ = tx.send(outcome);
        });
    engine.submit(request).unwrap();

    let mut delays = Vec::new();
    loop {
        match wait_for(&mut events, is_failed("b")).await {
            EngineEvent::Failed {
                retry_in: Some(delay),
                ..
            } => delays.push(delay),
            EngineEvent::Failed { retry_in: None, .. } => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(transport.calls(&url_for("b")), 3);
    assert!(matches!(rx.await.unwrap(), LoadOutcome::GaveUp(_)));

    // Past the cap a plain submission is a no-op.
    engine
        .submit(LoadRequest::new(image_ref("b"), Priority::High))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.calls(&url_for("b")), 3);
    assert_eq!(
        engine.state(&key("b")).await.unwrap(),
        Some(RequestState::Failed)
    );

    engine.retry(&key("b")).unwrap();
    engine
        .submit(LoadRequest::new(image_ref("b"), Priority::High))
        .unwrap();
    match wait_for(&mut events, is_failed("b")).await {
        EngineEvent::Failed { retry_in, .. } => {
            assert_eq!(retry_in, Some(Duration::from_secs(1)));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(transport.calls(&url_for("b")), 4);
}

#[tokio::test]
async fn html_error_page_is_rejected_permanently() {
    let transport = FakeTransport::new();
    transport.script(&url_for("html"), vec![Reply::html()]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(4), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine
        .register_item_media(ItemId::new("post0"), vec![image_ref("html")])
        .unwrap();
    engine.set_visibility(items(4), 0).await.unwrap();
    wait_for(&mut events, is_rejected("html")).await;
    assert_eq!(
        engine.state(&key("html")).await.unwrap(),
        Some(RequestState::PermanentlyRejected)
    );

    // Scrolling away and back is not enough.
    engine.set_current_index(1).await.unwrap();
    engine.set_current_index(0).await.unwrap();
    engine
        .submit(LoadRequest::new(image_ref("html"), Priority::Critical))
        .unwrap();
    engine.stats().await.unwrap();
    assert_eq!(transport.calls(&url_for("html")), 1);

    // A manual retry resubmits the still-visible key.
    engine.retry(&key("html")).unwrap();
    wait_for(&mut events, is_rejected("html")).await;
    assert_eq!(transport.calls(&url_for("html")), 2);
    assert_eq!(engine.stats().await.unwrap().permanently_rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn reappearance_resets_retry_budget() {
    let transport = FakeTransport::new();
    transport.script(&url_for("flaky"), vec![Reply::status(500)]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(4), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine
        .register_item_media(ItemId::new("post0"), vec![image_ref("flaky")])
        .unwrap();
    engine.set_visibility(items(6), 0).await.unwrap();
    loop {
        if let EngineEvent::Failed { retry_in: None, .. } =
            wait_for(&mut events, is_failed("flaky")).await
        {
            break;
        }
    }
    assert_eq!(transport.calls(&url_for("flaky")), 3);

    // Two behind is stale; coming back counts as a fresh opportunity.
    engine.set_current_index(2).await.unwrap();
    engine.set_current_index(0).await.unwrap();
    wait_for(&mut events, is_failed("flaky")).await;
    assert_eq!(transport.calls(&url_for("flaky")), 4);
}

#[tokio::test(start_paused = true)]
async fn scrolling_away_cancels_in_batches() {
    let (transport, _gate) = FakeTransport::gated();
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(8), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    for i in 0..6 {
        engine
            .register_item_media(
                ItemId::new(format!("post{i}")),
                vec![image_ref(&format!("m{i}"))],
            )
            .unwrap();
    }
    engine.set_visibility(items(6), 0).await.unwrap();
    assert_eq!(engine.stats().await.unwrap().active, 4);

    engine.set_current_index(3).await.unwrap();
    let snapshot = engine.visibility().await.unwrap();
    assert_eq!(snapshot.current_index, Some(3));
    assert_eq!(snapshot.pending_cancellations, 2);

    wait_for_all(&mut events, vec![is_cancelled("m0"), is_cancelled("m1")])
        .await;
    assert_eq!(engine.visibility().await.unwrap().pending_cancellations, 0);
    assert_eq!(
        engine.state(&key("m2")).await.unwrap(),
        Some(RequestState::Active)
    );
}

#[tokio::test]
async fn out_of_range_index_and_malformed_requests_fail_fast() {
    let transport = Arc::new(FakeTransport::new());
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport, None).unwrap();

    engine.set_visibility(items(3), 1).await.unwrap();
    let err = engine.set_current_index(3).await.unwrap_err();
    assert!(matches!(err, EngineError::IndexOutOfRange { index: 3, len: 3 }));
    assert_eq!(engine.visibility().await.unwrap().current_index, Some(1));

    let ftp_url = Url::parse("ftp://cdn.example.com/k.png").unwrap();
    let ftp = MediaRef::image("k", ftp_url);
    let err = engine
        .submit(LoadRequest::new(ftp, Priority::Normal))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let blank = MediaRef::image("", Url::parse(&url_for("blank")).unwrap());
    assert!(engine.submit(LoadRequest::new(blank, Priority::Normal)).is_err());
}

#[tokio::test]
async fn disk_hit_skips_the_network() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(
        DiskSpillover::open(
            dir.path().join("spill"),
            DiskLimits {
                max_bytes: feedmedia_core::ByteSize::from_mib(8),
                max_age: Duration::from_secs(3600),
            },
        )
        .unwrap(),
    );
    disk.write(&key("a"), &png(3, 5)).await.unwrap();

    let transport = Arc::new(FakeTransport::new());
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), Some(disk))
            .unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(image_ref("a"), Priority::Normal))
        .unwrap();
    match wait_for(&mut events, is_loaded("a")).await {
        EngineEvent::Loaded { source, .. } => {
            assert_eq!(source, LoadSource::Disk)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(transport.total_calls(), 0);

    let cached = engine.cached(&key("a")).await.unwrap().unwrap();
    let image = cached.as_image().unwrap();
    assert_eq!((image.width, image.height), (3, 5));
}

#[tokio::test]
async fn network_load_is_persisted_to_disk() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(
        DiskSpillover::open(
            dir.path().join("spill"),
            DiskLimits {
                max_bytes: feedmedia_core::ByteSize::from_mib(8),
                max_age: Duration::from_secs(3600),
            },
        )
        .unwrap(),
    );
    let bytes = png(6, 6);
    let transport = FakeTransport::new();
    transport.script(&url_for("fresh"), vec![Reply::png(bytes.clone())]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport, Some(disk.clone()))
            .unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(image_ref("fresh"), Priority::Normal))
        .unwrap();
    match wait_for(&mut events, is_loaded("fresh")).await {
        EngineEvent::Loaded { source, .. } => {
            assert_eq!(source, LoadSource::Network)
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut stored = None;
    for _ in 0..100 {
        stored = disk.read(&key("fresh")).await;
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Under the byte target the derivative is the original payload.
    assert_eq!(stored, Some(bytes));
}

#[tokio::test]
async fn memory_warning_cancels_below_high_and_degrades_admission() {
    let (transport, _gate) = FakeTransport::gated();
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(4), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine.submit(LoadRequest::new(image_ref("hi"), Priority::High)).unwrap();
    engine
        .submit(LoadRequest::new(image_ref("mid"), Priority::Normal))
        .unwrap();
    engine.submit(LoadRequest::new(image_ref("lo"), Priority::Low)).unwrap();
    assert_eq!(engine.stats().await.unwrap().active, 3);

    engine.notify_memory_warning().unwrap();
    wait_for_all(&mut events, vec![is_cancelled("mid"), is_cancelled("lo")])
        .await;
    assert_eq!(
        engine.state(&key("hi")).await.unwrap(),
        Some(RequestState::Active)
    );

    // Headroom exists, but pressure routes low priority work to the queue.
    engine.submit(LoadRequest::new(image_ref("late"), Priority::Low)).unwrap();
    let stats = engine.stats().await.unwrap();
    assert!(stats.under_pressure);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(
        engine.state(&key("late")).await.unwrap(),
        Some(RequestState::Pending)
    );
}

#[tokio::test]
async fn video_resolves_to_master_playlist_without_download() {
    let transport = FakeTransport::new();
    transport.probe_ok(
        "https://cdn.example.com/v/clip/master.m3u8",
        "application/vnd.apple.mpegurl",
    );
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    let clip = MediaRef::video(
        "clip",
        Url::parse("https://cdn.example.com/v/clip.mp4").unwrap(),
    );
    engine.submit(LoadRequest::new(clip, Priority::High)).unwrap();
    wait_for(&mut events, is_loaded("clip")).await;

    let cached = engine.cached(&key("clip")).await.unwrap().unwrap();
    let asset = cached.as_video().unwrap();
    assert_eq!(asset.variant, VideoVariant::Master);
    assert_eq!(
        asset.playable.as_str(),
        "https://cdn.example.com/v/clip/master.m3u8"
    );
    assert_eq!(transport.total_calls(), 0);
}

fn clip_ref(name: &str) -> MediaRef {
    let locator = format!("https://cdn.example.com/v/{name}.mp4");
    MediaRef::video(name, Url::parse(&locator).unwrap())
}

#[tokio::test]
async fn video_falls_back_to_the_variant_then_the_raw_file() {
    let transport = FakeTransport::new();
    transport.head_reply(
        "https://cdn.example.com/v/single/playlist.m3u8",
        200,
        Some("application/vnd.apple.mpegurl"),
    );
    transport.probe_ok("https://cdn.example.com/v/plain.mp4", "video/mp4");
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    for name in ["single", "plain"] {
        engine
            .submit(LoadRequest::new(clip_ref(name), Priority::High))
            .unwrap();
    }
    wait_for_all(&mut events, vec![is_loaded("single"), is_loaded("plain")])
        .await;

    let single = engine.cached(&key("single")).await.unwrap().unwrap();
    assert_eq!(single.as_video().unwrap().variant, VideoVariant::Variant);
    let plain = engine.cached(&key("plain")).await.unwrap().unwrap();
    let plain = plain.as_video().unwrap();
    assert_eq!(plain.variant, VideoVariant::Progressive);
    assert_eq!(plain.playable.as_str(), "https://cdn.example.com/v/plain.mp4");
    assert_eq!(transport.total_calls(), 0);
}

#[tokio::test]
async fn video_locator_serving_html_is_rejected() {
    let transport = FakeTransport::new();
    transport.probe_ok("https://cdn.example.com/v/page.mp4", "text/html");
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport, None).unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(clip_ref("page"), Priority::High))
        .unwrap();
    wait_for(&mut events, is_rejected("page")).await;
    assert_eq!(
        engine.state(&key("page")).await.unwrap(),
        Some(RequestState::PermanentlyRejected)
    );
}

#[tokio::test(start_paused = true)]
async fn video_locator_error_status_fails_transiently() {
    let transport = FakeTransport::new();
    transport.head_reply("https://cdn.example.com/v/down.mp4", 503, None);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport, None).unwrap();
    let mut events = engine.subscribe();

    engine
        .submit(LoadRequest::new(clip_ref("down"), Priority::High))
        .unwrap();
    match wait_for(&mut events, is_failed("down")).await {
        EngineEvent::Failed { retry_in, .. } => {
            assert_eq!(retry_in, Some(Duration::from_secs(1)));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_ne!(
        engine.state(&key("down")).await.unwrap(),
        Some(RequestState::PermanentlyRejected)
    );
    assert_eq!(engine.stats().await.unwrap().permanently_rejected, 0);
}

#[tokio::test]
async fn clear_all_resets_caches_and_rejections() {
    let transport = FakeTransport::new();
    transport.script(&url_for("ok"), vec![Reply::png(png(2, 2))]);
    transport.script(&url_for("html"), vec![Reply::html()]);
    let transport = Arc::new(transport);
    let (engine, _join) =
        MediaEngine::start(test_config(2), transport.clone(), None).unwrap();
    let mut events = engine.subscribe();

    engine.submit(LoadRequest::new(image_ref("ok"), Priority::Normal)).unwrap();
    engine
        .submit(LoadRequest::new(image_ref("html"), Priority::Normal))
        .unwrap();
    wait_for_all(&mut events, vec![is_loaded("ok"), is_rejected("html")])
        .await;

    engine.clear_all().await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.prepared_entries, 0);
    assert_eq!(stats.permanently_rejected, 0);
    assert_eq!(engine.state(&key("html")).await.unwrap(), None);

    engine
        .submit(LoadRequest::new(image_ref("html"), Priority::Normal))
        .unwrap();
    wait_for(&mut events, is_rejected("html")).await;
    assert_eq!(transport.calls(&url_for("html")), 2);
}

#[tokio::test]
async fn shutdown_stops_the_actor() {
    let transport = Arc::new(FakeTransport::new());
    let (engine, join) =
        MediaEngine::start(test_config(2), transport, None).unwrap();

    engine.shutdown();
    join.await.unwrap();
    assert!(matches!(engine.stats().await, Err(EngineError::Stopped)));
    assert!(matches!(
        engine.submit(LoadRequest::new(image_ref("a"), Priority::Normal)),
        Err(EngineError::Stopped)
    ));
}

#[derive(Debug)]
struct Decoder {
    healthy: bool,
}

impl feedmedia_core::cache::CachePayload for Decoder {
    fn cost(&self) -> u64 {
        1
    }
}

impl feedmedia_core::LiveResource for Decoder {
    fn reconcile(&mut self) -> bool {
        self.healthy
    }
}

#[tokio::test]
async fn lifecycle_round_trip_reconciles_and_releases_live_handles() {
    let transport = Arc::new(FakeTransport::new());
    let mut builder = MediaEngine::builder(test_config(2))
        .transport(transport)
        .without_disk();
    let decoders = builder.new_live_cache::<Decoder>("decoders");
    let (engine, _join) = builder.start().unwrap();

    decoders.insert(key("ok"), Decoder { healthy: true });
    decoders.insert(key("dead"), Decoder { healthy: false });
    assert_eq!(engine.stats().await.unwrap().live_entries, 2);

    // Foregrounding without a prior background leaves handles alone.
    engine
        .notify_lifecycle(feedmedia_core::LifecycleState::Foregrounded)
        .unwrap();
    assert_eq!(engine.stats().await.unwrap().live_entries, 2);

    engine
        .notify_lifecycle(feedmedia_core::LifecycleState::Backgrounded)
        .unwrap();
    engine
        .notify_lifecycle(feedmedia_core::LifecycleState::Foregrounded)
        .unwrap();
    engine.stats().await.unwrap();
    assert!(decoders.contains(&key("ok")));
    assert!(!decoders.contains(&key("dead")));

    engine.notify_memory_warning().unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.live_entries, 0);
}
